pub mod calibration;
pub mod codec;
pub mod frame;
pub mod sensor;

pub use calibration::{CalibrationResolver, CalibrationStore, CamParameters};
pub use codec::{CodecParams, ConversionParams, FrameCodec, ImageConverter};
pub use frame::{Compression, Frame, Image, PixelLayout, Transformation};
pub use sensor::{Intrinsics, RawFormat, RawImage, Sensor};
