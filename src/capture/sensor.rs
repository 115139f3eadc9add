//! Camera + AR tracking collaborator.

use bytes::Bytes;
use nalgebra::Matrix4;

/// Pixel formats a sensor may hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    Grey8,
    Rgb24,
    Rgba32,
}

impl RawFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            RawFormat::Grey8 => 1,
            RawFormat::Rgb24 => 3,
            RawFormat::Rgba32 => 4,
        }
    }
}

/// Image as acquired from the sensor, before conversion.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub format: RawFormat,
    pub data: Bytes,
}

impl RawImage {
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Sensor intrinsics at the sensor's native resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub resolution: (u32, u32),
    pub focal: (f32, f32),
    pub principal_point: (f32, f32),
}

/// The camera + tracking API the client embeds.
///
/// Frame arrival is a payload-less notification; the pipeline pulls the
/// latest image and pose itself.
pub trait Sensor: Send + Sync {
    fn try_acquire_latest_image(&self) -> Option<RawImage>;

    fn try_get_intrinsics(&self) -> Option<Intrinsics>;

    /// Camera pose in the session space, client convention.
    fn camera_pose(&self) -> Matrix4<f32>;

    /// Stream of frame-arrival notifications. Dropping the receiver
    /// unsubscribes.
    fn frame_arrivals(&self) -> flume::Receiver<()>;
}
