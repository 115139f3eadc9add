pub mod capture;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod pipeline;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capture::calibration::DeviceCalibration;
use crate::capture::{CodecParams, Compression, ConversionParams, PixelLayout, Transformation};
use crate::filter::FilterConfig;
use crate::session::transport::PipelineMode;

pub use error::{Error, Result};

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub filter: FilterConfig,
    pub session: SessionConfig,
    /// Known per-device calibration tables
    pub calibrations: Vec<DeviceCalibration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Maximum frames sent per second, 0 for no limit
    pub framerate: u32,
    /// Requested resolution, scaled down to fit the sensor
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub compression: Compression,
    pub jpg_quality: u8,
    pub transformation: Transformation,
    /// Captures allowed in flight at once
    pub slots: usize,
}

impl CaptureConfig {
    pub fn requested_resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Codec request for frames sent at `resolution`.
    pub fn codec_params(&self, resolution: (u32, u32)) -> CodecParams {
        CodecParams {
            conversion: ConversionParams {
                layout: self.layout,
                resolution,
                transform: self.transformation,
            },
            compression: self.compression,
            quality: self.jpg_quality.clamp(1, 100),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            framerate: 30,
            width: 640,
            height: 480,
            layout: PixelLayout::Grey8,
            compression: Compression::None,
            jpg_quality: 100,
            transformation: Transformation::None,
            slots: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Calibration key; the machine id is used when unset
    pub device_id: Option<String>,
    /// Run incoming poses through the One-Euro filter
    pub smooth_reloc: bool,
    pub mode: PipelineMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            smooth_reloc: true,
            mode: PipelineMode::RelocalizationAndMapping,
        }
    }
}

impl Config {
    /// Defaults, overlaid by the TOML file at `path` (if given) and then by
    /// `RELOC_`-prefixed environment variables, e.g.
    /// `RELOC_CAPTURE__FRAMERATE=15`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("RELOC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn device_id(&self) -> String {
        self.session
            .device_id
            .clone()
            .unwrap_or_else(utils::device_unique_id)
    }
}
