use bytes::Bytes;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use crate::geometry::ServicePose;

/// One client-to-service message: a timestamped camera pose and, usually,
/// the image it was taken with.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sensor_id: u32,

    /// UTC Unix epoch, milliseconds
    pub timestamp_ms: u64,

    /// Camera pose in the session space, service convention
    pub pose: ServicePose,

    pub image: Option<Image>,
}

impl Frame {
    /// Homogeneous matrix carried on the wire.
    pub fn pose_matrix(&self) -> Matrix4<f32> {
        self.pose.to_matrix()
    }
}

/// Image attached to a frame
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub compression: Compression,

    /// Raw pixels when `compression` is `None`, encoded container otherwise.
    /// Grey16 raw buffers are little-endian.
    pub data: Bytes,
}

/// Pixel layouts the service accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelLayout {
    Grey8,
    Grey16,
    Rgb24,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Grey8 => 1,
            PixelLayout::Grey16 => 2,
            PixelLayout::Rgb24 => 3,
        }
    }

    pub fn camera_type(self) -> CameraType {
        match self {
            PixelLayout::Grey8 | PixelLayout::Grey16 => CameraType::Gray,
            PixelLayout::Rgb24 => CameraType::Rgb,
        }
    }
}

/// Still-image codecs applied before sending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Png,
    Jpg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraType {
    Gray,
    Rgb,
}

/// Geometric transform applied while converting a sensor image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Transformation {
    #[default]
    None,
    /// Mirror around the X axis (vertical flip)
    MirrorX,
    /// Mirror around the Y axis (horizontal flip)
    MirrorY,
    /// Both mirrors, i.e. a half turn
    MirrorXY,
}
