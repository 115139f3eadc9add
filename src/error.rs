use thiserror::Error;

use crate::capture::codec::ConversionStatus;
use crate::capture::frame::{Compression, PixelLayout};
use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image conversion failed: {0:?}")]
    ConversionFailed(ConversionStatus),

    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Cannot encode {layout:?} pixels as {compression:?}")]
    UnsupportedEncoding {
        layout: PixelLayout,
        compression: Compression,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Service refused to {0}")]
    Refused(&'static str),

    #[error("Camera intrinsics not available")]
    NoIntrinsics,

    #[error("{operation} is not allowed while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Map reset requires relocalization and mapping mode")]
    MappingDisabled,

    #[error("Required collaborator missing: {0}")]
    MissingCollaborator(&'static str),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
