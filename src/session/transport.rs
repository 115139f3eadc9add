//! RPC collaborator talking to the relocalization service.

use async_trait::async_trait;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use crate::capture::{CamParameters, Frame};
use crate::error::Result;
use crate::geometry::{extract_pose, to_client_matrix4, ClientPose};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineMode {
    Relocalization,
    RelocalizationAndMapping,
}

impl PipelineMode {
    pub fn toggled(self) -> Self {
        match self {
            PipelineMode::Relocalization => PipelineMode::RelocalizationAndMapping,
            PipelineMode::RelocalizationAndMapping => PipelineMode::Relocalization,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseStatus {
    NoPose,
    NewPose,
    LatestPose,
}

/// Pose pushed back by the service, service convention.
#[derive(Debug, Clone, PartialEq)]
pub struct RelocAndMappingResult {
    pub pose_status: PoseStatus,
    pub pose: Matrix4<f32>,
}

impl RelocAndMappingResult {
    /// Session-origin pose in client convention, if the service found one.
    pub fn client_pose(&self) -> Option<ClientPose> {
        if self.pose_status == PoseStatus::NoPose {
            return None;
        }
        Some(extract_pose(&to_client_matrix4(&self.pose)))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers with the service; `false` when the service refuses.
    async fn connect(&self) -> Result<bool>;

    async fn disconnect(&self) -> Result<()>;

    /// Asks the service to start processing; `false` when it refuses.
    async fn request_start(&self, params: &CamParameters, mode: PipelineMode) -> Result<bool>;

    async fn request_stop(&self) -> Result<()>;

    async fn request_reset(&self) -> Result<()>;

    async fn send_frame(&self, frame: Frame) -> Result<()>;

    /// Results pushed by the service.
    fn results(&self) -> flume::Receiver<RelocAndMappingResult>;
}
