//! Smoothing of the relocalization pose stream before it reaches the scene.

pub mod one_euro;

use std::time::Instant;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::{Convention, Pose3D};

pub use one_euro::{FilterParams, FilterState, OneEuroFilter, Smoothable};

/// Filter tuning for both pose channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub position: FilterParams,
    pub rotation: FilterParams,
}

/// Independent One-Euro filters for position and rotation.
#[derive(Debug, Clone)]
pub struct PoseSmoother {
    position: OneEuroFilter<Vector3<f32>>,
    rotation: OneEuroFilter<UnitQuaternion<f32>>,
}

impl PoseSmoother {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            position: OneEuroFilter::new(config.position),
            rotation: OneEuroFilter::new(config.rotation),
        }
    }

    pub fn filter<C: Convention>(&mut self, pose: &Pose3D<C>, now: Instant) -> Pose3D<C> {
        Pose3D::new(
            self.position.filter(pose.position, now),
            self.rotation.filter(pose.rotation, now),
        )
    }

    pub fn reset(&mut self) {
        self.position.reset();
        self.rotation.reset();
    }
}
