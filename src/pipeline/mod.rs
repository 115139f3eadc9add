//! Bounded-concurrency capture of sensor frames.

pub mod capture;
pub mod slots;

pub use capture::{
    Admission, CaptureOutcome, CapturePipeline, CaptureSettings, CaptureStage, DropReason,
    PipelineStats,
};
pub use slots::{SlotGuard, SlotPool};
