//! Frame-arrival handling: admission, grab, convert, send.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::capture::{CodecParams, Frame, FrameCodec, RawImage, Sensor};
use crate::geometry::{extract_pose, to_service_matrix4, ServicePose};
use crate::pipeline::slots::{SlotGuard, SlotPool};
use crate::session::events::{EventSink, LogLevel};
use crate::session::transport::Transport;
use crate::utils;

/// Per-frame settings, swapped atomically by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub sensor_id: u32,
    pub codec: CodecParams,
}

/// Where a single capture is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStage {
    Idle,
    SlotAcquired,
    ImageGrabbed,
    Converted,
    Sent,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoSlot,
    NoImage,
    ConversionFailed,
    SendFailed,
    /// Capture task panicked or was cancelled
    Aborted,
}

/// Terminal state of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Sent,
    /// `after` is the last stage reached before dropping
    Dropped { after: CaptureStage, reason: DropReason },
}

/// Result of a frame-arrival notification
#[derive(Debug)]
pub enum Admission {
    /// Slot taken and image grabbed; conversion and send continue in the task
    InFlight(JoinHandle<CaptureOutcome>),
    /// Terminal without spawning anything
    Dropped(CaptureOutcome),
}

impl Admission {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Admission::InFlight(_))
    }

    /// Waits for the capture to settle.
    pub async fn outcome(self) -> CaptureOutcome {
        match self {
            Admission::Dropped(outcome) => outcome,
            Admission::InFlight(handle) => handle.await.unwrap_or(CaptureOutcome::Dropped {
                after: CaptureStage::ImageGrabbed,
                reason: DropReason::Aborted,
            }),
        }
    }
}

#[derive(Default)]
struct Stats {
    rejected: AtomicU64,
    admitted: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Arrivals refused for lack of a slot
    pub rejected: u64,
    /// Arrivals that took a slot
    pub admitted: u64,
    pub sent: u64,
    /// Admitted captures that ended without a send
    pub dropped: u64,
}

struct Shared {
    sensor: Arc<dyn Sensor>,
    transport: Arc<dyn Transport>,
    codec: FrameCodec,
    slots: SlotPool,
    settings: ArcSwap<CaptureSettings>,
    events: EventSink,
    stats: CachePadded<Stats>,
}

/// Turns frame-arrival notifications into frames handed to the transport,
/// never running more than the slot capacity concurrently.
#[derive(Clone)]
pub struct CapturePipeline {
    shared: Arc<Shared>,
}

impl CapturePipeline {
    pub fn new(
        sensor: Arc<dyn Sensor>,
        transport: Arc<dyn Transport>,
        codec: FrameCodec,
        slots: SlotPool,
        settings: CaptureSettings,
        events: EventSink,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sensor,
                transport,
                codec,
                slots,
                settings: ArcSwap::from_pointee(settings),
                events,
                stats: CachePadded::new(Stats::default()),
            }),
        }
    }

    pub fn slots(&self) -> &SlotPool {
        &self.shared.slots
    }

    pub fn settings(&self) -> CaptureSettings {
        **self.shared.settings.load()
    }

    /// Applies to captures admitted from now on.
    pub fn update_settings(&self, settings: CaptureSettings) {
        self.shared.settings.store(Arc::new(settings));
    }

    pub fn stats(&self) -> PipelineStats {
        let stats = &self.shared.stats;
        PipelineStats {
            rejected: stats.rejected.load(Ordering::Relaxed),
            admitted: stats.admitted.load(Ordering::Relaxed),
            sent: stats.sent.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Handles one frame-arrival notification without blocking.
    ///
    /// The slot check, pose read and image grab happen synchronously so the
    /// pose matches the image; conversion and send run on a spawned task
    /// holding the slot. Must be called from within a Tokio runtime.
    pub fn on_frame_arrived(&self) -> Admission {
        let shared = &self.shared;

        let Some(slot) = shared.slots.try_acquire() else {
            shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_rejected").increment(1);
            trace!("No free capture slot, skipping frame");
            return Admission::Dropped(CaptureOutcome::Dropped {
                after: CaptureStage::Idle,
                reason: DropReason::NoSlot,
            });
        };
        shared.stats.admitted.fetch_add(1, Ordering::Relaxed);

        let camera = shared.sensor.camera_pose();
        let Some(raw) = shared
            .sensor
            .try_acquire_latest_image()
            .filter(RawImage::is_valid)
        else {
            shared.record_dropped();
            trace!("No image available, skipping frame");
            return Admission::Dropped(CaptureOutcome::Dropped {
                after: CaptureStage::SlotAcquired,
                reason: DropReason::NoImage,
            });
        };

        let pose: ServicePose = extract_pose(&to_service_matrix4(&camera));
        let timestamp_ms = utils::unix_timestamp_ms();
        let settings = **shared.settings.load();

        let shared = self.shared.clone();
        Admission::InFlight(tokio::spawn(async move {
            shared.process(slot, raw, pose, timestamp_ms, settings).await
        }))
    }
}

impl Shared {
    fn record_dropped(&self) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dropped").increment(1);
    }

    /// Holds the slot until the capture settles, however it ends.
    #[instrument(skip_all, fields(timestamp_ms = timestamp_ms))]
    async fn process(
        &self,
        _slot: SlotGuard,
        raw: RawImage,
        pose: ServicePose,
        timestamp_ms: u64,
        settings: CaptureSettings,
    ) -> CaptureOutcome {
        let mut unsettled = Unsettled {
            shared: self,
            armed: true,
        };
        let outcome = self.attempt(raw, pose, timestamp_ms, settings).await;
        unsettled.armed = false;
        outcome
    }

    async fn attempt(
        &self,
        raw: RawImage,
        pose: ServicePose,
        timestamp_ms: u64,
        settings: CaptureSettings,
    ) -> CaptureOutcome {
        let image = match self.codec.convert(raw, settings.codec).await {
            Ok(image) => image,
            Err(e) => {
                self.record_dropped();
                self.events.log(LogLevel::Error, format!("Frame dropped: {}", e));
                return CaptureOutcome::Dropped {
                    after: CaptureStage::ImageGrabbed,
                    reason: DropReason::ConversionFailed,
                };
            }
        };

        let frame = Frame {
            sensor_id: settings.sensor_id,
            timestamp_ms,
            pose,
            image: Some(image),
        };

        match self.transport.send_frame(frame).await {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_sent").increment(1);
                debug!("Frame sent");
                CaptureOutcome::Sent
            }
            Err(e) => {
                self.record_dropped();
                self.events.log(LogLevel::Warning, format!("Frame not delivered: {}", e));
                CaptureOutcome::Dropped {
                    after: CaptureStage::Converted,
                    reason: DropReason::SendFailed,
                }
            }
        }
    }
}

/// Counts a capture as dropped if its task unwinds or is cancelled midway.
struct Unsettled<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for Unsettled<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.record_dropped();
            warn!("Capture aborted before settling");
        }
    }
}
