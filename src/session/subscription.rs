use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::pipeline::CapturePipeline;

/// Sensor frame-arrival registration owned by a running session.
///
/// Arrivals are forwarded to the pipeline at most `framerate` times per
/// second (0 forwards every arrival). Dropping the handle unsubscribes: no
/// capture is started afterwards, while captures already in flight run to
/// completion.
pub struct FrameSubscription {
    active: Arc<AtomicBool>,
    dispatch: JoinHandle<()>,
}

impl FrameSubscription {
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        arrivals: flume::Receiver<()>,
        pipeline: CapturePipeline,
        framerate: u32,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let min_interval = (framerate > 0).then(|| Duration::from_secs_f64(1.0 / framerate as f64));

        let flag = active.clone();
        let dispatch = tokio::spawn(async move {
            let mut last_capture: Option<Instant> = None;
            while arrivals.recv_async().await.is_ok() {
                if !flag.load(Ordering::Acquire) {
                    break;
                }
                if let Some(min_interval) = min_interval {
                    let now = Instant::now();
                    if last_capture.is_some_and(|last| now.duration_since(last) < min_interval) {
                        trace!("Frame arrival throttled");
                        continue;
                    }
                    last_capture = Some(now);
                }
                // In-flight captures are detached; they release their slot on completion
                let _ = pipeline.on_frame_arrived();
            }
            debug!("Frame dispatch finished");
        });

        Self { active, dispatch }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.dispatch.is_finished()
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        self.dispatch.abort();
    }
}
