use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument};

use crate::capture::calibration::{CalibrationResolver, CalibrationStore, StaticCalibrationStore};
use crate::capture::codec::CpuImageConverter;
use crate::capture::{FrameCodec, ImageConverter, Sensor};
use crate::error::{Error, Result};
use crate::filter::PoseSmoother;
use crate::geometry::ClientPose;
use crate::pipeline::{CapturePipeline, CaptureSettings, SlotPool};
use crate::session::events::{EventSink, LogLevel, SessionEvent};
use crate::session::subscription::FrameSubscription;
use crate::session::transport::{PipelineMode, RelocAndMappingResult, Transport};
use crate::{CaptureConfig, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Running,
    Stopping,
}

/// Render-side target of the relocalized session origin.
pub trait Scene {
    fn set_origin_pose(&mut self, pose: &ClientPose);
}

/// Top-level session state machine.
///
/// ```text
/// Idle -> Connecting -> Connected -> Running -> Stopping -> Connected
///                       Connected -> Idle (disconnect)
/// ```
///
/// `tick` must be driven from a single sequence (the render loop); frame
/// captures run concurrently on the runtime, bounded by the slot pool.
pub struct SessionController {
    sensor: Arc<dyn Sensor>,
    transport: Arc<dyn Transport>,
    calibration: CalibrationResolver,
    pipeline: CapturePipeline,
    smoother: PoseSmoother,
    events: EventSink,
    results: flume::Receiver<RelocAndMappingResult>,
    capture: CaptureConfig,
    smooth_reloc: bool,
    state: SessionState,
    mode: PipelineMode,
    debug: bool,
    subscription: Option<FrameSubscription>,
    last_raw_pose: Option<ClientPose>,
}

impl SessionController {
    pub fn builder(config: Config) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn pipeline(&self) -> &CapturePipeline {
        &self.pipeline
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    fn require(&self, operation: &'static str, state: SessionState) -> Result<()> {
        if self.state != state {
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<()> {
        self.require("connect", SessionState::Idle)?;
        let transition = Transition::begin(&mut self.state, SessionState::Connecting, SessionState::Idle);

        let outcome = match self.transport.connect().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Refused("connect")),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                transition.finish(SessionState::Connected);
                info!("Connected to relocalization service");
                Ok(())
            }
            Err(e) => {
                transition.finish(SessionState::Idle);
                self.events.log(LogLevel::Error, format!("Connection failed: {}", e));
                self.events.emit(SessionEvent::SensorStarted(false));
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn disconnect(&mut self) -> Result<()> {
        self.require("disconnect", SessionState::Connected)?;
        if let Err(e) = self.transport.disconnect().await {
            self.events.log(LogLevel::Warning, format!("Disconnect failed: {}", e));
        }
        self.state = SessionState::Idle;
        info!("Disconnected");
        Ok(())
    }

    /// Resolves calibration, asks the service to start, then subscribes to
    /// sensor frames.
    #[instrument(skip(self), fields(mode = ?self.mode))]
    pub async fn start(&mut self) -> Result<()> {
        self.require("start", SessionState::Connected)?;

        let requested = self.capture.requested_resolution();
        let Some(params) = self
            .calibration
            .cam_parameters(self.sensor.as_ref(), self.capture.layout, requested)
        else {
            return Err(self.start_failed(Error::NoIntrinsics));
        };

        match self.transport.request_start(&params, self.mode).await {
            Ok(true) => {}
            Ok(false) => return Err(self.start_failed(Error::Refused("start"))),
            Err(e) => return Err(self.start_failed(e)),
        }

        self.smoother.reset();
        self.last_raw_pose = None;
        let stale = self.results.drain().count();
        if stale > 0 {
            debug!("Discarded {} result(s) from before start", stale);
        }

        // Images go out at the requested resolution; the scaled-to-fit one
        // only describes the intrinsics
        self.pipeline.update_settings(CaptureSettings {
            sensor_id: params.id,
            codec: self.capture.codec_params(requested),
        });
        self.subscription = Some(FrameSubscription::spawn(
            self.sensor.frame_arrivals(),
            self.pipeline.clone(),
            self.capture.framerate,
        ));
        self.state = SessionState::Running;

        let (w, h) = requested;
        info!("Session running, sending {}x{} {:?} frames", w, h, self.capture.layout);
        self.events.emit(SessionEvent::SensorStarted(true));
        Ok(())
    }

    fn start_failed(&self, e: Error) -> Error {
        self.events.log(LogLevel::Error, format!("Start failed: {}", e));
        self.events.emit(SessionEvent::SensorStarted(false));
        e
    }

    /// Unsubscribes first so no new capture starts; in-flight captures are
    /// left to finish. The remote stop is best effort.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<()> {
        self.require("stop", SessionState::Running)?;
        let transition = Transition::begin(&mut self.state, SessionState::Stopping, SessionState::Connected);
        self.subscription = None;

        if let Err(e) = self.transport.request_stop().await {
            self.events.log(LogLevel::Warning, format!("Remote stop failed: {}", e));
        }

        transition.finish(SessionState::Connected);
        info!("Session stopped");
        self.events.emit(SessionEvent::SensorStopped);
        Ok(())
    }

    /// Fire-and-forget map reset. Must be called from within a Tokio runtime.
    pub fn reset_map(&self) -> Result<()> {
        self.require("reset_map", SessionState::Connected)?;
        if self.mode != PipelineMode::RelocalizationAndMapping {
            return Err(Error::MappingDisabled);
        }

        let transport = self.transport.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match transport.request_reset().await {
                Ok(()) => info!("Map reset requested"),
                Err(e) => events.log(LogLevel::Warning, format!("Map reset failed: {}", e)),
            }
        });
        Ok(())
    }

    /// Switches between relocalization only and relocalization + mapping.
    /// Only while connected and not started; takes effect on the next start.
    pub fn toggle_pipeline_mode(&mut self) -> Result<PipelineMode> {
        self.require("toggle_pipeline_mode", SessionState::Connected)?;
        self.mode = self.mode.toggled();
        info!("Pipeline mode: {:?}", self.mode);
        Ok(self.mode)
    }

    pub fn set_debug(&mut self, enabled: bool) {
        if self.debug == enabled {
            return;
        }
        self.debug = enabled;
        self.events.emit(SessionEvent::DebugToggled(enabled));
    }

    /// Applies the newest relocalized pose to the scene.
    ///
    /// Results received while not running are discarded. With smoothing on,
    /// the filter also runs on ticks without a new result so the scene keeps
    /// easing toward the last received pose. Returns the pose applied, if any.
    pub fn tick(&mut self, scene: &mut dyn Scene, now: Instant) -> Option<ClientPose> {
        let mut latest = None;
        for result in self.results.try_iter() {
            if self.state != SessionState::Running {
                continue;
            }
            if let Some(pose) = result.client_pose() {
                latest = Some(pose);
            }
        }

        if self.state != SessionState::Running {
            return None;
        }

        let applied = match (latest, self.smooth_reloc) {
            (Some(raw), true) => {
                self.last_raw_pose = Some(raw);
                self.smoother.filter(&raw, now)
            }
            (Some(raw), false) => {
                self.last_raw_pose = Some(raw);
                raw
            }
            (None, true) => self.smoother.filter(&self.last_raw_pose?, now),
            (None, false) => return None,
        };
        scene.set_origin_pose(&applied);
        Some(applied)
    }
}

/// In-progress state of an awaiting operation. Falls back to `fallback` if
/// the operation's future is dropped before `finish`.
struct Transition<'a> {
    state: &'a mut SessionState,
    fallback: SessionState,
    finished: bool,
}

impl<'a> Transition<'a> {
    fn begin(state: &'a mut SessionState, during: SessionState, fallback: SessionState) -> Self {
        *state = during;
        Self {
            state,
            fallback,
            finished: false,
        }
    }

    fn finish(mut self, next: SessionState) {
        *self.state = next;
        self.finished = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state = self.fallback;
        }
    }
}

/// Wires collaborators into a [`SessionController`].
pub struct SessionBuilder {
    config: Config,
    sensor: Option<Arc<dyn Sensor>>,
    transport: Option<Arc<dyn Transport>>,
    calibration_store: Option<Arc<dyn CalibrationStore>>,
    converter: Option<Arc<dyn ImageConverter>>,
    events: EventSink,
}

impl SessionBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sensor: None,
            transport: None,
            calibration_store: None,
            converter: None,
            events: EventSink::disabled(),
        }
    }

    pub fn sensor(mut self, sensor: Arc<dyn Sensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to the calibrations listed in the configuration.
    pub fn calibration_store(mut self, store: Arc<dyn CalibrationStore>) -> Self {
        self.calibration_store = Some(store);
        self
    }

    /// Defaults to the CPU converter.
    pub fn converter(mut self, converter: Arc<dyn ImageConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<SessionController> {
        let sensor = self.sensor.ok_or_else(|| missing("sensor"))?;
        let transport = self.transport.ok_or_else(|| missing("transport"))?;

        let store = self
            .calibration_store
            .unwrap_or_else(|| Arc::new(StaticCalibrationStore::new(self.config.calibrations.clone())));
        let converter = self.converter.unwrap_or_else(|| Arc::new(CpuImageConverter));
        let capture = self.config.capture;

        let pipeline = CapturePipeline::new(
            sensor.clone(),
            transport.clone(),
            FrameCodec::new(converter),
            SlotPool::new(capture.slots),
            CaptureSettings {
                sensor_id: 0,
                codec: capture.codec_params(capture.requested_resolution()),
            },
            self.events.clone(),
        );

        Ok(SessionController {
            calibration: CalibrationResolver::new(self.config.device_id(), store),
            results: transport.results(),
            sensor,
            transport,
            pipeline,
            smoother: PoseSmoother::new(&self.config.filter),
            events: self.events,
            capture,
            smooth_reloc: self.config.session.smooth_reloc,
            state: SessionState::Idle,
            mode: self.config.session.mode,
            debug: false,
            subscription: None,
            last_raw_pose: None,
        })
    }
}

fn missing(collaborator: &'static str) -> Error {
    error!("Session configuration error: no {} provided", collaborator);
    Error::MissingCollaborator(collaborator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transport::PoseStatus;
    use crate::sim::{LoopbackTransport, RecordingScene, SyntheticSensor};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector3};
    use std::time::Duration;

    struct Harness {
        sensor: Arc<SyntheticSensor>,
        transport: Arc<LoopbackTransport>,
        events: flume::Receiver<SessionEvent>,
        session: SessionController,
    }

    fn harness(config: Config) -> Harness {
        let sensor = Arc::new(SyntheticSensor::new(64, 48));
        let transport = Arc::new(LoopbackTransport::new());
        let (sink, events) = EventSink::channel();
        let session = SessionController::builder(config)
            .sensor(sensor.clone())
            .transport(transport.clone())
            .events(sink)
            .build()
            .unwrap();
        Harness {
            sensor,
            transport,
            events,
            session,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.session.device_id = Some("test-device".into());
        config
    }

    fn translation(x: f32, y: f32, z: f32) -> RelocAndMappingResult {
        RelocAndMappingResult {
            pose_status: PoseStatus::NewPose,
            pose: Matrix4::new_translation(&Vector3::new(x, y, z)),
        }
    }

    #[test]
    fn test_missing_collaborator_is_fatal() {
        let result = SessionController::builder(Config::default())
            .transport(Arc::new(LoopbackTransport::new()))
            .build();
        assert!(matches!(result, Err(Error::MissingCollaborator("sensor"))));

        let result = SessionController::builder(Config::default())
            .sensor(Arc::new(SyntheticSensor::new(8, 8)))
            .build();
        assert!(matches!(result, Err(Error::MissingCollaborator("transport"))));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut h = harness(test_config());
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(matches!(
            h.session.start().await,
            Err(Error::InvalidState { state: SessionState::Idle, .. })
        ));

        h.session.connect().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);

        h.session.start().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Running);
        assert!(h.session.is_subscribed());
        assert_eq!(h.sensor.subscribers(), 1);
        assert_eq!(h.events.try_recv().unwrap(), SessionEvent::SensorStarted(true));

        let (params, mode) = h.transport.started_with().unwrap();
        assert_eq!(params.name, "test-device");
        assert_eq!(params.calibration.resolution, (64, 48));
        assert_eq!(mode, PipelineMode::RelocalizationAndMapping);

        h.session.stop().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(!h.session.is_subscribed());
        assert_eq!(h.transport.stops(), 1);
        assert_eq!(h.events.try_recv().unwrap(), SessionEvent::SensorStopped);

        h.session.disconnect().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_refused_start_stays_connected() {
        let mut h = harness(test_config());
        h.session.connect().await.unwrap();
        h.transport.set_accept_start(false);

        assert!(matches!(h.session.start().await, Err(Error::Refused("start"))));
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(!h.session.is_subscribed());

        let events: Vec<_> = h.events.try_iter().collect();
        assert!(matches!(events[0], SessionEvent::Log { level: LogLevel::Error, .. }));
        assert_eq!(events[1], SessionEvent::SensorStarted(false));
    }

    #[tokio::test]
    async fn test_start_without_intrinsics_fails() {
        let sensor = Arc::new(SyntheticSensor::new(64, 48).without_intrinsics());
        let mut session = SessionController::builder(test_config())
            .sensor(sensor)
            .transport(Arc::new(LoopbackTransport::new()))
            .build()
            .unwrap();
        session.connect().await.unwrap();
        assert!(matches!(session.start().await, Err(Error::NoIntrinsics)));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_refused_connect_returns_to_idle() {
        let mut h = harness(test_config());
        h.transport.set_accept_connect(false);
        assert!(h.session.connect().await.is_err());
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_results_discarded_unless_running() {
        let mut h = harness(test_config());
        let mut scene = RecordingScene::default();
        h.session.connect().await.unwrap();

        h.transport.push_result(translation(1.0, 0.0, 0.0));
        assert!(h.session.tick(&mut scene, Instant::now()).is_none());

        h.session.start().await.unwrap();
        assert!(h.session.tick(&mut scene, Instant::now()).is_none());
        assert!(scene.poses.is_empty());
    }

    #[tokio::test]
    async fn test_tick_smooths_and_keeps_easing() {
        let mut h = harness(test_config());
        let mut scene = RecordingScene::default();
        h.session.connect().await.unwrap();
        h.session.start().await.unwrap();

        let start = Instant::now();
        h.transport.push_result(translation(0.0, 0.0, 0.0));
        h.session.tick(&mut scene, start).unwrap();

        h.transport.push_result(translation(2.0, 0.0, 0.0));
        let first = h.session.tick(&mut scene, start + Duration::from_millis(16)).unwrap();
        assert!(first.position.x > 0.0 && first.position.x < 2.0);

        // No new result: still easing toward the last one
        let second = h.session.tick(&mut scene, start + Duration::from_millis(32)).unwrap();
        assert!(second.position.x > first.position.x);
        assert_eq!(scene.poses.len(), 3);
    }

    #[tokio::test]
    async fn test_raw_poses_without_smoothing() {
        let mut config = test_config();
        config.session.smooth_reloc = false;
        let mut h = harness(config);
        let mut scene = RecordingScene::default();
        h.session.connect().await.unwrap();
        h.session.start().await.unwrap();

        h.transport.push_result(translation(0.0, 0.0, 0.0));
        h.transport.push_result(translation(1.0, 2.0, 3.0));
        let applied = h.session.tick(&mut scene, Instant::now()).unwrap();
        // Service y-up flips into client convention
        assert_relative_eq!(applied.position, Vector3::new(1.0, -2.0, 3.0), epsilon = 1e-6);

        assert!(h.session.tick(&mut scene, Instant::now()).is_none());
        assert_eq!(scene.poses.len(), 1);
    }

    #[tokio::test]
    async fn test_no_pose_results_ignored() {
        let mut h = harness(test_config());
        let mut scene = RecordingScene::default();
        h.session.connect().await.unwrap();
        h.session.start().await.unwrap();

        h.transport.push_result(RelocAndMappingResult {
            pose_status: PoseStatus::NoPose,
            pose: Matrix4::identity(),
        });
        assert!(h.session.tick(&mut scene, Instant::now()).is_none());
    }

    #[tokio::test]
    async fn test_reset_map_preconditions() {
        let mut h = harness(test_config());
        assert!(matches!(h.session.reset_map(), Err(Error::InvalidState { .. })));

        h.session.connect().await.unwrap();
        h.session.reset_map().unwrap();
        for _ in 0..100 {
            if h.transport.resets() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.transport.resets(), 1);
        assert_eq!(h.session.state(), SessionState::Connected);

        h.session.toggle_pipeline_mode().unwrap();
        assert!(matches!(h.session.reset_map(), Err(Error::MappingDisabled)));
    }

    #[tokio::test]
    async fn test_frames_use_requested_resolution() {
        let sensor = Arc::new(SyntheticSensor::new(1920, 1080));
        let transport = Arc::new(LoopbackTransport::new());
        let mut session = SessionController::builder(test_config())
            .sensor(sensor)
            .transport(transport.clone())
            .build()
            .unwrap();
        session.connect().await.unwrap();
        session.start().await.unwrap();

        // Intrinsics describe the scaled-to-fit image, frames keep the requested size
        let (params, _) = transport.started_with().unwrap();
        assert_eq!(params.calibration.resolution, (640, 360));
        let settings = session.pipeline().settings();
        assert_eq!(settings.codec.conversion.resolution, (640, 480));
    }

    #[tokio::test]
    async fn test_cancelled_connect_returns_to_idle() {
        let mut h = harness(test_config());
        h.transport.set_stalled(true);
        let attempt = tokio::time::timeout(Duration::from_millis(10), h.session.connect()).await;
        assert!(attempt.is_err());
        assert_eq!(h.session.state(), SessionState::Idle);

        h.transport.set_stalled(false);
        h.session.connect().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_cancelled_stop_returns_to_connected() {
        let mut h = harness(test_config());
        h.session.connect().await.unwrap();
        h.session.start().await.unwrap();

        h.transport.set_stalled(true);
        let attempt = tokio::time::timeout(Duration::from_millis(10), h.session.stop()).await;
        assert!(attempt.is_err());
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(!h.session.is_subscribed());
    }

    #[tokio::test]
    async fn test_mode_toggle_requires_connected() {
        let mut h = harness(test_config());
        assert!(matches!(
            h.session.toggle_pipeline_mode(),
            Err(Error::InvalidState { state: SessionState::Idle, .. })
        ));
        assert_eq!(h.session.mode(), PipelineMode::RelocalizationAndMapping);

        h.session.connect().await.unwrap();
        assert_eq!(h.session.toggle_pipeline_mode().unwrap(), PipelineMode::Relocalization);

        h.session.start().await.unwrap();
        assert!(h.session.toggle_pipeline_mode().is_err());
        assert_eq!(h.transport.started_with().unwrap().1, PipelineMode::Relocalization);
    }

    #[test]
    fn test_debug_toggle_emits_on_change_only() {
        let mut h = harness(test_config());
        h.session.set_debug(true);
        h.session.set_debug(true);
        h.session.set_debug(false);
        let events: Vec<_> = h.events.try_iter().collect();
        assert_eq!(
            events,
            vec![SessionEvent::DebugToggled(true), SessionEvent::DebugToggled(false)]
        );
    }
}
