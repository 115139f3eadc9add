//! In-process stand-ins for the sensor, the relocalization service and the
//! scene. Used by the demo binary and the tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use nalgebra::Matrix4;
use tokio::sync::watch;
use tracing::debug;

use crate::capture::codec::{ConversionStatus, CpuImageConverter};
use crate::capture::{CamParameters, ConversionParams, Frame, ImageConverter, Intrinsics, RawFormat, RawImage, Sensor};
use crate::error::{Error, Result};
use crate::geometry::ClientPose;
use crate::session::transport::{PipelineMode, PoseStatus, RelocAndMappingResult, Transport};
use crate::session::Scene;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sensor producing a fixed test pattern at a settable pose.
pub struct SyntheticSensor {
    width: u32,
    height: u32,
    format: RawFormat,
    intrinsics: Option<Intrinsics>,
    pose: ArcSwap<Matrix4<f32>>,
    images_available: AtomicBool,
    acquired: AtomicUsize,
    subscribers: Mutex<Vec<flume::Sender<()>>>,
}

impl SyntheticSensor {
    /// Grey sensor with intrinsics at `width` x `height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_format(width, height, RawFormat::Grey8)
    }

    pub fn with_format(width: u32, height: u32, format: RawFormat) -> Self {
        Self {
            width,
            height,
            format,
            intrinsics: Some(Intrinsics {
                resolution: (width, height),
                focal: (width as f32 * 0.8, width as f32 * 0.8),
                principal_point: (width as f32 / 2.0, height as f32 / 2.0),
            }),
            pose: ArcSwap::from_pointee(Matrix4::identity()),
            images_available: AtomicBool::new(true),
            acquired: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Sensor that never reports intrinsics.
    pub fn without_intrinsics(mut self) -> Self {
        self.intrinsics = None;
        self
    }

    pub fn set_pose(&self, pose: Matrix4<f32>) {
        self.pose.store(pose.into());
    }

    pub fn set_images_available(&self, available: bool) {
        self.images_available.store(available, Ordering::Relaxed);
    }

    /// Images handed out so far
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Live frame-arrival subscriptions
    pub fn subscribers(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|tx| !tx.is_disconnected())
            .count()
    }

    /// Notifies every subscriber that a new frame is available.
    pub fn trigger(&self) {
        lock(&self.subscribers).retain(|tx| tx.send(()).is_ok());
    }

    fn pattern(&self) -> Vec<u8> {
        let channels = self.format.bytes_per_pixel();
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * channels);
        for y in 0..self.height {
            for x in 0..self.width {
                let value = ((x + y) * 255 / (self.width + self.height).max(1)) as u8;
                match self.format {
                    RawFormat::Grey8 => data.push(value),
                    RawFormat::Rgb24 => data.extend_from_slice(&[value, 255 - value, 128]),
                    RawFormat::Rgba32 => data.extend_from_slice(&[value, 255 - value, 128, 255]),
                }
            }
        }
        data
    }
}

impl Sensor for SyntheticSensor {
    fn try_acquire_latest_image(&self) -> Option<RawImage> {
        if !self.images_available.load(Ordering::Relaxed) {
            return None;
        }
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Some(RawImage {
            width: self.width,
            height: self.height,
            format: self.format,
            data: Bytes::from(self.pattern()),
        })
    }

    fn try_get_intrinsics(&self) -> Option<Intrinsics> {
        self.intrinsics
    }

    fn camera_pose(&self) -> Matrix4<f32> {
        **self.pose.load()
    }

    fn frame_arrivals(&self) -> flume::Receiver<()> {
        let (tx, rx) = flume::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }
}

/// Service stand-in recording what it receives.
///
/// With echo enabled every delivered frame is answered with a `NewPose`
/// result carrying the frame's pose.
pub struct LoopbackTransport {
    stall: watch::Sender<bool>,
    accept_connect: AtomicBool,
    accept_start: AtomicBool,
    fail_sends: AtomicBool,
    echo: AtomicBool,
    frames: Mutex<Vec<Frame>>,
    started: Mutex<Option<(CamParameters, PipelineMode)>>,
    stops: AtomicUsize,
    resets: AtomicUsize,
    results_tx: flume::Sender<RelocAndMappingResult>,
    results_rx: flume::Receiver<RelocAndMappingResult>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (results_tx, results_rx) = flume::unbounded();
        Self {
            stall: watch::Sender::new(false),
            accept_connect: AtomicBool::new(true),
            accept_start: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            echo: AtomicBool::new(false),
            frames: Mutex::new(Vec::new()),
            started: Mutex::new(None),
            stops: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            results_tx,
            results_rx,
        }
    }

    /// While stalled, connect and stop requests never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.stall.send_replace(stalled);
    }

    async fn wait_unstalled(&self) {
        let mut stall = self.stall.subscribe();
        let _ = stall.wait_for(|stalled| !*stalled).await;
    }

    pub fn set_accept_connect(&self, accept: bool) {
        self.accept_connect.store(accept, Ordering::Relaxed);
    }

    pub fn set_accept_start(&self, accept: bool) {
        self.accept_start.store(accept, Ordering::Relaxed);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::Relaxed);
    }

    /// Queues a result as if pushed by the service.
    pub fn push_result(&self, result: RelocAndMappingResult) {
        let _ = self.results_tx.send(result);
    }

    pub fn frames(&self) -> Vec<Frame> {
        lock(&self.frames).clone()
    }

    /// Parameters of the last accepted start request
    pub fn started_with(&self) -> Option<(CamParameters, PipelineMode)> {
        lock(&self.started).clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<bool> {
        self.wait_unstalled().await;
        Ok(self.accept_connect.load(Ordering::Relaxed))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn request_start(&self, params: &CamParameters, mode: PipelineMode) -> Result<bool> {
        if !self.accept_start.load(Ordering::Relaxed) {
            return Ok(false);
        }
        *lock(&self.started) = Some((params.clone(), mode));
        Ok(true)
    }

    async fn request_stop(&self) -> Result<()> {
        self.wait_unstalled().await;
        self.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn request_reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(Error::Transport("loopback send disabled".into()));
        }
        debug!(timestamp_ms = frame.timestamp_ms, "Loopback received frame");
        if self.echo.load(Ordering::Relaxed) {
            self.push_result(RelocAndMappingResult {
                pose_status: PoseStatus::NewPose,
                pose: frame.pose_matrix(),
            });
        }
        lock(&self.frames).push(frame);
        Ok(())
    }

    fn results(&self) -> flume::Receiver<RelocAndMappingResult> {
        self.results_rx.clone()
    }
}

/// Converter that holds every conversion until the gate opens.
pub struct GatedConverter {
    gate: watch::Sender<bool>,
    failing: AtomicBool,
    started: AtomicUsize,
    inner: CpuImageConverter,
}

impl GatedConverter {
    pub fn new(open: bool) -> Self {
        Self {
            gate: watch::Sender::new(open),
            failing: AtomicBool::new(false),
            started: AtomicUsize::new(0),
            inner: CpuImageConverter,
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    /// Conversions released from now on report `Failed`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Conversions requested so far
    pub fn started(&self) -> usize {
        self.started.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ImageConverter for GatedConverter {
    async fn convert(
        &self,
        raw: RawImage,
        params: ConversionParams,
    ) -> std::result::Result<Vec<u8>, ConversionStatus> {
        self.started.fetch_add(1, Ordering::Relaxed);
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| ConversionStatus::Disposed)?;
        if self.failing.load(Ordering::Relaxed) {
            return Err(ConversionStatus::Failed);
        }
        self.inner.convert(raw, params).await
    }
}

/// Scene recording every origin pose applied to it.
#[derive(Debug, Default)]
pub struct RecordingScene {
    pub poses: Vec<ClientPose>,
}

impl RecordingScene {
    pub fn last(&self) -> Option<&ClientPose> {
        self.poses.last()
    }
}

impl Scene for RecordingScene {
    fn set_origin_pose(&mut self, pose: &ClientPose) {
        self.poses.push(*pose);
    }
}
