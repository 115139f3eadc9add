//! Effective camera calibration for the resolution frames are sent at.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::frame::{CameraType, PixelLayout};
use crate::capture::sensor::{Intrinsics, Sensor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f32,
    pub k2: f32,
    pub p1: f32,
    pub p2: f32,
    pub k3: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub resolution: (u32, u32),
    pub focal: (f32, f32),
    pub principal_point: (f32, f32),
    pub distortion: Distortion,
}

/// Per-resolution calibration measured for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub resolution: (u32, u32),
    pub focal: (f32, f32),
    pub principal_point: (f32, f32),
    /// Radial terms as measured: `[k1, k2, k3, unused]`
    pub distortion: [f32; 4],
}

pub type CalibrationTable = Vec<CalibrationRecord>;

/// Calibration records keyed by device id.
pub trait CalibrationStore: Send + Sync {
    fn lookup(&self, device_id: &str) -> Option<CalibrationTable>;
}

/// Device calibrations known up front (e.g. from configuration).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCalibration {
    pub device_id: String,
    pub resolutions: CalibrationTable,
}

#[derive(Debug, Default)]
pub struct StaticCalibrationStore {
    tables: HashMap<String, CalibrationTable>,
}

impl StaticCalibrationStore {
    pub fn new(devices: impl IntoIterator<Item = DeviceCalibration>) -> Self {
        Self {
            tables: devices
                .into_iter()
                .map(|d| (d.device_id, d.resolutions))
                .collect(),
        }
    }
}

impl CalibrationStore for StaticCalibrationStore {
    fn lookup(&self, device_id: &str) -> Option<CalibrationTable> {
        self.tables.get(device_id).cloned()
    }
}

/// Camera description sent with the start request.
#[derive(Debug, Clone, PartialEq)]
pub struct CamParameters {
    pub name: String,
    pub id: u32,
    pub camera_type: CameraType,
    pub calibration: Calibration,
}

/// Uniform scale fitting `sensor` inside `requested`, never above 1.
pub fn scale_to_fit(sensor: (u32, u32), requested: (u32, u32)) -> f32 {
    let sx = requested.0 as f32 / sensor.0 as f32;
    let sy = requested.1 as f32 / sensor.1 as f32;
    sx.min(sy).min(1.0)
}

/// Calibration for frames scaled from the sensor resolution to fit
/// `requested`.
///
/// Defaults are the sensor intrinsics scaled by the fit factor with zero
/// distortion. A table record with exactly the output resolution overrides
/// them; only its first three distortion terms are used, as `k1`, `k2`, `k3`.
pub fn resolve(
    intrinsics: &Intrinsics,
    requested: (u32, u32),
    table: Option<&[CalibrationRecord]>,
) -> Calibration {
    let scale = scale_to_fit(intrinsics.resolution, requested);
    let resolution = (
        (intrinsics.resolution.0 as f32 * scale).round_ties_even() as u32,
        (intrinsics.resolution.1 as f32 * scale).round_ties_even() as u32,
    );

    let default = Calibration {
        resolution,
        focal: (intrinsics.focal.0 * scale, intrinsics.focal.1 * scale),
        principal_point: (
            intrinsics.principal_point.0 * scale,
            intrinsics.principal_point.1 * scale,
        ),
        distortion: Distortion::default(),
    };

    let Some(record) = table
        .into_iter()
        .flatten()
        .find(|r| r.resolution == resolution)
    else {
        return default;
    };

    Calibration {
        resolution,
        focal: record.focal,
        principal_point: record.principal_point,
        distortion: Distortion {
            k1: record.distortion[0],
            k2: record.distortion[1],
            p1: 0.0,
            p2: 0.0,
            k3: record.distortion[2],
        },
    }
}

/// Resolves calibration for one device; the device table is loaded from the
/// store on first use and kept for the lifetime of the resolver.
pub struct CalibrationResolver {
    device_id: String,
    store: Arc<dyn CalibrationStore>,
    table: OnceCell<Option<CalibrationTable>>,
}

impl CalibrationResolver {
    pub fn new(device_id: impl Into<String>, store: Arc<dyn CalibrationStore>) -> Self {
        Self {
            device_id: device_id.into(),
            store,
            table: OnceCell::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn table(&self) -> Option<&[CalibrationRecord]> {
        self.table
            .get_or_init(|| {
                let table = self.store.lookup(&self.device_id);
                match &table {
                    Some(t) => info!("Loaded {} calibration record(s) for {}", t.len(), self.device_id),
                    None => debug!("No calibration table for {}", self.device_id),
                }
                table
            })
            .as_deref()
    }

    pub fn resolve(&self, intrinsics: &Intrinsics, requested: (u32, u32)) -> Calibration {
        resolve(intrinsics, requested, self.table())
    }

    /// Start-request parameters for the sensor's current intrinsics, or
    /// `None` when the sensor cannot provide them yet.
    pub fn cam_parameters(
        &self,
        sensor: &dyn Sensor,
        layout: PixelLayout,
        requested: (u32, u32),
    ) -> Option<CamParameters> {
        let intrinsics = sensor.try_get_intrinsics()?;
        Some(CamParameters {
            name: self.device_id.clone(),
            id: 0,
            camera_type: layout.camera_type(),
            calibration: self.resolve(&intrinsics, requested),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn intrinsics(w: u32, h: u32) -> Intrinsics {
        Intrinsics {
            resolution: (w, h),
            focal: (w as f32 * 0.8, w as f32 * 0.8),
            principal_point: (w as f32 / 2.0, h as f32 / 2.0),
        }
    }

    fn device_x() -> DeviceCalibration {
        DeviceCalibration {
            device_id: "X".into(),
            resolutions: vec![CalibrationRecord {
                resolution: (640, 480),
                focal: (500.0, 500.0),
                principal_point: (320.0, 240.0),
                distortion: [0.1, 0.2, 0.3, 0.4],
            }],
        }
    }

    #[test]
    fn test_scale_to_fit_downscales_uniformly() {
        let calib = resolve(&intrinsics(1920, 1080), (640, 480), None);
        assert_eq!(calib.resolution, (640, 360));
        let scale = 640.0 / 1920.0;
        assert_eq!(calib.focal, (1920.0 * 0.8 * scale, 1920.0 * 0.8 * scale));
        assert_eq!(calib.principal_point, (960.0 * scale, 540.0 * scale));
        assert_eq!(calib.distortion, Distortion::default());
    }

    #[test]
    fn test_fallback_never_upscales() {
        let sizes = [(320, 240), (640, 480), (1280, 720), (1920, 1440), (3, 7), (1000, 1)];
        for &sensor in &sizes {
            for &requested in &sizes {
                let scale = scale_to_fit(sensor, requested);
                assert!(scale <= 1.0);

                let calib = resolve(&intrinsics(sensor.0, sensor.1), requested, None);
                assert!(calib.resolution.0 <= requested.0, "{sensor:?} -> {requested:?}: {calib:?}");
                assert!(calib.resolution.1 <= requested.1, "{sensor:?} -> {requested:?}: {calib:?}");
                assert!(calib.resolution.0 <= sensor.0 && calib.resolution.1 <= sensor.1);
            }
        }
    }

    #[test]
    fn test_requested_larger_than_sensor_keeps_native() {
        let native = intrinsics(640, 480);
        let calib = resolve(&native, (4096, 4096), None);
        assert_eq!(calib.resolution, (640, 480));
        assert_eq!(calib.focal, native.focal);
        assert_eq!(calib.principal_point, native.principal_point);
    }

    #[test]
    fn test_rounds_half_to_even() {
        // 5 * 0.5 = 2.5 rounds to 2, 7 * 0.5 = 3.5 rounds to 4
        let calib = resolve(&intrinsics(5, 10), (100, 5), None);
        assert_eq!(calib.resolution, (2, 5));
        let calib = resolve(&intrinsics(7, 10), (100, 5), None);
        assert_eq!(calib.resolution, (4, 5));
    }

    #[test]
    fn test_device_override_maps_distortion() {
        let store: Arc<dyn CalibrationStore> = Arc::new(StaticCalibrationStore::new([device_x()]));
        let resolver = CalibrationResolver::new("X", store);

        let calib = resolver.resolve(&intrinsics(1280, 960), (640, 480));
        assert_eq!(calib.resolution, (640, 480));
        assert_eq!(calib.focal, (500.0, 500.0));
        assert_eq!(calib.principal_point, (320.0, 240.0));
        assert_eq!(
            calib.distortion,
            Distortion {
                k1: 0.1,
                k2: 0.2,
                p1: 0.0,
                p2: 0.0,
                k3: 0.3,
            }
        );
    }

    #[test]
    fn test_override_requires_exact_resolution() {
        let store: Arc<dyn CalibrationStore> = Arc::new(StaticCalibrationStore::new([device_x()]));
        let resolver = CalibrationResolver::new("X", store);

        let calib = resolver.resolve(&intrinsics(1920, 1080), (640, 480));
        assert_eq!(calib.resolution, (640, 360));
        assert_eq!(calib.distortion, Distortion::default());
        assert_ne!(calib.focal, (500.0, 500.0));
    }

    #[test]
    fn test_unknown_device_uses_defaults() {
        let store: Arc<dyn CalibrationStore> = Arc::new(StaticCalibrationStore::new([device_x()]));
        let resolver = CalibrationResolver::new("Y", store);
        let calib = resolver.resolve(&intrinsics(640, 480), (640, 480));
        assert_eq!(calib.distortion, Distortion::default());
        assert_eq!(calib.focal, (512.0, 512.0));
    }

    #[test]
    fn test_table_loaded_once() {
        struct CountingStore(AtomicUsize);
        impl CalibrationStore for CountingStore {
            fn lookup(&self, _device_id: &str) -> Option<CalibrationTable> {
                self.0.fetch_add(1, Ordering::SeqCst);
                None
            }
        }

        let store = Arc::new(CountingStore(AtomicUsize::new(0)));
        let resolver = CalibrationResolver::new("X", store.clone());
        resolver.resolve(&intrinsics(640, 480), (640, 480));
        resolver.resolve(&intrinsics(640, 480), (320, 240));
        assert_eq!(store.0.load(Ordering::SeqCst), 1);
    }
}
