//! Pose calibration: pixel to table mapping.
//!
//! A calibration run watches the four table-corner fiducials (ids 1..=4) and
//! records the first corner of each detection, latest observation winning.
//! When the run is cancelled it solves the homography from the observed
//! corners to the requested real-world corners. Fewer than four corners is a
//! failed run.
//!
//! Results are persisted as JSON with every matrix stored as
//! `{rows, cols, type, data}` and loaded at startup without recomputation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::Point2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::camera::{CameraDriver, VisionBackend};
use crate::error::{AppResult, CalibrationError};
use crate::frames::FrameHub;
use crate::geometry::{Homography, PixelPoint, SerializedMat, TablePoint};

/// Fiducial ids marking the table corners, in corner order.
pub const CORNER_IDS: [i32; 4] = [1, 2, 3, 4];

/// Table corners used when a request carries none.
pub fn unit_square() -> [Point2<f64>; 4] {
    [
        Point2::new(0.0, 0.0),
        Point2::new(1.0, 0.0),
        Point2::new(0.0, 1.0),
        Point2::new(1.0, 1.0),
    ]
}

/// Calibration run settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Where results are persisted.
    pub path: PathBuf,
    /// Detection tick period.
    #[serde(with = "humantime_serde")]
    pub loop_period: Duration,
    /// Exposure forced while calibrating.
    pub exposure_us: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/pose_calibration.json"),
            loop_period: Duration::from_millis(50),
            exposure_us: 15_000,
        }
    }
}

/// A complete calibration.
#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    /// Corner ids observed during the run.
    pub found_corners: Vec<i32>,
    /// Corner pixel locations in corner-id order.
    pub corners: Vec<Point2<f64>>,
    /// Pixel to table transform.
    pub homography: Option<Homography>,
    /// Camera intrinsics.
    pub camera_matrix: SerializedMat,
    /// Lens distortion coefficients.
    pub dist_coeffs: SerializedMat,
    /// Rotation vectors.
    pub rvecs: SerializedMat,
    /// Translation vectors.
    pub tvecs: SerializedMat,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            found_corners: Vec::new(),
            corners: Vec::new(),
            homography: None,
            camera_matrix: SerializedMat::identity(3),
            dist_coeffs: SerializedMat::empty(),
            rvecs: SerializedMat::empty(),
            tvecs: SerializedMat::empty(),
        }
    }
}

impl Calibration {
    /// Solves the transform from the observed `image` corners to `real` ones.
    pub fn from_corners(
        image: [Point2<f64>; 4],
        real: [Point2<f64>; 4],
    ) -> Result<Self, CalibrationError> {
        let homography = Homography::from_four_points(&image, &real)?;
        Ok(Self {
            found_corners: CORNER_IDS.to_vec(),
            corners: image.to_vec(),
            homography: Some(homography),
            ..Self::default()
        })
    }

    /// True when a homography is available.
    pub fn is_calibrated(&self) -> bool {
        self.homography.is_some()
    }

    /// Maps a pixel onto the table plane.
    ///
    /// Without a homography this logs a warning and returns the origin.
    pub fn pixel_to_table(&self, pixel: PixelPoint) -> TablePoint {
        let Some(homography) = &self.homography else {
            tracing::warn!("Homography matrix is empty");
            return TablePoint::default();
        };
        match homography.apply(pixel.to_point()) {
            Some(p) => TablePoint {
                x: p.x,
                y: p.y,
                z: 0.0,
            },
            None => {
                tracing::warn!(x = pixel.x, y = pixel.y, "Pixel maps to infinity");
                TablePoint::default()
            }
        }
    }

    /// Reads a calibration file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        let record: CalibrationRecord = serde_json::from_str(&text)?;
        Ok(Calibration::try_from(record)?)
    }

    /// Reads `path` if it exists, otherwise returns an empty calibration.
    pub fn load_or_default(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No stored calibration");
            return Ok(Self::default());
        }
        let calibration = Self::load(path)?;
        tracing::info!(
            path = %path.display(),
            corners = ?calibration.found_corners,
            "Loaded calibration"
        );
        Ok(calibration)
    }

    /// Writes the calibration as JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&CalibrationRecord::from(self))?;
        fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Calibration saved");
        Ok(())
    }
}

/// On-disk form.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalibrationRecord {
    #[serde(default)]
    found_corners: Vec<i32>,
    corners: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    homography: Option<SerializedMat>,
    camera_matrix: SerializedMat,
    dist_coeffs: SerializedMat,
    r_vecs: SerializedMat,
    t_vecs: SerializedMat,
}

impl From<&Calibration> for CalibrationRecord {
    fn from(c: &Calibration) -> Self {
        Self {
            found_corners: c.found_corners.clone(),
            corners: c.corners.iter().map(|p| [p.x, p.y]).collect(),
            homography: c.homography.as_ref().map(Homography::to_mat),
            camera_matrix: c.camera_matrix.clone(),
            dist_coeffs: c.dist_coeffs.clone(),
            r_vecs: c.rvecs.clone(),
            t_vecs: c.tvecs.clone(),
        }
    }
}

impl TryFrom<CalibrationRecord> for Calibration {
    type Error = CalibrationError;

    fn try_from(record: CalibrationRecord) -> Result<Self, Self::Error> {
        let corners: Vec<Point2<f64>> = record
            .corners
            .iter()
            .map(|[x, y]| Point2::new(*x, *y))
            .collect();

        let homography = match &record.homography {
            Some(mat) if !mat.is_empty() => Some(Homography::from_mat(mat)?),
            // Older files carry only the corners; map them onto the unit table.
            _ => match <[Point2<f64>; 4]>::try_from(corners.as_slice()) {
                Ok(image) => Some(Homography::from_four_points(&image, &unit_square())?),
                Err(_) => None,
            },
        };

        Ok(Self {
            found_corners: record.found_corners,
            corners,
            homography,
            camera_matrix: record.camera_matrix,
            dist_coeffs: record.dist_coeffs,
            rvecs: record.r_vecs,
            tvecs: record.t_vecs,
        })
    }
}

/// Corner pixels seen so far in a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CornerObservations {
    corners: [Option<Point2<f64>>; 4],
}

impl CornerObservations {
    /// Records a fiducial's first corner. Ids outside 1..=4 are ignored.
    pub fn observe(&mut self, id: i32, corner: Point2<f64>) -> bool {
        match CORNER_IDS.iter().position(|&c| c == id) {
            Some(slot) => {
                self.corners[slot] = Some(corner);
                true
            }
            None => false,
        }
    }

    /// Ids observed at least once, ascending.
    pub fn found_ids(&self) -> Vec<i32> {
        CORNER_IDS
            .iter()
            .zip(self.corners.iter())
            .filter_map(|(id, c)| c.map(|_| *id))
            .collect()
    }

    /// Observed corner pixels in id order.
    pub fn locations(&self) -> Vec<Point2<f64>> {
        self.corners.iter().flatten().copied().collect()
    }

    /// All four corners, if every one has been seen.
    pub fn complete(&self) -> Option<[Point2<f64>; 4]> {
        match self.corners {
            [Some(a), Some(b), Some(c), Some(d)] => Some([a, b, c, d]),
            _ => None,
        }
    }
}

/// Answer to a calibration query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrationSnapshot {
    /// Observed corner ids.
    pub found_corners: Vec<i32>,
    /// Corner pixel locations.
    pub corner_locations: Vec<Point2<f64>>,
}

/// The active calibration plus the progress of a running calibration.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    active: RwLock<Calibration>,
    progress: RwLock<Option<CornerObservations>>,
}

impl CalibrationStore {
    /// Store holding `calibration`.
    pub fn new(calibration: Calibration) -> Arc<Self> {
        Arc::new(Self {
            active: RwLock::new(calibration),
            progress: RwLock::new(None),
        })
    }

    /// Copy of the active calibration.
    pub fn active(&self) -> Calibration {
        self.active.read().clone()
    }

    /// Replaces the active calibration wholesale.
    pub fn replace(&self, calibration: Calibration) {
        *self.active.write() = calibration;
    }

    /// Maps a pixel through the active calibration.
    pub fn pixel_to_table(&self, pixel: PixelPoint) -> TablePoint {
        self.active.read().pixel_to_table(pixel)
    }

    /// In-progress corners while calibrating, otherwise the stored ones.
    pub fn snapshot(&self) -> CalibrationSnapshot {
        if let Some(progress) = self.progress.read().as_ref() {
            return CalibrationSnapshot {
                found_corners: progress.found_ids(),
                corner_locations: progress.locations(),
            };
        }
        let active = self.active.read();
        CalibrationSnapshot {
            found_corners: active.found_corners.clone(),
            corner_locations: active.corners.clone(),
        }
    }

    fn set_progress(&self, progress: Option<CornerObservations>) {
        *self.progress.write() = progress;
    }
}

/// Fiducial-driven calibration loop.
pub struct PoseCalibrator {
    config: CalibrationConfig,
    vision: Arc<dyn VisionBackend>,
    frames: Arc<FrameHub>,
    store: Arc<CalibrationStore>,
}

impl PoseCalibrator {
    /// Calibrator publishing progress into `store`.
    pub fn new(
        config: CalibrationConfig,
        vision: Arc<dyn VisionBackend>,
        frames: Arc<FrameHub>,
        store: Arc<CalibrationStore>,
    ) -> Self {
        Self {
            config,
            vision,
            frames,
            store,
        }
    }

    /// Observes corners until `cancel` fires, then solves the mapping onto
    /// `real_corners`.
    pub async fn run(
        &self,
        camera: &dyn CameraDriver,
        real_corners: [Point2<f64>; 4],
        cancel: &CancellationToken,
    ) -> Result<Calibration, CalibrationError> {
        if let Err(e) = camera.set_exposure(self.config.exposure_us).await {
            tracing::warn!("Failed to set calibration exposure: {e:#}");
        }

        let mut observations = CornerObservations::default();
        self.store.set_progress(Some(observations.clone()));

        let mut ticker = tokio::time::interval(self.config.loop_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(frame) = self.frames.latest() else {
                continue;
            };
            if last_frame == Some(frame.sequence) {
                continue;
            }
            last_frame = Some(frame.sequence);

            let detections = match self.vision.detect_fiducials(&frame) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("Fiducial detection failed: {e:#}");
                    continue;
                }
            };

            let mut changed = false;
            for detection in &detections {
                changed |= observations.observe(detection.id, detection.corners[0]);
            }
            if changed {
                tracing::debug!(found = ?observations.found_ids(), "Corner observations updated");
                self.store.set_progress(Some(observations.clone()));
            }
        }

        self.store.set_progress(None);

        let Some(image) = observations.complete() else {
            let found = observations.found_ids();
            tracing::warn!(?found, "Not enough corners found");
            return Err(CalibrationError::InsufficientCorners { found });
        };
        let calibration = Calibration::from_corners(image, real_corners)?;
        tracing::info!(corners = ?calibration.corners, "Calibration computed");
        Ok(calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimCamera, SimScene, SimVision};
    use tempfile::tempdir;

    fn table_corners() -> [PixelPoint; 4] {
        [
            PixelPoint::new(40, 30),
            PixelPoint::new(280, 36),
            PixelPoint::new(32, 200),
            PixelPoint::new(290, 210),
        ]
    }

    fn as_points(pixels: [PixelPoint; 4]) -> [Point2<f64>; 4] {
        pixels.map(PixelPoint::to_point)
    }

    #[test]
    fn test_corner_pixels_map_to_table_corners() {
        let calibration =
            Calibration::from_corners(as_points(table_corners()), unit_square()).unwrap();

        for (pixel, expected) in table_corners().iter().zip(unit_square().iter()) {
            let p = calibration.pixel_to_table(*pixel);
            assert!((p.x - expected.x).abs() < 1e-3, "{p:?}");
            assert!((p.y - expected.y).abs() < 1e-3, "{p:?}");
            assert_eq!(p.z, 0.0);
        }
    }

    #[test]
    fn test_uncalibrated_maps_to_origin() {
        let calibration = Calibration::default();
        assert!(!calibration.is_calibrated());
        assert_eq!(
            calibration.pixel_to_table(PixelPoint::new(100, 100)),
            TablePoint::default()
        );
    }

    #[test]
    fn test_persisted_calibration_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("pose_calibration.json");
        let calibration =
            Calibration::from_corners(as_points(table_corners()), unit_square()).unwrap();

        calibration.save(&path).unwrap();
        let loaded = Calibration::load(&path).unwrap();
        assert_eq!(loaded, calibration);

        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"cameraMatrix\""));
        assert!(json.contains("\"rVecs\""));
    }

    #[test]
    fn test_load_recomputes_missing_homography() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        let identity = SerializedMat::identity(3);
        let json = serde_json::json!({
            "corners": [[40.0, 30.0], [280.0, 36.0], [32.0, 200.0], [290.0, 210.0]],
            "cameraMatrix": identity,
            "distCoeffs": {"rows": 0, "cols": 0, "type": 0, "data": ""},
            "rVecs": {"rows": 0, "cols": 0, "type": 0, "data": ""},
            "tVecs": {"rows": 0, "cols": 0, "type": 0, "data": ""},
        });
        fs::write(&path, json.to_string()).unwrap();

        let loaded = Calibration::load(&path).unwrap();
        assert!(loaded.is_calibrated());
        let p = loaded.pixel_to_table(PixelPoint::new(290, 210));
        assert!((p.x - 1.0).abs() < 1e-3 && (p.y - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_missing_file_loads_default() {
        let dir = tempdir().unwrap();
        let calibration = Calibration::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(calibration, Calibration::default());
    }

    #[test]
    fn test_observations_keep_latest_and_ignore_unknown_ids() {
        let mut obs = CornerObservations::default();
        assert!(obs.observe(2, Point2::new(1.0, 1.0)));
        assert!(obs.observe(2, Point2::new(5.0, 5.0)));
        assert!(!obs.observe(9, Point2::new(0.0, 0.0)));

        assert_eq!(obs.found_ids(), vec![2]);
        assert_eq!(obs.locations(), vec![Point2::new(5.0, 5.0)]);
        assert!(obs.complete().is_none());
    }

    /// Runs a calibration over ~20 simulated frames, then cancels it.
    /// Also returns the corner ids the store reported just before cancelling.
    async fn calibrate(
        scene: crate::hardware::sim::SharedScene,
    ) -> (Result<Calibration, CalibrationError>, Vec<i32>) {
        let camera = SimCamera::with_frame_interval(scene.clone(), Duration::from_millis(10));
        camera.start().await.unwrap();
        let hub = FrameHub::new();
        let store = CalibrationStore::new(Calibration::default());
        let calibrator = PoseCalibrator::new(
            CalibrationConfig::default(),
            Arc::new(SimVision::new(scene)),
            hub.clone(),
            store.clone(),
        );

        let cancel = CancellationToken::new();
        let capture = async {
            for _ in 0..20 {
                if let Ok(frame) = camera.next_frame().await {
                    hub.publish(frame);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let seen = store.snapshot().found_corners;
            cancel.cancel();
            seen
        };

        let (result, seen) = tokio::join!(calibrator.run(&camera, unit_square(), &cancel), capture);
        // Progress is cleared once the run ends.
        assert!(store.snapshot().found_corners.is_empty());
        (result, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_solves_on_cancel() {
        let scene = SimScene::shared(320, 240);
        scene.write().set_table_corners(table_corners());

        let (result, seen) = calibrate(scene).await;
        assert_eq!(seen, vec![1, 2, 3, 4]);
        let calibration = result.unwrap();
        assert_eq!(calibration.found_corners, vec![1, 2, 3, 4]);
        let p = calibration.pixel_to_table(PixelPoint::new(280, 36));
        assert!((p.x - 1.0).abs() < 1e-3 && p.y.abs() < 1e-3, "{p:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fails_with_missing_corner() {
        let scene = SimScene::shared(320, 240);
        let mut corners = table_corners();
        // Pushed out of frame, never detected.
        corners[3] = PixelPoint::new(315, 235);
        scene.write().set_table_corners(corners);

        match calibrate(scene).await.0 {
            Err(CalibrationError::InsufficientCorners { found }) => assert_eq!(found, vec![1, 2, 3]),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
