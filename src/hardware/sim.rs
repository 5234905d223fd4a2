//! Simulated Camera and Vision Backend
//!
//! Provides a synthetic table scene for running the control plane without the
//! device. All waits use `tokio::time::sleep`, so tests can drive the camera
//! with a paused clock.
//!
//! # Scene Model
//!
//! - Markers are red discs with a linear radial falloff. Peak brightness grows
//!   with exposure, so the number of pixels above a threshold grows smoothly
//!   and monotonically with exposure.
//! - The background is a dim uniform level, also scaled by exposure.
//! - Four fiducials (ids 1..=4) sit at the table corners. Fiducial decoding is
//!   not simulated at the pixel level; [`SimVision`] reports them straight
//!   from the scene.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use nalgebra::Point2;
use parking_lot::RwLock;
use tokio::time::{sleep, Instant};

use crate::camera::{BoundingBox, Blob, CameraDriver, Channel, FiducialDetection, Frame, VisionBackend};
use crate::geometry::PixelPoint;

/// Brightness per microsecond of exposure for a fully reflective surface.
const BRIGHTNESS_PER_US: f64 = 0.3;

/// A reflective marker in the scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimMarker {
    /// Centre in pixels.
    pub position: PixelPoint,
    /// Radius in pixels.
    pub radius: u32,
    /// Fraction of light returned, 0..=1.
    pub reflectance: f64,
}

/// Synthetic table scene shared between [`SimCamera`] and [`SimVision`].
#[derive(Clone, Debug)]
pub struct SimScene {
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Background reflectance.
    pub ambient: f64,
    /// Markers on the table.
    pub markers: Vec<SimMarker>,
    /// Visible fiducials.
    pub fiducials: Vec<FiducialDetection>,
}

/// Scene handle shared by the simulated devices.
pub type SharedScene = Arc<RwLock<SimScene>>;

impl SimScene {
    /// Empty scene.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ambient: 0.01,
            markers: Vec::new(),
            fiducials: Vec::new(),
        }
    }

    /// Empty scene wrapped for sharing.
    pub fn shared(width: u32, height: u32) -> SharedScene {
        Arc::new(RwLock::new(Self::new(width, height)))
    }

    /// Table corners inset from the frame edges with two markers on it.
    pub fn demo(width: u32, height: u32) -> SharedScene {
        let mut scene = Self::new(width, height);
        let (w, h) = (width as i32, height as i32);
        scene.set_table_corners([
            PixelPoint::new(w / 8, h / 8),
            PixelPoint::new(w * 7 / 8, h / 8),
            PixelPoint::new(w / 8, h * 7 / 8),
            PixelPoint::new(w * 7 / 8, h * 7 / 8),
        ]);
        scene.add_marker(PixelPoint::new(w / 3, h / 2), 6);
        scene.add_marker(PixelPoint::new(w * 2 / 3, h / 3), 6);
        Arc::new(RwLock::new(scene))
    }

    /// Adds a fully reflective marker and returns its index.
    pub fn add_marker(&mut self, position: PixelPoint, radius: u32) -> usize {
        self.markers.push(SimMarker {
            position,
            radius,
            reflectance: 1.0,
        });
        self.markers.len() - 1
    }

    /// Places fiducials 1..=4 with their first corner on `corners`
    /// (top-left, top-right, bottom-left, bottom-right).
    pub fn set_table_corners(&mut self, corners: [PixelPoint; 4]) {
        self.fiducials = corners
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let (x, y) = (f64::from(c.x), f64::from(c.y));
                FiducialDetection {
                    id: i as i32 + 1,
                    corners: [
                        Point2::new(x, y),
                        Point2::new(x + 20.0, y),
                        Point2::new(x + 20.0, y + 20.0),
                        Point2::new(x, y + 20.0),
                    ],
                }
            })
            .collect();
    }

    fn render(&self, exposure_us: u32) -> Vec<u8> {
        let gain = f64::from(exposure_us) * BRIGHTNESS_PER_US;
        let background = (self.ambient * gain).min(255.0) as u8;
        let mut pixels = vec![background; (self.width * self.height * 3) as usize];

        for marker in &self.markers {
            let peak = marker.reflectance * gain;
            let r = marker.radius as i32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let (x, y) = (marker.position.x + dx, marker.position.y + dy);
                    if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
                        continue;
                    }
                    let dist = f64::from(dx * dx + dy * dy).sqrt();
                    if dist > f64::from(r) {
                        continue;
                    }
                    let level = (peak * (1.0 - dist / (f64::from(r) + 1.0))).min(255.0) as u8;
                    let idx = ((y as u32 * self.width + x as u32) * 3) as usize;
                    pixels[idx] = pixels[idx].max(level);
                }
            }
        }

        pixels
    }
}

/// Simulated camera rendering the shared scene.
pub struct SimCamera {
    scene: SharedScene,
    exposure_us: AtomicU32,
    running: AtomicBool,
    sequence: AtomicU64,
    frame_interval: Duration,
}

impl SimCamera {
    /// Camera at 30 fps with 15 ms exposure.
    pub fn new(scene: SharedScene) -> Self {
        Self::with_frame_interval(scene, Duration::from_millis(33))
    }

    /// Camera with custom frame pacing.
    pub fn with_frame_interval(scene: SharedScene, frame_interval: Duration) -> Self {
        Self {
            scene,
            exposure_us: AtomicU32::new(15_000),
            running: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            frame_interval,
        }
    }

    /// True while streaming.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraDriver for SimCamera {
    fn resolution(&self) -> (u32, u32) {
        let scene = self.scene.read();
        (scene.width, scene.height)
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("SimCamera: already streaming");
        }
        tracing::info!("SimCamera: stream started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("SimCamera: stream stopped");
        }
        Ok(())
    }

    async fn next_frame(&self) -> Result<Frame> {
        if !self.is_running() {
            bail!("SimCamera: not streaming");
        }
        sleep(self.frame_interval).await;

        let exposure = self.exposure_us.load(Ordering::SeqCst);
        let (width, height, pixels) = {
            let scene = self.scene.read();
            (scene.width, scene.height, scene.render(exposure))
        };

        Ok(Frame {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            captured_at: Instant::now(),
            width,
            height,
            pixels: pixels.into(),
        })
    }

    async fn exposure(&self) -> Result<u32> {
        Ok(self.exposure_us.load(Ordering::SeqCst))
    }

    async fn set_exposure(&self, micros: u32) -> Result<()> {
        self.exposure_us.store(micros, Ordering::SeqCst);
        Ok(())
    }
}

/// Software vision backend over [`SimScene`] frames.
///
/// Thresholding and blob extraction run on the actual pixels; fiducials are
/// read from the scene.
pub struct SimVision {
    scene: SharedScene,
}

impl SimVision {
    /// Backend bound to `scene`.
    pub fn new(scene: SharedScene) -> Self {
        Self { scene }
    }
}

impl VisionBackend for SimVision {
    fn count_bright_pixels(&self, frame: &Frame, channel: Channel, threshold: u8) -> Result<usize> {
        Ok(frame
            .pixels
            .iter()
            .skip(channel as usize)
            .step_by(3)
            .filter(|&&v| v >= threshold)
            .count())
    }

    fn find_blobs(&self, frame: &Frame, channel: Channel, threshold: u8) -> Result<Vec<Blob>> {
        let (w, h) = (frame.width as usize, frame.height as usize);
        if frame.pixels.len() < w * h * 3 {
            bail!("frame {} is truncated", frame.sequence);
        }

        let mask: Vec<bool> = frame
            .pixels
            .iter()
            .skip(channel as usize)
            .step_by(3)
            .take(w * h)
            .map(|&v| v >= threshold)
            .collect();
        let mut visited = vec![false; w * h];
        let mut blobs = Vec::new();
        let mut queue = VecDeque::new();

        for start in 0..w * h {
            if !mask[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            queue.push_back(start);

            let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
            let mut area = 0usize;

            while let Some(idx) = queue.pop_front() {
                let (x, y) = (idx % w, idx / w);
                area += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);

                let mut visit = |n: usize| {
                    if mask[n] && !visited[n] {
                        visited[n] = true;
                        queue.push_back(n);
                    }
                };
                if x > 0 {
                    visit(idx - 1);
                }
                if x + 1 < w {
                    visit(idx + 1);
                }
                if y > 0 {
                    visit(idx - w);
                }
                if y + 1 < h {
                    visit(idx + w);
                }
            }

            blobs.push(Blob {
                area: area as f64,
                bounds: BoundingBox {
                    x: min_x as i32,
                    y: min_y as i32,
                    width: (max_x - min_x + 1) as i32,
                    height: (max_y - min_y + 1) as i32,
                },
            });
        }

        Ok(blobs)
    }

    fn detect_fiducials(&self, frame: &Frame) -> Result<Vec<FiducialDetection>> {
        let scene = self.scene.read();
        let (w, h) = (f64::from(frame.width), f64::from(frame.height));
        Ok(scene
            .fiducials
            .iter()
            .filter(|f| {
                f.corners
                    .iter()
                    .all(|c| (0.0..w).contains(&c.x) && (0.0..h).contains(&c.y))
            })
            .cloned()
            .collect())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn frame_at(scene: &SharedScene, exposure: u32) -> Frame {
        let camera = SimCamera::with_frame_interval(scene.clone(), Duration::from_millis(1));
        camera.set_exposure(exposure).await.unwrap();
        camera.start().await.unwrap();
        camera.next_frame().await.unwrap()
    }

    #[tokio::test]
    async fn test_camera_requires_start() {
        let camera = SimCamera::new(SimScene::shared(32, 32));
        assert!(camera.next_frame().await.is_err());

        camera.start().await.unwrap();
        assert!(camera.start().await.is_err());
        let frame = camera.next_frame().await.unwrap();
        assert_eq!((frame.width, frame.height), (32, 32));
        assert_eq!(frame.pixels.len(), 32 * 32 * 3);

        camera.stop().await.unwrap();
        assert!(!camera.is_running());
    }

    #[tokio::test]
    async fn test_bright_pixels_grow_with_exposure() {
        let scene = SimScene::shared(80, 60);
        scene.write().add_marker(PixelPoint::new(40, 30), 8);
        let vision = SimVision::new(scene.clone());

        let mut last = 0;
        for exposure in [500, 700, 1000, 2000, 5000] {
            let frame = frame_at(&scene, exposure).await;
            let count = vision.count_bright_pixels(&frame, Channel::Red, 175).unwrap();
            assert!(count >= last, "{count} < {last} at {exposure}us");
            last = count;
        }
        assert!(last > 0);
    }

    #[tokio::test]
    async fn test_blobs_found_per_marker() {
        let scene = SimScene::shared(100, 80);
        scene.write().add_marker(PixelPoint::new(20, 20), 5);
        scene.write().add_marker(PixelPoint::new(70, 50), 5);
        let vision = SimVision::new(scene.clone());

        let frame = frame_at(&scene, 1000).await;
        let mut blobs = vision.find_blobs(&frame, Channel::Red, 175).unwrap();
        blobs.sort_by_key(|b| b.bounds.x);

        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].centroid(), PixelPoint::new(20, 20));
        assert_eq!(blobs[1].centroid(), PixelPoint::new(70, 50));
        assert!(blobs[0].area >= 10.0);
    }

    #[tokio::test]
    async fn test_fiducials_outside_frame_hidden() {
        let scene = SimScene::shared(200, 100);
        scene.write().set_table_corners([
            PixelPoint::new(10, 10),
            PixelPoint::new(150, 10),
            PixelPoint::new(10, 70),
            PixelPoint::new(190, 90),
        ]);
        let vision = SimVision::new(scene.clone());
        let frame = frame_at(&scene, 1000).await;

        let ids: Vec<i32> = vision
            .detect_fiducials(&frame)
            .unwrap()
            .iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
