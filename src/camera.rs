//! Camera and vision capability boundary.
//!
//! The control plane never touches raw frame memory or vision primitives
//! directly. Everything hardware-facing goes through two capability traits:
//!
//! - [`CameraDriver`]: frame delivery, start/stop and exposure control.
//! - [`VisionBackend`]: thresholding, blob extraction and fiducial detection.
//!
//! Only one camera handle may exist at a time. Instead of a process-wide lock,
//! a [`CameraSlot`] hands out a [`CameraLease`]; the slot is checked back in
//! when the last clone of the lease is dropped.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use nalgebra::Point2;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::CameraError;
use crate::geometry::PixelPoint;

/// Colour channel of an interleaved RGB frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Red, where the retro-reflective markers show up.
    Red = 0,
    /// Green.
    Green = 1,
    /// Blue, used (inverted) for fiducial detection.
    Blue = 2,
}

/// A captured frame in interleaved 8-bit RGB.
#[derive(Clone)]
pub struct Frame {
    /// Monotonic capture counter.
    pub sequence: u64,
    /// Capture timestamp.
    pub captured_at: Instant,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `width * height * 3` bytes, row-major.
    pub pixels: Arc<[u8]>,
}

impl Frame {
    /// Value of `channel` at (`x`, `y`), or `None` outside the frame.
    pub fn sample(&self, x: u32, y: u32, channel: Channel) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y * self.width + x) * 3) as usize + channel as usize;
        self.pixels.get(idx).copied()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Axis-aligned bounding box in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BoundingBox {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width.
    pub width: i32,
    /// Height.
    pub height: i32,
}

impl BoundingBox {
    /// Integer centre of the box.
    pub fn center(&self) -> PixelPoint {
        PixelPoint::new(self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// An external contour found in a thresholded image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Blob {
    /// Contour area in square pixels.
    pub area: f64,
    /// Bounding box of the contour.
    pub bounds: BoundingBox,
}

impl Blob {
    /// Position used for marker matching.
    pub fn centroid(&self) -> PixelPoint {
        self.bounds.center()
    }
}

/// A decoded fiducial marker.
#[derive(Clone, Debug, PartialEq)]
pub struct FiducialDetection {
    /// Dictionary identifier.
    pub id: i32,
    /// Corner pixels in detector order (top-left first).
    pub corners: [Point2<f64>; 4],
}

/// Frame source with exposure control.
#[async_trait]
pub trait CameraDriver: Send + Sync {
    /// Configured output size `(width, height)`.
    fn resolution(&self) -> (u32, u32);

    /// Begin streaming frames.
    async fn start(&self) -> Result<()>;

    /// Stop streaming; pending `next_frame` calls return an error.
    async fn stop(&self) -> Result<()>;

    /// Wait for the next frame.
    async fn next_frame(&self) -> Result<Frame>;

    /// Current exposure in microseconds.
    async fn exposure(&self) -> Result<u32>;

    /// Set exposure in microseconds.
    async fn set_exposure(&self, micros: u32) -> Result<()>;
}

/// Image-processing primitives.
pub trait VisionBackend: Send + Sync {
    /// Number of pixels in `channel` at or above `threshold`.
    fn count_bright_pixels(&self, frame: &Frame, channel: Channel, threshold: u8) -> Result<usize>;

    /// External contours of the binary image `channel >= threshold`.
    fn find_blobs(&self, frame: &Frame, channel: Channel, threshold: u8) -> Result<Vec<Blob>>;

    /// Fiducial markers from the fixed four-corner dictionary.
    fn detect_fiducials(&self, frame: &Frame) -> Result<Vec<FiducialDetection>>;
}

/// Owner of the single camera handle.
pub struct CameraSlot {
    driver: Arc<dyn CameraDriver>,
    holder: Arc<Mutex<Option<String>>>,
}

impl CameraSlot {
    /// Wraps a driver. The driver is unusable until leased.
    pub fn new(driver: Arc<dyn CameraDriver>) -> Self {
        Self {
            driver,
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Checks the camera out to `holder`.
    ///
    /// Fails with [`CameraError::AlreadyOpen`] while another lease is alive.
    pub fn open(&self, holder: &str) -> Result<Arc<CameraLease>, CameraError> {
        let mut current = self.holder.lock();
        if let Some(existing) = current.as_ref() {
            return Err(CameraError::AlreadyOpen {
                holder: existing.clone(),
            });
        }
        *current = Some(holder.to_string());
        tracing::debug!(holder, "Camera lease checked out");

        Ok(Arc::new(CameraLease {
            driver: self.driver.clone(),
            holder: self.holder.clone(),
            name: holder.to_string(),
        }))
    }

    /// Name of the current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }
}

/// Exclusive access to the camera, released on drop.
pub struct CameraLease {
    driver: Arc<dyn CameraDriver>,
    holder: Arc<Mutex<Option<String>>>,
    name: String,
}

impl CameraLease {
    /// Name the lease was checked out under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Deref for CameraLease {
    type Target = dyn CameraDriver;

    fn deref(&self) -> &Self::Target {
        self.driver.as_ref()
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        *self.holder.lock() = None;
        tracing::debug!(holder = %self.name, "Camera lease checked in");
    }
}
