//! Closed-loop exposure control.
//!
//! The controller drives the camera exposure until the number of bright
//! red-channel pixels settles near a target count. Each tick measures the
//! latest frame, feeds the error to a [`Pid`] and adds the control signal to
//! the current exposure, clamped to the configured range.
//!
//! The loop ends when the control signal falls inside the deadzone
//! (`deadzone * target`) or when its cancellation token fires. Bounding the
//! run with a deadline is the caller's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::camera::{CameraDriver, Channel, VisionBackend};
use crate::frames::FrameHub;

/// Proportional, integral and derivative gains.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    /// Proportional gain.
    pub p: f64,
    /// Integral gain.
    pub i: f64,
    /// Derivative gain.
    pub d: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            p: 5.0,
            i: 0.0,
            d: 0.01,
        }
    }
}

/// Textbook PID controller.
///
/// The derivative term is computed on the error, so the first update after a
/// reset sees a derivative of `error / dt`.
#[derive(Clone, Debug, Default)]
pub struct Pid {
    gains: PidGains,
    error: f64,
    integral: f64,
    derivative: f64,
    control: f64,
}

impl Pid {
    /// Controller with zeroed state.
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            ..Self::default()
        }
    }

    /// Feeds one sample and returns the new control signal.
    pub fn update(&mut self, reference: f64, actual: f64, dt: Duration) -> f64 {
        let dt = dt.as_secs_f64();
        let error = reference - actual;

        if dt > 0.0 {
            self.integral += error * dt;
            self.derivative = (error - self.error) / dt;
        }
        self.error = error;
        self.control =
            self.gains.p * error + self.gains.i * self.integral + self.gains.d * self.derivative;
        self.control
    }

    /// Last control signal.
    pub fn control(&self) -> f64 {
        self.control
    }

    /// Last error.
    pub fn error(&self) -> f64 {
        self.error
    }

    /// Clears integrator and derivative state.
    pub fn reset(&mut self) {
        *self = Self::new(self.gains);
    }
}

/// Exposure loop settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Target bright-pixel count. Derived from the resolution when unset.
    pub target_bright_pixels: Option<usize>,
    /// Convergence band as a fraction of the target.
    pub deadzone: f64,
    /// Tick period.
    #[serde(with = "humantime_serde")]
    pub loop_period: Duration,
    /// Controller gains.
    pub gains: PidGains,
    /// Lowest exposure the loop will command, in microseconds.
    pub min_us: u32,
    /// Highest exposure the loop will command, in microseconds.
    pub max_us: u32,
    /// Exposure applied before the first tick.
    pub initial_us: u32,
    /// Red-channel level counted as bright.
    pub threshold: u8,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            target_bright_pixels: None,
            deadzone: 0.01,
            loop_period: Duration::from_millis(100),
            gains: PidGains::default(),
            min_us: 100,
            max_us: 30_000,
            initial_us: 15_000,
            threshold: 175,
        }
    }
}

impl ExposureConfig {
    /// Configured target, or two markers' worth of pixels (0.005% of the frame each).
    pub fn target_for(&self, width: u32, height: u32) -> usize {
        self.target_bright_pixels
            .unwrap_or_else(|| (2.0 * 0.00005 * f64::from(width) * f64::from(height)) as usize)
            .max(1)
    }
}

/// How an exposure run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureOutcome {
    /// The loop settled on this exposure.
    Converged(u32),
    /// The loop was cancelled before settling.
    Cancelled,
}

impl ExposureOutcome {
    /// Converged exposure, if any.
    pub fn exposure(self) -> Option<u32> {
        match self {
            Self::Converged(us) => Some(us),
            Self::Cancelled => None,
        }
    }
}

/// PID loop over camera exposure.
pub struct ExposureController {
    config: ExposureConfig,
    target: f64,
}

impl ExposureController {
    /// Controller aiming for `target` bright pixels.
    pub fn new(config: ExposureConfig, target: usize) -> Self {
        Self {
            config,
            target: target as f64,
        }
    }

    /// Target bright-pixel count.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Runs until convergence or cancellation.
    ///
    /// Frames are read from `frames.latest()`; ticks without a frame, and
    /// ticks where the camera or the vision backend fails, are skipped.
    pub async fn run(
        &self,
        camera: &dyn CameraDriver,
        vision: &dyn VisionBackend,
        frames: &FrameHub,
        cancel: &CancellationToken,
    ) -> ExposureOutcome {
        let mut pid = Pid::new(self.config.gains);
        let deadzone = self.config.deadzone * self.target;
        let period = self.config.loop_period;

        if let Err(e) = camera.set_exposure(self.config.initial_us).await {
            tracing::warn!("Failed to apply initial exposure: {e:#}");
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(ticks, "Exposure calibration cancelled");
                    return ExposureOutcome::Cancelled;
                }
                _ = ticker.tick() => {}
            }
            ticks += 1;

            let Some(frame) = frames.latest() else {
                tracing::debug!("No frame yet, skipping exposure tick");
                continue;
            };
            let measured =
                match vision.count_bright_pixels(&frame, Channel::Red, self.config.threshold) {
                    Ok(count) => count as f64,
                    Err(e) => {
                        tracing::warn!("Bright pixel count failed: {e:#}");
                        continue;
                    }
                };
            let current = match camera.exposure().await {
                Ok(us) => us,
                Err(e) => {
                    tracing::warn!("Failed to read exposure: {e:#}");
                    continue;
                }
            };

            let control = pid.update(self.target, measured, period);
            let next = self.clamp(f64::from(current) + control);

            if control.abs() < deadzone {
                tracing::info!(exposure_us = next, measured, ticks, "Exposure converged");
                if next != current {
                    if let Err(e) = camera.set_exposure(next).await {
                        tracing::warn!("Failed to apply converged exposure: {e:#}");
                    }
                }
                return ExposureOutcome::Converged(next);
            }

            tracing::debug!(
                measured,
                target = self.target,
                control,
                previous_us = current,
                exposure_us = next,
                "Adjusting exposure"
            );
            if let Err(e) = camera.set_exposure(next).await {
                tracing::warn!("Failed to set exposure: {e:#}");
            }
        }
    }

    fn clamp(&self, exposure: f64) -> u32 {
        let (min, max) = (f64::from(self.config.min_us), f64::from(self.config.max_us));
        exposure.clamp(min, max).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Blob, FiducialDetection, Frame};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Camera whose exposure is a shared counter; frames are never pulled.
    struct StubCamera {
        exposure: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CameraDriver for StubCamera {
        fn resolution(&self) -> (u32, u32) {
            (1, 1)
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn next_frame(&self) -> Result<Frame> {
            anyhow::bail!("not streaming")
        }
        async fn exposure(&self) -> Result<u32> {
            Ok(self.exposure.load(Ordering::SeqCst))
        }
        async fn set_exposure(&self, micros: u32) -> Result<()> {
            self.exposure.store(micros, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Bright-pixel count proportional to exposure.
    struct LinearVision {
        exposure: Arc<AtomicU32>,
        divisor: u32,
    }

    impl VisionBackend for LinearVision {
        fn count_bright_pixels(&self, _: &Frame, _: Channel, _: u8) -> Result<usize> {
            Ok((self.exposure.load(Ordering::SeqCst) / self.divisor) as usize)
        }
        fn find_blobs(&self, _: &Frame, _: Channel, _: u8) -> Result<Vec<Blob>> {
            Ok(Vec::new())
        }
        fn detect_fiducials(&self, _: &Frame) -> Result<Vec<FiducialDetection>> {
            Ok(Vec::new())
        }
    }

    fn hub_with_frame() -> Arc<FrameHub> {
        let hub = FrameHub::new();
        hub.publish(Frame {
            sequence: 0,
            captured_at: Instant::now(),
            width: 1,
            height: 1,
            pixels: vec![0, 0, 0].into(),
        });
        hub
    }

    #[test]
    fn test_pid_first_update() {
        let mut pid = Pid::new(PidGains::default());
        let control = pid.update(10.0, 20.0, Duration::from_millis(100));
        // 5 * -10 + 0.01 * (-10 / 0.1)
        assert!((control - -51.0).abs() < 1e-9);
        assert_eq!(pid.error(), -10.0);
    }

    #[test]
    fn test_pid_integral_accumulates() {
        let mut pid = Pid::new(PidGains { p: 0.0, i: 1.0, d: 0.0 });
        pid.update(1.0, 0.0, Duration::from_secs(1));
        let control = pid.update(1.0, 0.0, Duration::from_secs(1));
        assert!((control - 2.0).abs() < 1e-9);

        pid.reset();
        assert_eq!(pid.control(), 0.0);
    }

    #[test]
    fn test_default_target_from_resolution() {
        let config = ExposureConfig::default();
        assert_eq!(config.target_for(1280, 720), 92);
        let fixed = ExposureConfig {
            target_bright_pixels: Some(40),
            ..ExposureConfig::default()
        };
        assert_eq!(fixed.target_for(1280, 720), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_from_ten_times_target() {
        let exposure = Arc::new(AtomicU32::new(0));
        let camera = StubCamera {
            exposure: exposure.clone(),
        };
        let vision = LinearVision {
            exposure: exposure.clone(),
            divisor: 10,
        };
        let hub = hub_with_frame();

        // Initial 15000us measures 1500 bright pixels against a target of 150.
        let controller = ExposureController::new(ExposureConfig::default(), 150);
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            controller.run(&camera, &vision, &hub, &cancel),
        )
        .await
        .unwrap();

        let converged = outcome.exposure().unwrap();
        assert!((1400..=1600).contains(&converged), "converged at {converged}");
        assert_eq!(exposure.load(Ordering::SeqCst), converged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_sentinel_and_clamps() {
        let exposure = Arc::new(AtomicU32::new(0));
        let camera = StubCamera {
            exposure: exposure.clone(),
        };
        // Never bright enough: the loop keeps pushing exposure up.
        let vision = LinearVision {
            exposure: exposure.clone(),
            divisor: u32::MAX,
        };
        let hub = hub_with_frame();
        let controller = ExposureController::new(ExposureConfig::default(), 1000);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let outcome = controller.run(&camera, &vision, &hub, &cancel).await;
        assert_eq!(outcome, ExposureOutcome::Cancelled);
        assert_eq!(exposure.load(Ordering::SeqCst), 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_simulated_scene() {
        use crate::hardware::sim::{SimCamera, SimScene, SimVision};

        let scene = SimScene::shared(160, 120);
        scene.write().add_marker(crate::geometry::PixelPoint::new(80, 60), 10);
        let camera = SimCamera::with_frame_interval(scene.clone(), Duration::from_millis(10));
        let vision = SimVision::new(scene);
        camera.start().await.unwrap();

        let hub = FrameHub::new();
        // Pixel counts move in rings, so allow a wide band.
        let config = ExposureConfig {
            deadzone: 0.5,
            ..ExposureConfig::default()
        };
        let controller = ExposureController::new(config, 100);
        let cancel = CancellationToken::new();

        let capture = async {
            loop {
                if let Ok(frame) = camera.next_frame().await {
                    hub.publish(frame);
                }
            }
        };
        let outcome = tokio::select! {
            outcome = controller.run(&camera, &vision, &hub, &cancel) => outcome,
            _ = capture => unreachable!(),
            _ = tokio::time::sleep(Duration::from_secs(60)) => ExposureOutcome::Cancelled,
        };
        assert!(outcome.exposure().is_some());
    }
}
