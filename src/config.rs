//! Configuration System using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. A TOML file (`config/table_tracker.toml` unless another path is given)
//! 3. Environment variables prefixed with `TABLE_TRACKER_`, nested keys
//!    separated by a double underscore
//!
//! ```text
//! TABLE_TRACKER_APPLICATION__LOG_LEVEL=debug
//! TABLE_TRACKER_TRACKING__AUTO_EXPOSURE=true
//! TABLE_TRACKER_TRANSPORT__LISTEN=0.0.0.0:7878
//! ```
//!
//! Durations are written in humantime form (`"500ms"`, `"5s"`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationConfig;
use crate::error::{AppResult, TrackerError};
use crate::exposure::ExposureConfig;
use crate::frames::FrameQueueConfig;
use crate::protocol::ProtocolConfig;
use crate::tracker::TrackerParams;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/table_tracker.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TABLE_TRACKER_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Process settings
    pub application: ApplicationConfig,
    /// Device identity
    pub device: DeviceConfig,
    /// Camera output format
    pub camera: CameraConfig,
    /// Marker tracking
    pub tracking: TrackingConfig,
    /// Exposure control loop
    pub exposure: ExposureConfig,
    /// Pose calibration
    pub calibration: CalibrationConfig,
    /// Packet channel limits
    pub protocol: ProtocolConfig,
    /// Peer transport
    pub transport: TransportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "table-tracker".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Device identity reported by `GetStatus`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identifier; the host name when unset
    pub id: Option<String>,
    /// Reported firmware version
    pub version: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl DeviceConfig {
    /// Configured id, or the host name.
    pub fn resolved_id(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                tracing::warn!("Failed to read host name: {e}");
                "table-tracker".to_string()
            }
        }
    }
}

/// Camera output format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frame pacing of the simulated camera
    #[serde(with = "humantime_serde")]
    pub frame_interval: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_interval: Duration::from_millis(33),
        }
    }
}

/// Marker tracking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Unmatched markers older than this are dropped
    #[serde(with = "humantime_serde")]
    pub staleness: Duration,
    /// Smallest blob area treated as a marker
    pub min_blob_area: f64,
    /// Squared pixel radius for matching
    pub match_radius_sq: f64,
    /// Markers tracked for less than this are not reported
    #[serde(with = "humantime_serde")]
    pub min_marker_age: Duration,
    /// Identifier pool size (1..=255)
    pub max_markers: u32,
    /// Fixed exposure while tracking, in microseconds
    pub exposure_us: u32,
    /// Run the exposure loop instead of the fixed exposure
    pub auto_exposure: bool,
    /// Upper bound on the exposure loop
    #[serde(with = "humantime_serde")]
    pub auto_exposure_deadline: Duration,
    /// Frame queue of the tracking task
    pub frame_queue: FrameQueueConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_millis(500),
            min_blob_area: 10.0,
            match_radius_sq: 20_000.0,
            min_marker_age: Duration::from_millis(100),
            max_markers: 255,
            exposure_us: 1000,
            auto_exposure: false,
            auto_exposure_deadline: Duration::from_secs(5),
            frame_queue: FrameQueueConfig::default(),
        }
    }
}

impl TrackingConfig {
    /// Matching parameters for [`crate::tracker::MarkerTracker`].
    pub fn tracker_params(&self) -> TrackerParams {
        TrackerParams {
            staleness: self.staleness,
            min_blob_area: self.min_blob_area,
            match_radius_sq: self.match_radius_sq,
            max_markers: u8::try_from(self.max_markers).unwrap_or(u8::MAX),
        }
    }
}

/// Peer transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP listen address
    pub listen: SocketAddr,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7878)),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load from the default file (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` (if present) and the environment, then validate.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Config`] when a layer fails to parse and
    /// [`TrackerError::Configuration`] when validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Camera resolution is non-zero
    /// - Exposure range is ordered and contains the initial exposure
    /// - Loop periods, timeouts and queue capacities are non-zero
    /// - `max_markers` is within 1..=255
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(invalid(format!(
                "Invalid camera resolution {}x{}",
                self.camera.width, self.camera.height
            )));
        }

        let exposure = &self.exposure;
        if exposure.min_us >= exposure.max_us {
            return Err(invalid(format!(
                "Exposure range is empty: min_us {} >= max_us {}",
                exposure.min_us, exposure.max_us
            )));
        }
        if !(exposure.min_us..=exposure.max_us).contains(&exposure.initial_us) {
            return Err(invalid(format!(
                "Initial exposure {} outside {}..={}",
                exposure.initial_us, exposure.min_us, exposure.max_us
            )));
        }
        if exposure.deadzone <= 0.0 {
            return Err(invalid("Exposure deadzone must be positive".to_string()));
        }
        if exposure.threshold == 0 {
            return Err(invalid("Exposure threshold must be positive".to_string()));
        }
        if exposure.target_bright_pixels == Some(0) {
            return Err(invalid("target_bright_pixels must be positive".to_string()));
        }

        let tracking = &self.tracking;
        if !(1..=255).contains(&tracking.max_markers) {
            return Err(invalid(format!(
                "Invalid max_markers {}. Must be 1-255",
                tracking.max_markers
            )));
        }
        if tracking.frame_queue.capacity == 0 {
            return Err(invalid("Frame queue capacity must be positive".to_string()));
        }
        if tracking.match_radius_sq <= 0.0 || tracking.min_blob_area < 0.0 {
            return Err(invalid(
                "match_radius_sq must be positive and min_blob_area non-negative".to_string(),
            ));
        }

        for (name, period) in [
            ("exposure.loop_period", exposure.loop_period),
            ("calibration.loop_period", self.calibration.loop_period),
            ("tracking.staleness", tracking.staleness),
            ("protocol.request_timeout", self.protocol.request_timeout),
        ] {
            if period.is_zero() {
                return Err(invalid(format!("{name} must be non-zero")));
            }
        }

        if self.protocol.max_payload == 0 {
            return Err(invalid("protocol.max_payload must be positive".to_string()));
        }

        Ok(())
    }
}

fn invalid(message: String) -> TrackerError {
    TrackerError::Configuration(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::OverflowPolicy;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.tracking.staleness, Duration::from_millis(500));
        assert_eq!(settings.exposure.initial_us, 15_000);
        assert_eq!(settings.calibration.exposure_us, 15_000);
        assert_eq!(settings.protocol.max_payload, 512);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_inverted_exposure_range() {
        let mut settings = Settings::default();
        settings.exposure.min_us = 30_000;
        settings.exposure.max_us = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_max_markers_bounds() {
        let mut settings = Settings::default();
        settings.tracking.max_markers = 0;
        assert!(settings.validate().is_err());
        settings.tracking.max_markers = 256;
        assert!(settings.validate().is_err());
        settings.tracking.max_markers = 16;
        assert!(settings.validate().is_ok());
        assert_eq!(settings.tracking.tracker_params().max_markers, 16);
    }

    #[test]
    fn test_zero_queue_capacity() {
        let mut settings = Settings::default();
        settings.tracking.frame_queue.capacity = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_toml_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[tracking]
staleness = "750ms"
auto_exposure = true

[tracking.frame_queue]
capacity = 4
overflow = "drop_newest"

[transport]
listen = "0.0.0.0:9000"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.tracking.staleness, Duration::from_millis(750));
        assert!(settings.tracking.auto_exposure);
        assert_eq!(settings.tracking.frame_queue.capacity, 4);
        assert_eq!(settings.tracking.frame_queue.overflow, OverflowPolicy::DropNewest);
        assert_eq!(settings.transport.listen.port(), 9000);
        // Untouched sections keep their defaults.
        assert_eq!(settings.exposure, ExposureConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("TABLE_TRACKER_TRACKING__MAX_MARKERS", "32");
        std::env::set_var("TABLE_TRACKER_DEVICE__ID", "bench-unit");
        let settings = Settings::load_from("does/not/exist.toml");
        std::env::remove_var("TABLE_TRACKER_TRACKING__MAX_MARKERS");
        std::env::remove_var("TABLE_TRACKER_DEVICE__ID");

        let settings = settings.unwrap();
        assert_eq!(settings.tracking.max_markers, 32);
        assert_eq!(settings.device.resolved_id(), "bench-unit");
    }

    #[test]
    #[serial]
    fn test_invalid_file_value_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[exposure]\nmin_us = 500\nmax_us = 400").unwrap();
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, TrackerError::Configuration(_)));
    }
}
