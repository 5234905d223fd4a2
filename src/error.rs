//! Custom error types for the tracker.
//!
//! This module defines the primary error type, `TrackerError`, plus the narrower
//! error enums owned by individual subsystems. Using the `thiserror` crate, it
//! provides a centralized and consistent way to handle failures, from I/O and
//! configuration issues to protocol and camera problems.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while merging defaults, the TOML
//!   file and environment overrides.
//! - **`Configuration`**: Semantic validation failures (values that parse but
//!   make no sense, such as an inverted exposure range).
//! - **`Io`** / **`Serialization`**: File and JSON failures, mostly around the
//!   persisted calibration blob.
//! - **`Camera`**: Construction-time camera failures, including a second open
//!   while the single camera lease is checked out.
//! - **`Protocol`**: Undecodable packets, oversized payloads and request deadlines.
//! - **`Calibration`**: Calibration runs that could not produce a homography.
//! - **`SessionClosed`**: The session actor has shut down and can no longer
//!   answer commands.
//!
//! By using `#[from]`, `TrackerError` can be created from the subsystem errors
//! with the `?` operator.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, TrackerError>;

/// Crate-level error.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Configuration could not be loaded or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Camera could not be opened or driven.
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    /// Packet protocol failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Calibration run failed.
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// The session actor is gone.
    #[error("Session controller is no longer running")]
    SessionClosed,
}

/// Errors raised by the camera lease and drivers.
#[derive(Error, Debug)]
pub enum CameraError {
    /// The single camera handle is already checked out.
    #[error("Camera is already open (held by '{holder}')")]
    AlreadyOpen {
        /// Name given by the current lease holder.
        holder: String,
    },

    /// Driver-level failure.
    #[error("Camera driver error: {0}")]
    Driver(String),
}

/// Errors raised by the packet channel.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Inbound bytes were not a valid packet.
    #[error("Failed to decode packet: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Encoded packet does not fit in a single transport write.
    #[error("Packet of {size} bytes exceeds the transport payload limit of {max} bytes")]
    PayloadTooLarge {
        /// Encoded size.
        size: usize,
        /// Transport limit.
        max: usize,
    },

    /// No response arrived before the deadline.
    #[error("Request {request_id} timed out after {timeout:?}")]
    DeadlineExceeded {
        /// Correlation id of the abandoned request.
        request_id: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The response waiter was dropped without an answer.
    #[error("Response channel for request {0} closed")]
    ChannelClosed(String),

    /// A response arrived without a payload.
    #[error("Packet {0} carried no message")]
    EmptyPacket(String),
}

/// Errors raised while computing or persisting a calibration.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Fewer than four table corners were ever observed.
    #[error("Not enough corners found: {found:?}")]
    InsufficientCorners {
        /// Corner ids that were observed.
        found: Vec<i32>,
    },

    /// The corner correspondences do not define a homography.
    #[error("Degenerate corner configuration")]
    Degenerate,

    /// A persisted matrix blob is malformed.
    #[error("Invalid matrix blob: {0}")]
    InvalidMatrix(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::Configuration("max_markers must be 1..=255".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: max_markers must be 1..=255"
        );
    }

    #[test]
    fn test_camera_error_wraps() {
        let err: TrackerError = CameraError::AlreadyOpen {
            holder: "capture".into(),
        }
        .into();
        assert!(err.to_string().contains("already open"));
        assert!(err.to_string().contains("capture"));
    }

    #[test]
    fn test_deadline_error_names_request() {
        let err = ProtocolError::DeadlineExceeded {
            request_id: "abc".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Request abc timed out after 250ms");
    }
}
