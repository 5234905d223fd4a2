//! Message types for the session actor
//!
//! This module defines the commands and replies exchanged between the
//! protocol request handler (and the app) and the `SessionController` actor.
//! Every transition and query goes through one command queue, so two
//! transitions can never run concurrently.

use std::collections::BTreeMap;

use nalgebra::Point2;
use tokio::sync::oneshot;

use crate::calibration::CalibrationSnapshot;
use crate::geometry::TablePoint;
use crate::tracker::MarkerId;

/// Session state. Exactly one at any instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No background task.
    #[default]
    Idle,
    /// Calibration task running.
    Calibrating,
    /// Tracking task running.
    Tracking,
}

/// Background task kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Pose calibration.
    Calibration,
    /// Marker tracking.
    Tracking,
}

/// Reply to `GetStatus`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    /// Device identifier.
    pub device_id: String,
    /// Firmware version.
    pub version: String,
    /// Current state.
    pub state: SessionState,
}

/// Lifecycle notifications published by the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A background task began running.
    TaskStarted(TaskKind),
    /// A background task fully exited.
    TaskStopped(TaskKind),
    /// The session state changed.
    StateChanged(SessionState),
}

/// Commands that can be sent to the SessionController
#[derive(Debug)]
pub enum SessionCommand {
    /// Start calibrating against the given real-world corners
    StartCalibration {
        real_corners: [Point2<f64>; 4],
        response: oneshot::Sender<()>,
    },

    /// Start tracking markers
    StartTracking { response: oneshot::Sender<()> },

    /// Stop whatever is running and go idle
    StopCurrent { response: oneshot::Sender<()> },

    /// Get device identity and state
    GetStatus {
        response: oneshot::Sender<SessionStatus>,
    },

    /// Get observed calibration corners
    GetCalibration {
        response: oneshot::Sender<CalibrationSnapshot>,
    },

    /// Get table positions of settled markers
    GetMarkerLocations {
        response: oneshot::Sender<BTreeMap<MarkerId, TablePoint>>,
    },

    /// Stop the active task and exit the actor loop
    Shutdown { response: oneshot::Sender<()> },
}

impl SessionCommand {
    /// Helper to create a StartCalibration command
    pub fn start_calibration(real_corners: [Point2<f64>; 4]) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartCalibration {
                real_corners,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StartTracking command
    pub fn start_tracking() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartTracking { response: tx }, rx)
    }

    /// Helper to create a StopCurrent command
    pub fn stop_current() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopCurrent { response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<SessionStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a GetCalibration command
    pub fn get_calibration() -> (Self, oneshot::Receiver<CalibrationSnapshot>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetCalibration { response: tx }, rx)
    }

    /// Helper to create a GetMarkerLocations command
    pub fn get_marker_locations() -> (Self, oneshot::Receiver<BTreeMap<MarkerId, TablePoint>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetMarkerLocations { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
