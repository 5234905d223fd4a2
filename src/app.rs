//! Application wiring.
//!
//! [`TrackerApp`] owns the long-running tasks of the device:
//!
//! ```text
//! CameraLease --capture--> FrameHub --> session task (calibration | tracking)
//!                                           ^
//! transport --drive--> ProtocolChannel --> SessionRequestHandler --> SessionController
//!                           |
//!                           `-- connection events --> watcher (disconnect => StopCurrent)
//! ```
//!
//! Startup failures (camera already open, unreadable calibration, bind
//! errors) are returned to the caller; nothing is left running.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::calibration::{Calibration, CalibrationStore};
use crate::camera::{CameraLease, CameraSlot, VisionBackend};
use crate::config::Settings;
use crate::error::{AppResult, CameraError};
use crate::frames::{spawn_capture, FrameHub};
use crate::messages::SessionEvent;
use crate::protocol::{ConnectionEvent, ProtocolChannel};
use crate::session::{SessionController, SessionHandle, SessionRequestHandler};
use crate::transport::{self, tcp::TcpPeripheral};

/// Transport events buffered ahead of the channel driver.
const TRANSPORT_EVENT_CAPACITY: usize = 64;

/// The running control plane.
pub struct TrackerApp {
    settings: Arc<Settings>,
    session: SessionHandle,
    session_task: JoinHandle<()>,
    channel: ProtocolChannel,
    store: Arc<CalibrationStore>,
    frames: Arc<FrameHub>,
    events: broadcast::Receiver<SessionEvent>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    _camera: Arc<CameraLease>,
}

impl TrackerApp {
    /// Opens the camera, loads the stored calibration and starts the capture,
    /// session and connection-watcher tasks.
    ///
    /// No transport is attached yet; see [`TrackerApp::serve_tcp`].
    pub async fn start(
        settings: Settings,
        slot: &CameraSlot,
        vision: Arc<dyn VisionBackend>,
    ) -> AppResult<Self> {
        let settings = Arc::new(settings);

        let calibration = Calibration::load_or_default(&settings.calibration.path)?;
        if calibration.is_calibrated() {
            tracing::info!(path = %settings.calibration.path.display(), "Loaded calibration");
        } else {
            tracing::warn!("No calibration stored, marker locations unavailable until calibrated");
        }
        let store = CalibrationStore::new(calibration);

        let camera = slot.open(&settings.application.name)?;
        camera
            .start()
            .await
            .map_err(|e| CameraError::Driver(format!("{e:#}")))?;

        let cancel = CancellationToken::new();
        let frames = FrameHub::new();
        let mut tasks = Vec::new();
        tasks.push((
            "capture",
            spawn_capture(camera.clone(), frames.clone(), cancel.child_token()),
        ));

        let controller = SessionController::new(
            settings.clone(),
            camera.clone(),
            vision,
            frames.clone(),
            store.clone(),
        );
        let events = controller.subscribe_events();
        let (session, session_task) = controller.spawn();

        let channel = ProtocolChannel::new(settings.protocol.clone());
        channel.add_request_handler(Arc::new(SessionRequestHandler::new(
            session.clone(),
            settings.protocol.max_payload,
        )));

        tasks.push((
            "connection-watcher",
            tokio::spawn(watch_connection(
                channel.connection_events(),
                session.clone(),
                cancel.child_token(),
            )),
        ));

        tracing::info!(name = %settings.application.name, "Tracker started");
        Ok(Self {
            settings,
            session,
            session_task,
            channel,
            store,
            frames,
            events,
            cancel,
            tasks,
            _camera: camera,
        })
    }

    /// Serves the protocol over TCP on `transport.listen`.
    ///
    /// Returns the bound address.
    pub async fn serve_tcp(&mut self) -> AppResult<SocketAddr> {
        let peripheral = TcpPeripheral::bind(
            self.settings.transport.listen,
            self.settings.protocol.max_payload,
        )
        .await?;
        let addr = peripheral.local_addr()?;

        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        self.tasks.push((
            "tcp-peripheral",
            tokio::spawn(peripheral.run(events_tx, self.cancel.child_token())),
        ));
        self.tasks.push((
            "channel-driver",
            tokio::spawn(transport::drive(
                self.channel.clone(),
                events_rx,
                self.cancel.child_token(),
            )),
        ));
        Ok(addr)
    }

    /// Handle to the session actor.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// The packet channel, for attaching other transports.
    pub fn channel(&self) -> &ProtocolChannel {
        &self.channel
    }

    /// Active calibration.
    pub fn calibration_store(&self) -> &Arc<CalibrationStore> {
        &self.store
    }

    /// Captured frames.
    pub fn frames(&self) -> &Arc<FrameHub> {
        &self.frames
    }

    /// Session lifecycle events.
    pub fn events(&mut self) -> &mut broadcast::Receiver<SessionEvent> {
        &mut self.events
    }

    /// Stops the session task, then every background task, and releases the
    /// camera.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down tracker...");
        if let Err(e) = self.session.shutdown().await {
            tracing::warn!("Session already gone: {e}");
        }
        if let Err(e) = self.session_task.await {
            tracing::warn!("Session task failed: {e}");
        }

        self.cancel.cancel();
        self.channel.unsubscribe();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(task = name, "Task failed during shutdown: {e}");
            }
        }
        tracing::info!("Tracker shutdown complete");
    }
}

/// Stops the session task whenever the peer goes away, including when a new
/// peer replaces it straight away.
async fn watch_connection(
    mut events: broadcast::Receiver<ConnectionEvent>,
    session: SessionHandle,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Connected) => {
                tracing::info!("Peer subscribed");
                continue;
            }
            Ok(ConnectionEvent::Disconnected) => {
                tracing::info!("Peer disconnected, stopping session task");
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Missed connection events, stopping session task");
            }
            Err(RecvError::Closed) => break,
        }

        if let Err(e) = session.stop_current().await {
            tracing::warn!("Failed to stop session task: {e}");
            break;
        }
    }
}
