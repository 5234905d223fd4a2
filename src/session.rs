//! Session state machine.
//!
//! The [`SessionController`] is an actor: every transition and query arrives
//! as a [`SessionCommand`] on one queue and is handled to completion before
//! the next is read. It owns at most one background task (calibration or
//! tracking). Starting a task always cancels and joins the previous one
//! first, so the two never overlap.
//!
//! ```text
//!             StartCalibration                 StartTracking
//!   Idle ----------------------> Calibrating <---------------> Tracking
//!     ^                               |                           |
//!     +------- StopCurrent -----------+-------- StopCurrent ------+
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use nalgebra::Point2;
use parking_lot::RwLock;
use prost::Message as _;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::calibration::{unit_square, CalibrationSnapshot, CalibrationStore, PoseCalibrator};
use crate::camera::{CameraDriver, CameraLease, Channel, VisionBackend};
use crate::config::Settings;
use crate::error::{AppResult, TrackerError};
use crate::exposure::{ExposureController, ExposureOutcome};
use crate::frames::FrameHub;
use crate::geometry::TablePoint;
use crate::messages::{SessionCommand, SessionEvent, SessionState, SessionStatus, TaskKind};
use crate::protocol::messages::{
    request, response, TrackerGetCalibrationResponse, TrackerGetMarkerLocationResponse,
    TrackerGetStatusResponse,
};
use crate::protocol::{Packet, Request, RequestHandler, Response, TrackerState, Vector2D};
use crate::tracker::{MarkerId, MarkerTracker};

/// Commands queued ahead of the actor before senders wait.
const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Lifecycle events buffered per subscriber.
const EVENT_CAPACITY: usize = 64;

/// Everything a background task needs, cloned into it on spawn.
#[derive(Clone)]
struct TaskContext {
    settings: Arc<Settings>,
    camera: Arc<CameraLease>,
    vision: Arc<dyn VisionBackend>,
    frames: Arc<FrameHub>,
    store: Arc<CalibrationStore>,
    tracker: Arc<RwLock<MarkerTracker>>,
    events: broadcast::Sender<SessionEvent>,
}

impl TaskContext {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn camera(&self) -> &dyn CameraDriver {
        &**self.camera
    }
}

struct ActiveTask {
    kind: TaskKind,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Actor owning the session state and its background task.
pub struct SessionController {
    ctx: TaskContext,
    device_id: String,
    version: String,
    state: SessionState,
    active: Option<ActiveTask>,
}

impl SessionController {
    /// Creates an idle controller.
    ///
    /// `camera` must already be streaming into `frames`.
    pub fn new(
        settings: Arc<Settings>,
        camera: Arc<CameraLease>,
        vision: Arc<dyn VisionBackend>,
        frames: Arc<FrameHub>,
        store: Arc<CalibrationStore>,
    ) -> Self {
        let tracker = MarkerTracker::new(settings.tracking.tracker_params());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let device_id = settings.device.resolved_id();
        let version = settings.device.version.clone();

        Self {
            ctx: TaskContext {
                settings,
                camera,
                vision,
                frames,
                store,
                tracker: Arc::new(RwLock::new(tracker)),
                events,
            },
            device_id,
            version,
            state: SessionState::Idle,
            active: None,
        }
    }

    /// Receiver for lifecycle events published after this call.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Spawns the actor and returns a handle to it.
    pub fn spawn(self) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let join = tokio::spawn(self.run(rx));
        (SessionHandle { tx }, join)
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        tracing::info!(device_id = %self.device_id, "SessionController started");

        while let Some(command) = command_rx.recv().await {
            match command {
                SessionCommand::StartCalibration {
                    real_corners,
                    response,
                } => {
                    self.start_calibration(real_corners).await;
                    let _ = response.send(());
                }

                SessionCommand::StartTracking { response } => {
                    self.start_tracking().await;
                    let _ = response.send(());
                }

                SessionCommand::StopCurrent { response } => {
                    self.stop_current().await;
                    let _ = response.send(());
                }

                SessionCommand::GetStatus { response } => {
                    let _ = response.send(self.status());
                }

                SessionCommand::GetCalibration { response } => {
                    let _ = response.send(self.ctx.store.snapshot());
                }

                SessionCommand::GetMarkerLocations { response } => {
                    let _ = response.send(self.marker_locations());
                }

                SessionCommand::Shutdown { response } => {
                    tracing::info!("Shutdown command received");
                    self.stop_current().await;
                    let _ = response.send(());
                    break;
                }
            }
        }

        // Every handle dropped without a Shutdown.
        self.stop_current().await;
        tracing::info!("SessionController shutting down");
    }

    async fn start_calibration(&mut self, real_corners: [Point2<f64>; 4]) {
        if self.state == SessionState::Calibrating {
            tracing::debug!("Already calibrating");
            return;
        }
        self.stop_active().await;

        let ctx = self.ctx.clone();
        self.spawn_task(TaskKind::Calibration, move |cancel| {
            calibration_task(ctx, real_corners, cancel)
        });
        self.set_state(SessionState::Calibrating);
    }

    async fn start_tracking(&mut self) {
        if self.state == SessionState::Tracking {
            tracing::debug!("Already tracking");
            return;
        }
        self.stop_active().await;

        let ctx = self.ctx.clone();
        self.spawn_task(TaskKind::Tracking, move |cancel| tracking_task(ctx, cancel));
        self.set_state(SessionState::Tracking);
    }

    async fn stop_current(&mut self) {
        self.stop_active().await;
        self.set_state(SessionState::Idle);
    }

    fn spawn_task<F, Fut>(&mut self, kind: TaskKind, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(body(cancel.clone()));
        tracing::info!(task = ?kind, "Session task spawned");
        self.active = Some(ActiveTask { kind, cancel, join });
    }

    /// Cancels the active task and waits for it to exit.
    async fn stop_active(&mut self) {
        let Some(task) = self.active.take() else {
            return;
        };
        task.cancel.cancel();
        match task.join.await {
            Ok(()) => tracing::info!(task = ?task.kind, "Session task stopped"),
            Err(e) => tracing::warn!(task = ?task.kind, "Session task failed: {e}"),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::info!(from = ?self.state, to = ?state, "Session state changed");
            self.state = state;
            self.ctx.emit(SessionEvent::StateChanged(state));
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            device_id: self.device_id.clone(),
            version: self.version.clone(),
            state: self.state,
        }
    }

    /// Table positions of markers tracked for at least `min_marker_age`
    /// that fall on the table. Empty until a calibration exists.
    fn marker_locations(&self) -> BTreeMap<MarkerId, TablePoint> {
        let calibration = self.ctx.store.active();
        if !calibration.is_calibrated() {
            tracing::debug!("No calibration, reporting no markers");
            return BTreeMap::new();
        }

        let min_age = self.ctx.settings.tracking.min_marker_age;
        let tracker = self.ctx.tracker.read();
        let locations = tracker
            .markers()
            .markers()
            .filter(|marker| marker.age() >= min_age)
            .map(|marker| (marker.id, calibration.pixel_to_table(marker.position)))
            .filter(|(_, point)| point.is_on_table())
            .collect();
        locations
    }
}

async fn calibration_task(ctx: TaskContext, real_corners: [Point2<f64>; 4], cancel: CancellationToken) {
    ctx.emit(SessionEvent::TaskStarted(TaskKind::Calibration));

    let calibrator = PoseCalibrator::new(
        ctx.settings.calibration.clone(),
        ctx.vision.clone(),
        ctx.frames.clone(),
        ctx.store.clone(),
    );
    match calibrator.run(ctx.camera(), real_corners, &cancel).await {
        Ok(calibration) => {
            let path = &ctx.settings.calibration.path;
            if let Err(e) = calibration.save(path) {
                tracing::warn!(path = %path.display(), "Failed to persist calibration: {e}");
            }
            ctx.store.replace(calibration);
        }
        Err(e) => tracing::warn!("Calibration failed: {e}"),
    }

    ctx.emit(SessionEvent::TaskStopped(TaskKind::Calibration));
}

async fn tracking_task(ctx: TaskContext, cancel: CancellationToken) {
    ctx.emit(SessionEvent::TaskStarted(TaskKind::Tracking));

    let tracking = &ctx.settings.tracking;
    let mut frames = ctx.frames.subscribe(tracking.frame_queue);
    ctx.tracker.write().clear();

    if tracking.auto_exposure {
        tune_exposure(&ctx, &cancel).await;
    } else if let Err(e) = ctx.camera().set_exposure(tracking.exposure_us).await {
        tracing::warn!("Failed to set tracking exposure: {e:#}");
    }

    let threshold = ctx.settings.exposure.threshold;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };

        let blobs = match ctx.vision.find_blobs(&frame, Channel::Red, threshold) {
            Ok(blobs) => blobs,
            Err(e) => {
                tracing::warn!(sequence = frame.sequence, "Blob extraction failed: {e:#}");
                continue;
            }
        };

        let summary = ctx.tracker.write().update(&blobs, frame.captured_at);
        tracing::trace!(sequence = frame.sequence, ?summary, "Tracker updated");
    }

    if frames.dropped() > 0 {
        tracing::debug!(dropped = frames.dropped(), "Tracking skipped frames");
    }
    drop(frames);
    ctx.emit(SessionEvent::TaskStopped(TaskKind::Tracking));
}

/// Runs the exposure loop under the configured deadline, falling back to the
/// fixed tracking exposure if it does not converge.
async fn tune_exposure(ctx: &TaskContext, cancel: &CancellationToken) {
    let settings = &ctx.settings;
    let (width, height) = ctx.camera().resolution();
    let controller = ExposureController::new(
        settings.exposure.clone(),
        settings.exposure.target_for(width, height),
    );

    let deadline = settings.tracking.auto_exposure_deadline;
    let run = controller.run(ctx.camera(), ctx.vision.as_ref(), &ctx.frames, cancel);
    match tokio::time::timeout(deadline, run).await {
        Ok(ExposureOutcome::Converged(us)) => {
            tracing::info!(exposure_us = us, "Tracking exposure tuned");
            return;
        }
        Ok(ExposureOutcome::Cancelled) => {
            if cancel.is_cancelled() {
                return;
            }
        }
        Err(_) => tracing::warn!(?deadline, "Exposure did not converge in time"),
    }

    let fallback = settings.tracking.exposure_us;
    if let Err(e) = ctx.camera().set_exposure(fallback).await {
        tracing::warn!("Failed to set fallback exposure: {e:#}");
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable sender side of the session actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn call<T>(&self, (command, rx): (SessionCommand, oneshot::Receiver<T>)) -> AppResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| TrackerError::SessionClosed)?;
        rx.await.map_err(|_| TrackerError::SessionClosed)
    }

    /// Starts calibrating; returns once the task is running.
    pub async fn start_calibration(&self, real_corners: [Point2<f64>; 4]) -> AppResult<()> {
        self.call(SessionCommand::start_calibration(real_corners)).await
    }

    /// Starts tracking; returns once the task is running.
    pub async fn start_tracking(&self) -> AppResult<()> {
        self.call(SessionCommand::start_tracking()).await
    }

    /// Stops the active task and goes idle; returns once it has exited.
    pub async fn stop_current(&self) -> AppResult<()> {
        self.call(SessionCommand::stop_current()).await
    }

    /// Device identity and state.
    pub async fn status(&self) -> AppResult<SessionStatus> {
        self.call(SessionCommand::get_status()).await
    }

    /// Observed calibration corners.
    pub async fn calibration(&self) -> AppResult<CalibrationSnapshot> {
        self.call(SessionCommand::get_calibration()).await
    }

    /// Settled marker positions on the table.
    pub async fn marker_locations(&self) -> AppResult<BTreeMap<MarkerId, TablePoint>> {
        self.call(SessionCommand::get_marker_locations()).await
    }

    /// Stops the active task and ends the actor.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.call(SessionCommand::shutdown()).await
    }
}

// ============================================================================
// Protocol binding
// ============================================================================

impl From<SessionState> for TrackerState {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Idle => TrackerState::Idle,
            SessionState::Calibrating => TrackerState::Calibrating,
            SessionState::Tracking => TrackerState::Tracking,
        }
    }
}

/// Correlation id used to size replies; peers use UUID strings.
const REPLY_SIZING_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Serves the tracker requests from the session.
pub struct SessionRequestHandler {
    session: SessionHandle,
    max_payload: usize,
}

impl SessionRequestHandler {
    /// Handler forwarding to `session`. Replies are kept within
    /// `max_payload` encoded bytes.
    pub fn new(session: SessionHandle, max_payload: usize) -> Self {
        Self {
            session,
            max_payload,
        }
    }

    async fn dispatch(&self, message: &request::Message) -> AppResult<Option<Response>> {
        let response = match message {
            request::Message::Hello(_) => return Ok(None),

            request::Message::TrackerGetStatus(_) => {
                let status = self.session.status().await?;
                let mut reply = TrackerGetStatusResponse {
                    uuid: status.device_id,
                    version: status.version,
                    ..Default::default()
                };
                reply.set_state(status.state.into());
                response::Message::TrackerGetStatus(reply).into()
            }

            request::Message::TrackerSetIdle(_) => {
                self.session.stop_current().await?;
                Response::ack()
            }

            request::Message::TrackerStartCalibration(req) => {
                let real_corners = real_corners(&req.corners);
                self.session.start_calibration(real_corners).await?;
                Response::ack()
            }

            request::Message::TrackerGetCalibration(_) => {
                let snapshot = self.session.calibration().await?;
                response::Message::TrackerGetCalibration(TrackerGetCalibrationResponse {
                    found_corners: snapshot.found_corners,
                    corner_locations: snapshot
                        .corner_locations
                        .iter()
                        .map(|p| Vector2D::new(p.x, p.y))
                        .collect(),
                })
                .into()
            }

            request::Message::TrackerStartTracking(_) => {
                self.session.start_tracking().await?;
                Response::ack()
            }

            request::Message::TrackerGetMarkerLocation(_) => {
                let locations = self.session.marker_locations().await?;
                marker_location_reply(locations, self.max_payload)
            }
        };
        Ok(Some(response))
    }
}

#[async_trait]
impl RequestHandler for SessionRequestHandler {
    async fn handle(&self, request: &Request) -> Option<Response> {
        let message = request.message.as_ref()?;
        match self.dispatch(message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(request = request.kind(), "Session request failed: {e}");
                None
            }
        }
    }
}

/// Builds the marker location reply, lowest identifiers first, dropping the
/// markers that would push the packet past `max_payload`.
fn marker_location_reply(locations: BTreeMap<MarkerId, TablePoint>, max_payload: usize) -> Response {
    let total = locations.len();
    let mut reply = TrackerGetMarkerLocationResponse::default();
    for (id, point) in locations {
        let key = i32::from(id);
        reply
            .marker_locations
            .insert(key, Vector2D::new(point.x, point.y));
        if reply_len(&reply) > max_payload {
            reply.marker_locations.remove(&key);
            tracing::warn!(
                sent = reply.marker_locations.len(),
                total,
                max_payload,
                "Marker locations truncated to fit the payload limit"
            );
            break;
        }
    }
    response::Message::TrackerGetMarkerLocation(reply).into()
}

fn reply_len(reply: &TrackerGetMarkerLocationResponse) -> usize {
    let response: Response = response::Message::TrackerGetMarkerLocation(reply.clone()).into();
    Packet::response(REPLY_SIZING_ID, response).encoded_len()
}

/// Requested real-world corners, or the unit square if the request does not
/// carry exactly four.
fn real_corners(corners: &[Vector2D]) -> [Point2<f64>; 4] {
    match corners {
        [a, b, c, d] => [a, b, c, d].map(|v| Point2::new(v.x, v.y)),
        [] => unit_square(),
        other => {
            tracing::warn!(count = other.len(), "Expected four calibration corners, using unit square");
            unit_square()
        }
    }
}
