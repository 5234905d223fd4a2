//! Packet RPC channel.
//!
//! Multiplexes requests and responses over a transport that only offers
//! "peer wrote bytes" and "notify the subscribed peer".
//!
//! ## Inbound
//!
//! [`ProtocolChannel::handle_inbound`] decodes one transport write:
//! - **Request**: handlers run in registration order; the first `Some`
//!   response is queued back with the same correlation id. Unanswered
//!   requests are dropped.
//! - **Response**: handed to the waiter registered under its correlation id.
//!   Unknown ids are logged and dropped.
//!
//! Undecodable writes are logged and dropped.
//!
//! ## Outbound
//!
//! Packets go into an unbounded queue. A single delivery task drains it while
//! a peer is subscribed; on unsubscribe the task stops and the queue is
//! replaced, so undelivered packets are lost. Each packet is one transport
//! write and must fit in `max_payload` bytes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message as _;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::messages::{packet, request, Packet, Request, Response};
use crate::error::ProtocolError;
use crate::transport::NotifySink;

/// Channel limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest encoded packet the transport accepts in one write.
    pub max_payload: usize,
    /// How long [`ProtocolChannel::request`] waits for a response.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload: 512,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection events buffered per listener before it starts lagging.
const CONNECTION_EVENT_CAPACITY: usize = 16;

/// Peer subscription changes, one per transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A peer subscribed to notifications.
    Connected,
    /// The subscribed peer went away.
    Disconnected,
}

/// Answers inbound requests.
///
/// Return `None` to let the next handler try.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produces a response, or `None` if this handler does not serve `request`.
    async fn handle(&self, request: &Request) -> Option<Response>;
}

/// Answers `Hello` with `Ack`.
pub struct HelloHandler;

#[async_trait]
impl RequestHandler for HelloHandler {
    async fn handle(&self, request: &Request) -> Option<Response> {
        match request.message {
            Some(request::Message::Hello(_)) => Some(Response::ack()),
            _ => None,
        }
    }
}

struct Delivery {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Outbound {
    tx: mpsc::UnboundedSender<Packet>,
    rx: Option<mpsc::UnboundedReceiver<Packet>>,
    delivery: Option<Delivery>,
}

impl Outbound {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            delivery: None,
        }
    }
}

struct Inner {
    config: ProtocolConfig,
    handlers: Mutex<Vec<Arc<dyn RequestHandler>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    outbound: Mutex<Outbound>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Bidirectional packet RPC over a notify/write transport.
///
/// Cheap to clone; clones share one channel.
#[derive(Clone)]
pub struct ProtocolChannel {
    inner: Arc<Inner>,
}

impl ProtocolChannel {
    /// Channel with the built-in `Hello` handler registered.
    pub fn new(config: ProtocolConfig) -> Self {
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        let channel = Self {
            inner: Arc::new(Inner {
                config,
                handlers: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(Outbound::new()),
                connected,
                events,
            }),
        };
        channel.add_request_handler(Arc::new(HelloHandler));
        channel
    }

    /// Appends a handler after every handler already registered.
    pub fn add_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.inner.handlers.lock().push(handler);
    }

    /// Starts delivering queued packets to `sink`.
    ///
    /// A previous subscription is torn down first, discarding its queue.
    pub fn subscribe(&self, sink: Arc<dyn NotifySink>) {
        if self.is_connected() {
            self.unsubscribe();
        }

        let mut outbound = self.inner.outbound.lock();
        let Some(rx) = outbound.rx.take() else {
            return;
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(deliver(
            rx,
            sink,
            self.inner.config.max_payload,
            cancel.clone(),
        ));
        outbound.delivery = Some(Delivery { cancel, task });
        drop(outbound);

        tracing::info!("Peer subscribed");
        self.inner.connected.send_replace(true);
        let _ = self.inner.events.send(ConnectionEvent::Connected);
    }

    /// Stops delivery and replaces the outbound queue with an empty one.
    pub fn unsubscribe(&self) {
        let delivery = {
            let mut outbound = self.inner.outbound.lock();
            std::mem::replace(&mut *outbound, Outbound::new()).delivery
        };
        let Some(delivery) = delivery else {
            return;
        };
        delivery.cancel.cancel();
        delivery.task.abort();

        tracing::info!("Peer unsubscribed");
        self.inner.connected.send_replace(false);
        let _ = self.inner.events.send(ConnectionEvent::Disconnected);
    }

    /// True while a peer is subscribed.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Watch handle holding the current subscription state.
    ///
    /// Only the latest value is kept; use [`ProtocolChannel::connection_events`]
    /// to observe every disconnect.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Every subscribe and unsubscribe from now on, in order.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Queues a packet for delivery.
    pub fn send_packet(&self, packet: Packet) {
        if self.inner.outbound.lock().tx.send(packet).is_err() {
            tracing::warn!("Outbound queue closed, packet dropped");
        }
    }

    /// Sends `request` and waits for its response, up to the configured
    /// request timeout.
    pub async fn request(&self, request: Request) -> Result<Response, ProtocolError> {
        self.request_with_timeout(request, self.inner.config.request_timeout)
            .await
    }

    /// Sends `request` and waits at most `timeout` for its response.
    ///
    /// The pending entry is evicted on timeout or when the future is dropped,
    /// so a late response is treated as unknown.
    pub async fn request_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);
        let _pending = PendingGuard {
            inner: &*self.inner,
            request_id: &request_id,
        };

        tracing::debug!(request_id = %request_id, kind = request.kind(), "Sending request");
        self.send_packet(Packet::request(request_id.clone(), request));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProtocolError::ChannelClosed(request_id.clone())),
            Err(_) => {
                tracing::warn!(request_id = %request_id, ?timeout, "Request timed out");
                Err(ProtocolError::DeadlineExceeded {
                    request_id: request_id.clone(),
                    timeout,
                })
            }
        }
    }

    /// Decodes and dispatches one inbound transport write.
    pub async fn handle_inbound(&self, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                let err = ProtocolError::from(e);
                tracing::warn!(len = data.len(), "Dropping undecodable packet: {err}");
                return;
            }
        };

        match packet.message {
            Some(packet::Message::Request(request)) => {
                self.dispatch_request(packet.request_id, request).await;
            }
            Some(packet::Message::Response(response)) => {
                self.complete_request(&packet.request_id, response);
            }
            None => {
                let err = ProtocolError::EmptyPacket(packet.request_id);
                tracing::warn!("{err}");
            }
        }
    }

    async fn dispatch_request(&self, request_id: String, request: Request) {
        tracing::debug!(request_id = %request_id, kind = request.kind(), "Received request");

        let handlers: Vec<Arc<dyn RequestHandler>> = self.inner.handlers.lock().clone();
        for handler in handlers {
            if let Some(response) = handler.handle(&request).await {
                self.send_packet(Packet::response(request_id, response));
                return;
            }
        }
        tracing::debug!(request_id = %request_id, kind = request.kind(), "No handler for request");
    }

    fn complete_request(&self, request_id: &str, response: Response) {
        let waiter = self.inner.pending.lock().remove(request_id);
        match waiter {
            Some(tx) => {
                if tx.send(response).is_err() {
                    tracing::debug!(request_id, "Requester gave up before the response");
                }
            }
            None => tracing::warn!(request_id, "No pending request for response"),
        }
    }
}

/// Evicts a pending entry when its requester stops waiting, whether it got
/// a response, timed out or was dropped mid-flight.
struct PendingGuard<'a> {
    inner: &'a Inner,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(self.request_id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(delivery) = self.outbound.get_mut().delivery.take() {
            delivery.cancel.cancel();
            delivery.task.abort();
        }
    }
}

async fn deliver(
    mut rx: mpsc::UnboundedReceiver<Packet>,
    sink: Arc<dyn NotifySink>,
    max_payload: usize,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let size = packet.encoded_len();
        if size > max_payload {
            let err = ProtocolError::PayloadTooLarge {
                size,
                max: max_payload,
            };
            tracing::error!(request_id = %packet.request_id, "Dropping packet: {err}");
            continue;
        }

        let payload = Bytes::from(packet.encode_to_vec());
        if let Err(e) = sink.notify(payload).await {
            tracing::warn!(request_id = %packet.request_id, "Notify failed: {e:#}");
        }
    }
    tracing::debug!("Outbound delivery stopped");
}
