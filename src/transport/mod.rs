//! Transport adapters for the packet channel.
//!
//! A transport is anything that can report peer events (subscribe,
//! unsubscribe, inbound write) and push bytes back to the subscribed peer.
//! Adapters translate their native events into [`TransportEvent`]s; [`drive`]
//! applies them to a [`ProtocolChannel`] one at a time, so inbound requests
//! are dispatched strictly in arrival order.

pub mod tcp;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::ProtocolChannel;

/// Outbound half of a transport: one call per packet.
#[async_trait]
pub trait NotifySink: Send + Sync {
    /// Delivers one packet to the subscribed peer.
    async fn notify(&self, payload: Bytes) -> Result<()>;
}

/// Something the peer did.
pub enum TransportEvent {
    /// The peer enabled notifications; packets go to `sink`.
    Subscribed(Arc<dyn NotifySink>),
    /// The peer went away or disabled notifications.
    Unsubscribed,
    /// The peer wrote one packet.
    Write(Bytes),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribed(_) => f.write_str("Subscribed"),
            Self::Unsubscribed => f.write_str("Unsubscribed"),
            Self::Write(bytes) => write!(f, "Write({} bytes)", bytes.len()),
        }
    }
}

/// Applies transport events to `channel` until `events` closes or `cancel`
/// fires.
pub async fn drive(
    channel: ProtocolChannel,
    mut events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        tracing::trace!(?event, "Transport event");

        match event {
            TransportEvent::Subscribed(sink) => channel.subscribe(sink),
            TransportEvent::Unsubscribed => channel.unsubscribe(),
            TransportEvent::Write(bytes) => channel.handle_inbound(&bytes).await,
        }
    }
    channel.unsubscribe();
    tracing::debug!("Transport driver stopped");
}

/// In-process sink that forwards every packet to a channel.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl MemorySink {
    /// Sink plus the receiver that sees its packets.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl NotifySink for MemorySink {
    async fn notify(&self, payload: Bytes) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| anyhow!("memory peer closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Packet, ProtocolConfig, Request, Response};
    use prost::Message;
    use std::time::Duration;

    #[tokio::test]
    async fn test_driver_applies_events_in_order() {
        let channel = ProtocolChannel::new(ProtocolConfig::default());
        let (events_tx, events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(channel.clone(), events_rx, cancel.clone()));

        let (sink, mut rx) = MemorySink::new();
        events_tx.send(TransportEvent::Subscribed(sink)).await.unwrap();
        for id in ["one", "two"] {
            let bytes = Packet::request(id, Request::hello()).encode_to_vec();
            events_tx.send(TransportEvent::Write(bytes.into())).await.unwrap();
        }

        for expected in ["one", "two"] {
            let bytes = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let packet = Packet::decode(bytes).unwrap();
            assert_eq!(packet.request_id, expected);
            assert_eq!(
                packet.message,
                Some(crate::protocol::messages::packet::Message::Response(Response::ack()))
            );
        }

        events_tx.send(TransportEvent::Unsubscribed).await.unwrap();
        cancel.cancel();
        driver.await.unwrap();
        assert!(!channel.is_connected());
    }
}
