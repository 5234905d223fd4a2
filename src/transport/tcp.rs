//! TCP peripheral.
//!
//! Stands in for the wireless peripheral on hosts without one. Exactly one
//! peer is served at a time: a connection is a subscription, each
//! length-delimited frame the peer sends is one inbound write, and each
//! outbound packet is written back as one frame. Further connections wait in
//! the accept backlog until the current peer leaves.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::{NotifySink, TransportEvent};

type FrameWriter = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;

struct TcpNotifySink {
    peer: SocketAddr,
    writer: Mutex<FrameWriter>,
}

#[async_trait]
impl NotifySink for TcpNotifySink {
    async fn notify(&self, payload: Bytes) -> Result<()> {
        self.writer.lock().await.send(payload).await?;
        tracing::trace!(peer = %self.peer, "Notified peer");
        Ok(())
    }
}

/// Listening TCP peripheral.
pub struct TcpPeripheral {
    listener: TcpListener,
    max_frame_length: usize,
}

impl TcpPeripheral {
    /// Binds the listening socket.
    pub async fn bind(addr: SocketAddr, max_frame_length: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "TCP peripheral listening");
        Ok(Self {
            listener,
            max_frame_length,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves peers until `cancel` fires or the event receiver is dropped.
    pub async fn run(self, events: mpsc::Sender<TransportEvent>, cancel: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        continue;
                    }
                },
            };

            tracing::info!(peer = %peer, "Peer connected");
            if !self.serve(stream, peer, &events, &cancel).await {
                break;
            }
            tracing::info!(peer = %peer, "Peer disconnected");
        }
        tracing::debug!("TCP peripheral stopped");
    }

    /// Returns false once the event receiver is gone.
    async fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        events: &mpsc::Sender<TransportEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_length)
            .new_codec();
        let (writer, mut reader) = Framed::new(stream, codec).split();
        let sink = Arc::new(TcpNotifySink {
            peer,
            writer: Mutex::new(writer),
        });

        if events.send(TransportEvent::Subscribed(sink)).await.is_err() {
            return false;
        }

        let mut open = true;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(bytes)) => {
                    if events.send(TransportEvent::Write(bytes.freeze())).await.is_err() {
                        open = false;
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(peer = %peer, "Read failed: {e}");
                    break;
                }
                None => break,
            }
        }

        open && events.send(TransportEvent::Unsubscribed).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::packet;
    use crate::protocol::{Packet, ProtocolChannel, ProtocolConfig, Request, Response};
    use prost::Message;
    use std::time::Duration;

    async fn connect(addr: SocketAddr) -> Framed<TcpStream, LengthDelimitedCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        Framed::new(stream, LengthDelimitedCodec::new())
    }

    #[tokio::test]
    async fn test_connection_lifecycle_events() {
        let peripheral = TcpPeripheral::bind("127.0.0.1:0".parse().unwrap(), 512)
            .await
            .unwrap();
        let addr = peripheral.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(peripheral.run(events_tx, cancel.clone()));

        let mut client = connect(addr).await;
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Subscribed(_)));

        client.send(Bytes::from_static(b"hi")).await.unwrap();
        match events_rx.recv().await.unwrap() {
            TransportEvent::Write(bytes) => assert_eq!(&bytes[..], b"hi"),
            other => panic!("unexpected event: {other:?}"),
        }

        drop(client);
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Unsubscribed));

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_round_trip_over_socket() {
        let peripheral = TcpPeripheral::bind("127.0.0.1:0".parse().unwrap(), 512)
            .await
            .unwrap();
        let addr = peripheral.local_addr().unwrap();
        let channel = ProtocolChannel::new(ProtocolConfig::default());
        let (events_tx, events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(peripheral.run(events_tx, cancel.clone()));
        tokio::spawn(super::super::drive(channel, events_rx, cancel.clone()));

        let mut client = connect(addr).await;
        let hello = Packet::request("hello-1", Request::hello()).encode_to_vec();
        client.send(Bytes::from(hello)).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let packet = Packet::decode(reply.freeze()).unwrap();
        assert_eq!(packet.request_id, "hello-1");
        assert_eq!(packet.message, Some(packet::Message::Response(Response::ack())));

        cancel.cancel();
    }
}
