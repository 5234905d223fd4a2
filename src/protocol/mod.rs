//! Packet protocol between the device and its controlling peer.
//!
//! - [`messages`]: the protobuf message catalog.
//! - [`channel`]: request/response multiplexing over a notify/write transport.

pub mod channel;
pub mod messages;

pub use channel::{ConnectionEvent, HelloHandler, ProtocolChannel, ProtocolConfig, RequestHandler};
pub use messages::{Packet, Request, Response, TrackerState, Vector2D};
