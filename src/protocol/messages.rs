//! Wire messages.
//!
//! Hand-written `prost` derives for the packet catalog, so no protobuf build
//! step is needed. Field tags are part of the wire contract with the peer.

use std::collections::HashMap;

/// Envelope for every transport write.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    /// Correlation id. Empty when the packet is not correlated.
    #[prost(string, tag = "1")]
    pub request_id: String,
    /// Request or response body.
    #[prost(oneof = "packet::Message", tags = "2, 3")]
    pub message: Option<packet::Message>,
}

/// Nested types for [`Packet`].
pub mod packet {
    /// Packet body.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        /// A request to be answered by a handler.
        #[prost(message, tag = "2")]
        Request(super::Request),
        /// A response to an earlier request.
        #[prost(message, tag = "3")]
        Response(super::Response),
    }
}

impl Packet {
    /// Request packet with correlation id `request_id`.
    pub fn request(request_id: impl Into<String>, request: Request) -> Self {
        Self {
            request_id: request_id.into(),
            message: Some(packet::Message::Request(request)),
        }
    }

    /// Response packet answering `request_id`.
    pub fn response(request_id: impl Into<String>, response: Response) -> Self {
        Self {
            request_id: request_id.into(),
            message: Some(packet::Message::Response(response)),
        }
    }
}

/// 2D vector in table or pixel units.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Vector2D {
    /// Horizontal component.
    #[prost(double, tag = "1")]
    pub x: f64,
    /// Vertical component.
    #[prost(double, tag = "2")]
    pub y: f64,
}

impl Vector2D {
    /// Creates a vector.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Greeting; answered with [`AckResponse`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloRequest {}

/// Asks for device identity and session state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerGetStatusRequest {}

/// Stops calibration or tracking.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerSetIdleRequest {}

/// Starts a calibration run against the given table corners.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerStartCalibrationRequest {
    /// Real-world corners in fiducial order (ids 1..=4).
    #[prost(message, repeated, tag = "1")]
    pub corners: Vec<Vector2D>,
}

/// Asks for the observed calibration corners.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerGetCalibrationRequest {}

/// Starts marker tracking.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerStartTrackingRequest {}

/// Asks for current marker table positions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerGetMarkerLocationRequest {}

/// A request body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    /// Request kind.
    #[prost(oneof = "request::Message", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub message: Option<request::Message>,
}

/// Nested types for [`Request`].
pub mod request {
    /// Request kinds.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        /// Hello.
        #[prost(message, tag = "1")]
        Hello(super::HelloRequest),
        /// GetStatus.
        #[prost(message, tag = "2")]
        TrackerGetStatus(super::TrackerGetStatusRequest),
        /// SetIdle.
        #[prost(message, tag = "3")]
        TrackerSetIdle(super::TrackerSetIdleRequest),
        /// StartCalibration.
        #[prost(message, tag = "4")]
        TrackerStartCalibration(super::TrackerStartCalibrationRequest),
        /// GetCalibration.
        #[prost(message, tag = "5")]
        TrackerGetCalibration(super::TrackerGetCalibrationRequest),
        /// StartTracking.
        #[prost(message, tag = "6")]
        TrackerStartTracking(super::TrackerStartTrackingRequest),
        /// GetMarkerLocation.
        #[prost(message, tag = "7")]
        TrackerGetMarkerLocation(super::TrackerGetMarkerLocationRequest),
    }
}

impl From<request::Message> for Request {
    fn from(message: request::Message) -> Self {
        Self {
            message: Some(message),
        }
    }
}

impl Request {
    /// `Hello`.
    pub fn hello() -> Self {
        request::Message::Hello(HelloRequest {}).into()
    }

    /// `GetStatus`.
    pub fn get_status() -> Self {
        request::Message::TrackerGetStatus(TrackerGetStatusRequest {}).into()
    }

    /// `SetIdle`.
    pub fn set_idle() -> Self {
        request::Message::TrackerSetIdle(TrackerSetIdleRequest {}).into()
    }

    /// `StartCalibration` with real-world `corners`.
    pub fn start_calibration(corners: Vec<Vector2D>) -> Self {
        request::Message::TrackerStartCalibration(TrackerStartCalibrationRequest { corners }).into()
    }

    /// `GetCalibration`.
    pub fn get_calibration() -> Self {
        request::Message::TrackerGetCalibration(TrackerGetCalibrationRequest {}).into()
    }

    /// `StartTracking`.
    pub fn start_tracking() -> Self {
        request::Message::TrackerStartTracking(TrackerStartTrackingRequest {}).into()
    }

    /// `GetMarkerLocation`.
    pub fn get_marker_location() -> Self {
        request::Message::TrackerGetMarkerLocation(TrackerGetMarkerLocationRequest {}).into()
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match &self.message {
            Some(request::Message::Hello(_)) => "Hello",
            Some(request::Message::TrackerGetStatus(_)) => "GetStatus",
            Some(request::Message::TrackerSetIdle(_)) => "SetIdle",
            Some(request::Message::TrackerStartCalibration(_)) => "StartCalibration",
            Some(request::Message::TrackerGetCalibration(_)) => "GetCalibration",
            Some(request::Message::TrackerStartTracking(_)) => "StartTracking",
            Some(request::Message::TrackerGetMarkerLocation(_)) => "GetMarkerLocation",
            None => "Unknown",
        }
    }
}

/// Session state reported by `GetStatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TrackerState {
    /// No background task.
    Idle = 0,
    /// Calibration task running.
    Calibrating = 1,
    /// Tracking task running.
    Tracking = 2,
}

/// Generic acknowledgement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AckResponse {}

/// Device identity and session state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerGetStatusResponse {
    /// Device identifier.
    #[prost(string, tag = "1")]
    pub uuid: String,
    /// Firmware version.
    #[prost(string, tag = "2")]
    pub version: String,
    /// Current session state.
    #[prost(enumeration = "TrackerState", tag = "3")]
    pub state: i32,
}

/// Observed calibration corners.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerGetCalibrationResponse {
    /// Corner fiducial ids seen.
    #[prost(int32, repeated, tag = "1")]
    pub found_corners: Vec<i32>,
    /// Corner pixel positions, in id order.
    #[prost(message, repeated, tag = "2")]
    pub corner_locations: Vec<Vector2D>,
}

/// Marker positions on the table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackerGetMarkerLocationResponse {
    /// Marker id to normalized table position.
    #[prost(map = "int32, message", tag = "1")]
    pub marker_locations: HashMap<i32, Vector2D>,
}

/// A response body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// Response kind.
    #[prost(oneof = "response::Message", tags = "1, 2, 3, 4")]
    pub message: Option<response::Message>,
}

/// Nested types for [`Response`].
pub mod response {
    /// Response kinds.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        /// Ack.
        #[prost(message, tag = "1")]
        Ack(super::AckResponse),
        /// GetStatus result.
        #[prost(message, tag = "2")]
        TrackerGetStatus(super::TrackerGetStatusResponse),
        /// GetCalibration result.
        #[prost(message, tag = "3")]
        TrackerGetCalibration(super::TrackerGetCalibrationResponse),
        /// GetMarkerLocation result.
        #[prost(message, tag = "4")]
        TrackerGetMarkerLocation(super::TrackerGetMarkerLocationResponse),
    }
}

impl From<response::Message> for Response {
    fn from(message: response::Message) -> Self {
        Self {
            message: Some(message),
        }
    }
}

impl Response {
    /// `Ack`.
    pub fn ack() -> Self {
        response::Message::Ack(AckResponse {}).into()
    }

    /// True for an `Ack`.
    pub fn is_ack(&self) -> bool {
        matches!(self.message, Some(response::Message::Ack(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_marker_locations_survive_encoding() {
        let mut locations = HashMap::new();
        locations.insert(3, Vector2D::new(0.25, 0.75));
        let packet = Packet::response(
            "req-1",
            response::Message::TrackerGetMarkerLocation(TrackerGetMarkerLocationResponse {
                marker_locations: locations,
            })
            .into(),
        );

        let decoded = Packet::decode(packet.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_empty_request_id_is_default() {
        let packet = Packet::request("", Request::hello());
        let decoded = Packet::decode(packet.encode_to_vec().as_slice()).unwrap();
        assert!(decoded.request_id.is_empty());
        assert_eq!(decoded.message, Some(packet::Message::Request(Request::hello())));
    }

    #[test]
    fn test_status_state_enumeration() {
        let status = TrackerGetStatusResponse {
            uuid: "dev".into(),
            version: "0.1.0".into(),
            state: TrackerState::Tracking as i32,
        };
        assert_eq!(status.state(), TrackerState::Tracking);
        assert_eq!(Request::start_tracking().kind(), "StartTracking");
    }
}
