//! Core library for the table tracker.
//!
//! The device watches a table through a single camera, tracks retro-reflective
//! markers on it and reports their table positions to a controlling peer over
//! a small packet protocol. This library holds the control plane: the session
//! state machine, the protocol channel, marker tracking, exposure control and
//! pose calibration. The binary in `main.rs` wires it to the simulated camera
//! and a TCP transport.

pub mod app;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod error;
pub mod exposure;
pub mod frames;
pub mod geometry;
pub mod hardware;
pub mod messages;
pub mod protocol;
pub mod session;
pub mod tracker;
pub mod transport;
