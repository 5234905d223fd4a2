//! Hardware implementations behind the [`crate::camera`] capability traits.
//!
//! The device camera and vision stack live outside this crate; the simulator
//! here is what the binary and the tests run against.

pub mod sim;
