//! Testing utilities and mock implementations
//!
//! Mocks for driving the scheduler without an MQTT broker or a filesystem.

pub mod mocks;

pub use mocks::*;
