//! Task data model and worker wire protocol
//!
//! Message structures exchanged between the coordinator and its workers,
//! plus topic canonicalization and worker id validation.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
