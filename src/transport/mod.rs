//! Transport layer for worker communication
//!
//! The scheduler talks to workers through the [`WorkerLink`] trait and
//! receives everything workers say as [`InboundEvent`]s on a single mpsc
//! channel. Two implementations are provided: an MQTT link for remote workers
//! and an in-process channel link for embedded workers.

use crate::protocol::{TaskAssignment, WorkerId, WorkerMessage};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod channel;
pub mod mqtt;

pub use channel::ChannelWorkerLink;
pub use mqtt::MqttWorkerLink;

/// A message from one worker, tagged with the sender's id
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub worker_id: WorkerId,
    pub message: WorkerMessage,
}

impl InboundEvent {
    pub fn new<S: Into<String>>(worker_id: S, message: WorkerMessage) -> Self {
        Self {
            worker_id: worker_id.into(),
            message,
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Worker '{0}' is not connected")]
    NotConnected(WorkerId),
    #[error("Send to worker '{worker_id}' failed: {message}")]
    SendFailed { worker_id: WorkerId, message: String },
    #[error("MQTT error: {0}")]
    Mqtt(#[from] mqtt::MqttError),
}

/// Outbound half of the duplex channel to each worker
///
/// A send error is treated by the scheduler as the worker being unavailable.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    async fn send_assignment(
        &self,
        worker_id: &str,
        assignment: &TaskAssignment,
    ) -> Result<(), LinkError>;

    async fn send_cancel(&self, worker_id: &str, task_id: Uuid, reason: &str)
        -> Result<(), LinkError>;
}
