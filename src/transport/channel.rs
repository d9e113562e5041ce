//! In-process worker link
//!
//! Each attached worker gets a bounded mpsc receiver of coordinator messages.
//! Workers reply by sending [`InboundEvent`](super::InboundEvent)s on the
//! scheduler's inbound channel.

use super::{LinkError, WorkerLink};
use crate::protocol::{CoordinatorMessage, TaskAssignment, WorkerId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

const WORKER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
pub struct ChannelWorkerLink {
    senders: RwLock<HashMap<WorkerId, mpsc::Sender<CoordinatorMessage>>>,
}

impl ChannelWorkerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a worker, replacing any previous channel for the same id
    pub fn attach(&self, worker_id: &str) -> mpsc::Receiver<CoordinatorMessage> {
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id.to_string(), tx);
        debug!(worker_id = %worker_id, "Attached in-process worker");
        rx
    }

    pub fn detach(&self, worker_id: &str) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker_id);
    }

    async fn send(&self, worker_id: &str, message: CoordinatorMessage) -> Result<(), LinkError> {
        let sender = self
            .senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .cloned()
            .ok_or_else(|| LinkError::NotConnected(worker_id.to_string()))?;

        sender
            .send(message)
            .await
            .map_err(|_| LinkError::SendFailed {
                worker_id: worker_id.to_string(),
                message: "worker channel closed".to_string(),
            })
    }
}

#[async_trait]
impl WorkerLink for ChannelWorkerLink {
    async fn send_assignment(
        &self,
        worker_id: &str,
        assignment: &TaskAssignment,
    ) -> Result<(), LinkError> {
        self.send(
            worker_id,
            CoordinatorMessage::TaskAssignment(assignment.clone()),
        )
        .await
    }

    async fn send_cancel(
        &self,
        worker_id: &str,
        task_id: Uuid,
        reason: &str,
    ) -> Result<(), LinkError> {
        self.send(
            worker_id,
            CoordinatorMessage::TaskCancelled {
                task_id,
                reason: reason.to_string(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskRequest;
    use serde_json::json;

    #[tokio::test]
    async fn test_assignment_reaches_attached_worker() {
        let link = ChannelWorkerLink::new();
        let mut rx = link.attach("w1");
        let request = TaskRequest::new("summarize", json!({"text": "hi"}));

        link.send_assignment("w1", &TaskAssignment::from(&request))
            .await
            .unwrap();

        match rx.recv().await {
            Some(CoordinatorMessage::TaskAssignment(assignment)) => {
                assert_eq!(assignment.task_id, request.id)
            }
            other => panic!("Expected assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_worker_is_not_connected() {
        let link = ChannelWorkerLink::new();
        let result = link.send_cancel("ghost", Uuid::new_v4(), "timeout").await;
        assert!(matches!(result, Err(LinkError::NotConnected(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_dropped_receiver_fails_send() {
        let link = ChannelWorkerLink::new();
        drop(link.attach("w1"));

        let result = link.send_cancel("w1", Uuid::new_v4(), "timeout").await;
        assert!(matches!(result, Err(LinkError::SendFailed { .. })));

        link.detach("w1");
        let result = link.send_cancel("w1", Uuid::new_v4(), "timeout").await;
        assert!(matches!(result, Err(LinkError::NotConnected(_))));
    }
}
