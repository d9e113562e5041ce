//! Durability sink for task and learning records
//!
//! The scheduler never waits on persistence. Records are handed to a
//! [`WriteBehind`] queue whose background task forwards them to the configured
//! [`Persistence`] implementation; failures are logged and counted and the
//! coordinator keeps operating from memory.

pub mod jsonl;

pub use jsonl::{Compaction, JsonlPersistence};

use crate::learning::{BucketKey, LearningRecord};
use crate::observability::MetricsCollector;
use crate::protocol::{AttemptRecord, ErrorDetails, TaskRequest, TaskState, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Persistence unavailable: {0}")]
    Unavailable(String),
}

/// Durable view of a task after a state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub request: TaskRequest,
    pub state: TaskState,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Record of a request that has never been attempted
    pub fn pending(request: TaskRequest) -> Self {
        Self {
            task_id: request.id,
            request,
            state: TaskState::Pending,
            retry_count: 0,
            worker_id: None,
            attempts: Vec::new(),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Latest record per task in first-seen order, dropping tasks that reached a terminal state
pub fn latest_unfinished(records: impl IntoIterator<Item = TaskRecord>) -> Vec<TaskRecord> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut latest: HashMap<Uuid, TaskRecord> = HashMap::new();
    for record in records {
        if !latest.contains_key(&record.task_id) {
            order.push(record.task_id);
        }
        latest.insert(record.task_id, record);
    }

    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .filter(|record| !record.state.is_terminal())
        .collect()
}

/// Latest record per learning bucket, sorted by bucket
pub fn latest_learning(records: impl IntoIterator<Item = LearningRecord>) -> Vec<LearningRecord> {
    let mut latest: HashMap<BucketKey, LearningRecord> = HashMap::new();
    for record in records {
        latest.insert(record.key(), record);
    }
    let mut records: Vec<LearningRecord> = latest.into_values().collect();
    records.sort_by_key(|r| r.key());
    records
}

/// Storage collaborator used as a durability sink and startup source
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_task_record(&self, record: &TaskRecord) -> Result<(), PersistenceError>;

    async fn save_learning_record(&self, record: &LearningRecord) -> Result<(), PersistenceError>;

    /// Latest record of every task that has not reached a terminal state
    async fn load_pending_tasks(&self) -> Result<Vec<TaskRecord>, PersistenceError>;

    /// Latest record per learning bucket
    async fn load_learning_records(&self) -> Result<Vec<LearningRecord>, PersistenceError> {
        Ok(Vec::new())
    }
}

enum PersistCommand {
    Task(Box<TaskRecord>),
    Learning(Box<LearningRecord>),
}

/// Non-blocking front for a [`Persistence`] implementation
pub struct WriteBehind {
    tx: mpsc::UnboundedSender<PersistCommand>,
    handle: JoinHandle<()>,
}

impl WriteBehind {
    /// Spawn the background writer. Must be called inside a tokio runtime.
    pub fn spawn(inner: Arc<dyn Persistence>, metrics: Arc<MetricsCollector>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistCommand>();

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let result = match &command {
                    PersistCommand::Task(record) => inner.save_task_record(record).await,
                    PersistCommand::Learning(record) => inner.save_learning_record(record).await,
                };
                if let Err(e) = result {
                    metrics.persistence_failed();
                    warn!(error = %e, "Persistence write failed, continuing from memory");
                }
            }
            debug!("Write-behind queue closed");
        });

        Self { tx, handle }
    }

    pub fn save_task(&self, record: TaskRecord) {
        if self.tx.send(PersistCommand::Task(Box::new(record))).is_err() {
            warn!("Write-behind writer has stopped, task record dropped");
        }
    }

    pub fn save_learning(&self, record: LearningRecord) {
        if self
            .tx
            .send(PersistCommand::Learning(Box::new(record)))
            .is_err()
        {
            warn!("Write-behind writer has stopped, learning record dropped");
        }
    }

    /// Close the queue and wait for queued records to be written
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Write-behind writer task failed");
        }
    }
}
