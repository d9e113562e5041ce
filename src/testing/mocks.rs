//! Mock implementations for testing
//!
//! Test doubles for the worker link and persistence so the scheduler can be
//! driven without a broker or a filesystem.

use crate::learning::LearningRecord;
use crate::persistence::{
    latest_learning, latest_unfinished, Persistence, PersistenceError, TaskRecord,
};
use crate::protocol::{TaskAssignment, TaskRequest, WorkerId};
use crate::transport::{LinkError, WorkerLink};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A cancellation as seen by the mock link
#[derive(Debug, Clone, PartialEq)]
pub struct SentCancel {
    pub worker_id: WorkerId,
    pub task_id: Uuid,
    pub reason: String,
}

/// Records every outbound message; individual workers can be made unreachable
#[derive(Debug, Default)]
pub struct MockWorkerLink {
    assignments: Mutex<Vec<(WorkerId, TaskAssignment)>>,
    cancels: Mutex<Vec<SentCancel>>,
    refused: Mutex<HashSet<WorkerId>>,
    should_fail: AtomicBool,
    stall_cancels: AtomicBool,
}

impl MockWorkerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send fails
    pub fn with_failure() -> Self {
        let link = Self::default();
        link.should_fail.store(true, Ordering::Relaxed);
        link
    }

    /// Cancellations never complete, like a broker that stopped draining
    pub fn stall_cancels(&self) {
        self.stall_cancels.store(true, Ordering::Relaxed);
    }

    /// Sends to `worker_id` fail until [`accept`](Self::accept) is called
    pub async fn refuse(&self, worker_id: &str) {
        self.refused.lock().await.insert(worker_id.to_string());
    }

    pub async fn accept(&self, worker_id: &str) {
        self.refused.lock().await.remove(worker_id);
    }

    pub async fn assignments(&self) -> Vec<(WorkerId, TaskAssignment)> {
        self.assignments.lock().await.clone()
    }

    pub async fn assignments_for(&self, worker_id: &str) -> Vec<TaskAssignment> {
        self.assignments
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == worker_id)
            .map(|(_, assignment)| assignment.clone())
            .collect()
    }

    /// Worker ids in the order assignments were delivered
    pub async fn assignment_order(&self) -> Vec<WorkerId> {
        self.assignments
            .lock()
            .await
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn cancels(&self) -> Vec<SentCancel> {
        self.cancels.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.assignments.lock().await.clear();
        self.cancels.lock().await.clear();
    }

    async fn check_reachable(&self, worker_id: &str) -> Result<(), LinkError> {
        if self.should_fail.load(Ordering::Relaxed) || self.refused.lock().await.contains(worker_id)
        {
            return Err(LinkError::NotConnected(worker_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerLink for MockWorkerLink {
    async fn send_assignment(
        &self,
        worker_id: &str,
        assignment: &TaskAssignment,
    ) -> Result<(), LinkError> {
        self.check_reachable(worker_id).await?;
        self.assignments
            .lock()
            .await
            .push((worker_id.to_string(), assignment.clone()));
        Ok(())
    }

    async fn send_cancel(
        &self,
        worker_id: &str,
        task_id: Uuid,
        reason: &str,
    ) -> Result<(), LinkError> {
        if self.stall_cancels.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        self.check_reachable(worker_id).await?;
        self.cancels.lock().await.push(SentCancel {
            worker_id: worker_id.to_string(),
            task_id,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// In-memory persistence with the same "latest record wins" reads as the JSONL store
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    tasks: Mutex<Vec<TaskRecord>>,
    learning: Mutex<Vec<LearningRecord>>,
    seeded: Vec<TaskRecord>,
    should_fail: bool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails with `Unavailable`
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    /// Never-attempted requests reported as unfinished by `load_pending_tasks`
    pub fn with_pending(requests: Vec<TaskRequest>) -> Self {
        Self::with_records(requests.into_iter().map(TaskRecord::pending).collect())
    }

    /// Records left behind by an earlier run, reported by `load_pending_tasks`
    pub fn with_records(records: Vec<TaskRecord>) -> Self {
        Self {
            seeded: records,
            ..Self::default()
        }
    }

    pub async fn task_records(&self) -> Vec<TaskRecord> {
        self.tasks.lock().await.clone()
    }

    /// Records written for one task, oldest first
    pub async fn records_for(&self, task_id: Uuid) -> Vec<TaskRecord> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    pub async fn learning_records(&self) -> Vec<LearningRecord> {
        self.learning.lock().await.clone()
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.should_fail {
            return Err(PersistenceError::Unavailable(
                "mock persistence failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_task_record(&self, record: &TaskRecord) -> Result<(), PersistenceError> {
        self.check()?;
        self.tasks.lock().await.push(record.clone());
        Ok(())
    }

    async fn save_learning_record(&self, record: &LearningRecord) -> Result<(), PersistenceError> {
        self.check()?;
        self.learning.lock().await.push(record.clone());
        Ok(())
    }

    async fn load_pending_tasks(&self) -> Result<Vec<TaskRecord>, PersistenceError> {
        self.check()?;
        let tasks = self.tasks.lock().await;
        Ok(latest_unfinished(
            self.seeded.iter().chain(tasks.iter()).cloned(),
        ))
    }

    async fn load_learning_records(&self) -> Result<Vec<LearningRecord>, PersistenceError> {
        self.check()?;
        Ok(latest_learning(self.learning.lock().await.iter().cloned()))
    }
}
