//! Task queue and per-task bookkeeping
//!
//! Holds every known task, pending, in flight or recently finished. Terminal
//! tasks stay queryable until the archive exceeds its capacity, then the
//! oldest are evicted.

use crate::persistence::TaskRecord;
use crate::protocol::{
    AttemptOutcome, AttemptRecord, ErrorDetails, ExecutionResult, TaskFailure, TaskRequest,
    TaskState, WorkerId,
};
use crate::routing::RoutingDecision;
use chrono::Utc;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// What a caller waiting on a task eventually receives
pub type TaskOutcome = Result<ExecutionResult, TaskFailure>;

#[derive(Debug)]
pub struct TaskEntry {
    pub request: TaskRequest,
    pub state: TaskState,
    pub retry_count: u32,
    pub max_retries: u32,
    seq: u64,
    pub submitted_at: Instant,
    /// Earliest time a PENDING task may be drained again
    pub not_before: Instant,
    pub deadline: Option<Instant>,
    /// The active routing decision while in flight
    pub decision: Option<RoutingDecision>,
    pub attempts: Vec<AttemptRecord>,
    pub attempt_started: Option<Instant>,
    pub timeout_at: Option<Instant>,
    pub result: Option<ExecutionResult>,
    pub failure: Option<TaskFailure>,
    pub last_error: Option<ErrorDetails>,
    waiters: Vec<oneshot::Sender<TaskOutcome>>,
}

impl TaskEntry {
    fn new(request: TaskRequest, max_retries: u32, seq: u64, now: Instant) -> Self {
        let deadline = request.deadline.map(|deadline| {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            now + remaining
        });

        Self {
            request,
            state: TaskState::Pending,
            retry_count: 0,
            max_retries,
            seq,
            submitted_at: now,
            not_before: now,
            deadline,
            decision: None,
            attempts: Vec::new(),
            attempt_started: None,
            timeout_at: None,
            result: None,
            failure: None,
            last_error: None,
            waiters: Vec::new(),
        }
    }

    /// Worker currently holding the task, if it is in flight
    pub fn current_worker(&self) -> Option<&str> {
        if !self.state.is_in_flight() {
            return None;
        }
        self.decision.as_ref().map(|d| d.worker_id.as_str())
    }

    /// 1-based number of the open attempt while the task is in flight
    pub fn current_attempt(&self) -> Option<u32> {
        if !self.state.is_in_flight() {
            return None;
        }
        self.attempts
            .last()
            .filter(|a| a.outcome == AttemptOutcome::InFlight)
            .map(|_| self.attempts.len() as u32)
    }

    /// A result only counts when it answers the open attempt on that worker
    pub fn accepts_result(&self, worker_id: &str, attempt: u32) -> bool {
        self.current_worker() == Some(worker_id) && self.current_attempt() == Some(attempt)
    }

    /// Carry the retry budget and attempt history over from an earlier run.
    ///
    /// An attempt that was in flight when that run stopped is closed as reassigned.
    pub fn restore_history(
        &mut self,
        retry_count: u32,
        attempts: Vec<AttemptRecord>,
        last_error: Option<ErrorDetails>,
    ) {
        self.retry_count = retry_count.min(self.max_retries);
        self.attempts = attempts;
        self.close_attempt(AttemptOutcome::Reassigned {
            reason: "coordinator restarted".to_string(),
        });
        self.last_error = last_error;
    }

    pub fn tried_workers(&self) -> HashSet<&str> {
        self.attempts.iter().map(|a| a.worker_id.as_str()).collect()
    }

    /// Close the open attempt, if any
    pub fn close_attempt(&mut self, outcome: AttemptOutcome) {
        if let Some(attempt) = self
            .attempts
            .last_mut()
            .filter(|a| a.outcome == AttemptOutcome::InFlight)
        {
            attempt.finish(outcome);
        }
        self.attempt_started = None;
        self.timeout_at = None;
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.state {
            TaskState::Succeeded => self.result.clone().map(Ok),
            TaskState::FailedPermanent => self.failure.clone().map(Err),
            _ => None,
        }
    }

    pub fn add_waiter(&mut self, waiter: oneshot::Sender<TaskOutcome>) {
        match self.outcome() {
            Some(outcome) => {
                let _ = waiter.send(outcome);
            }
            None => self.waiters.push(waiter),
        }
    }

    /// Deliver the terminal outcome to everyone waiting
    pub fn notify_waiters(&mut self) {
        if let Some(outcome) = self.outcome() {
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.request.id,
            request: self.request.clone(),
            state: self.state,
            retry_count: self.retry_count,
            worker_id: self.decision.as_ref().map(|d| d.worker_id.clone()),
            attempts: self.attempts.clone(),
            error: self.last_error.clone(),
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            task_id: self.request.id,
            task_type: self.request.task_type.clone(),
            state: self.state,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            worker_id: self.decision.as_ref().map(|d| d.worker_id.clone()),
            decision: self.decision.clone(),
            attempts: self.attempts.clone(),
            result: self.result.clone(),
            error: self.last_error.clone(),
        }
    }
}

/// Caller-facing view of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub task_type: String,
    pub state: TaskState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub worker_id: Option<WorkerId>,
    pub decision: Option<RoutingDecision>,
    pub attempts: Vec<AttemptRecord>,
    pub result: Option<ExecutionResult>,
    pub error: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed_permanent: usize,
}

#[derive(Debug)]
pub struct TaskQueue {
    entries: HashMap<Uuid, TaskEntry>,
    archived: VecDeque<Uuid>,
    archive_capacity: usize,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new(archive_capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            archived: VecDeque::new(),
            archive_capacity,
            next_seq: 0,
        }
    }

    /// Admit a task as PENDING; false if the id is already known
    pub fn insert(&mut self, request: TaskRequest, max_retries: u32, now: Instant) -> bool {
        if self.entries.contains_key(&request.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(request.id, TaskEntry::new(request, max_retries, seq, now));
        true
    }

    pub fn get(&self, task_id: &Uuid) -> Option<&TaskEntry> {
        self.entries.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &Uuid) -> Option<&mut TaskEntry> {
        self.entries.get_mut(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `batch` PENDING tasks due at `now`, by priority then submission order
    pub fn ready(&self, now: Instant, batch: usize) -> Vec<Uuid> {
        let mut ready: Vec<&TaskEntry> = self
            .entries
            .values()
            .filter(|e| e.state == TaskState::Pending && e.not_before <= now)
            .collect();
        ready.sort_by_key(|e| (Reverse(e.request.priority), e.seq));
        ready
            .into_iter()
            .take(batch)
            .map(|e| e.request.id)
            .collect()
    }

    /// In-flight tasks held by one worker, in submission order
    pub fn in_flight_on(&self, worker_id: &str) -> Vec<Uuid> {
        self.collect_sorted(|e| e.current_worker() == Some(worker_id))
    }

    /// Running tasks whose attempt timeout has passed, with the worker holding each
    pub fn timed_out(&self, now: Instant) -> Vec<(Uuid, WorkerId, u32)> {
        let ids = self.collect_sorted(|e| {
            e.state == TaskState::Running && e.timeout_at.is_some_and(|t| t <= now)
        });
        ids.into_iter()
            .filter_map(|id| {
                let entry = self.entries.get(&id)?;
                let worker = entry.current_worker()?.to_string();
                Some((id, worker, entry.current_attempt()?))
            })
            .collect()
    }

    /// PENDING tasks whose deadline has passed
    pub fn past_deadline(&self, now: Instant) -> Vec<Uuid> {
        self.collect_sorted(|e| {
            e.state == TaskState::Pending && e.deadline.is_some_and(|d| d <= now)
        })
    }

    fn collect_sorted(&self, predicate: impl Fn(&TaskEntry) -> bool) -> Vec<Uuid> {
        let mut matching: Vec<&TaskEntry> =
            self.entries.values().filter(|e| predicate(e)).collect();
        matching.sort_by_key(|e| e.seq);
        matching.into_iter().map(|e| e.request.id).collect()
    }

    /// Mark a terminal task as archived, evicting the oldest beyond capacity
    pub fn archive(&mut self, task_id: Uuid) {
        self.archived.push_back(task_id);
        while self.archived.len() > self.archive_capacity {
            if let Some(evicted) = self.archived.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                TaskState::Pending | TaskState::Failed => counts.pending += 1,
                TaskState::Assigned => counts.assigned += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::FailedPermanent => counts.failed_permanent += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Priority;
    use serde_json::json;
    use std::time::Duration;

    fn request(priority: Priority) -> TaskRequest {
        TaskRequest::new("summarize", json!({})).with_priority(priority)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_orders_by_priority_then_submission() {
        let mut queue = TaskQueue::new(10);
        let now = Instant::now();
        let low = request(Priority::Low);
        let first_normal = request(Priority::Normal);
        let urgent = request(Priority::Urgent);
        let second_normal = request(Priority::Normal);

        for r in [&low, &first_normal, &urgent, &second_normal] {
            assert!(queue.insert(r.clone(), 3, now));
        }

        assert_eq!(
            queue.ready(now, 10),
            vec![urgent.id, first_normal.id, second_normal.id, low.id]
        );
        assert_eq!(queue.ready(now, 2), vec![urgent.id, first_normal.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_insert_is_rejected() {
        let mut queue = TaskQueue::new(10);
        let r = request(Priority::Normal);
        assert!(queue.insert(r.clone(), 3, Instant::now()));
        assert!(!queue.insert(r, 3, Instant::now()));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_hides_task_until_due() {
        let mut queue = TaskQueue::new(10);
        let now = Instant::now();
        let r = request(Priority::Normal);
        queue.insert(r.clone(), 3, now);
        queue.get_mut(&r.id).unwrap().not_before = now + Duration::from_secs(1);

        assert!(queue.ready(now, 10).is_empty());
        assert_eq!(queue.ready(now + Duration::from_secs(1), 10), vec![r.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_archive_evicts_oldest_terminal_tasks() {
        let mut queue = TaskQueue::new(2);
        let now = Instant::now();
        let ids: Vec<Uuid> = (0..3)
            .map(|_| {
                let r = request(Priority::Normal);
                queue.insert(r.clone(), 3, now);
                r.id
            })
            .collect();

        for id in &ids {
            queue.get_mut(id).unwrap().state = TaskState::Succeeded;
            queue.archive(*id);
        }

        assert!(queue.get(&ids[0]).is_none());
        assert!(queue.get(&ids[1]).is_some());
        assert!(queue.get(&ids[2]).is_some());
        assert_eq!(queue.counts().succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_added_after_completion_is_answered() {
        let mut queue = TaskQueue::new(10);
        let r = request(Priority::Normal);
        queue.insert(r.clone(), 3, Instant::now());

        let entry = queue.get_mut(&r.id).unwrap();
        entry.state = TaskState::Succeeded;
        entry.result = Some(ExecutionResult {
            task_id: r.id,
            worker_id: "w1".to_string(),
            success: true,
            cost: 0.1,
            latency_ms: 5,
            output: None,
            error: None,
            tokens_used: None,
        });

        let (tx, rx) = oneshot::channel();
        entry.add_waiter(tx);
        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.worker_id, "w1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_attempt_only_touches_open_attempt() {
        let mut queue = TaskQueue::new(10);
        let r = request(Priority::Normal);
        queue.insert(r.clone(), 3, Instant::now());
        let entry = queue.get_mut(&r.id).unwrap();

        entry.attempts.push(AttemptRecord::started("w1"));
        entry.close_attempt(AttemptOutcome::Succeeded);
        entry.close_attempt(AttemptOutcome::Reassigned {
            reason: "late".to_string(),
        });

        assert_eq!(entry.attempts.len(), 1);
        assert_eq!(entry.attempts[0].outcome, AttemptOutcome::Succeeded);
        assert!(entry.attempts[0].finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepts_result_only_for_open_attempt() {
        let mut queue = TaskQueue::new(10);
        let r = request(Priority::Normal);
        queue.insert(r.clone(), 3, Instant::now());
        let entry = queue.get_mut(&r.id).unwrap();

        let decision = |worker: &str| RoutingDecision {
            task_id: r.id,
            worker_id: worker.to_string(),
            fallbacks: Vec::new(),
            score: 1.0,
            reason: String::new(),
            estimated_completion: Utc::now(),
            decided_at: Utc::now(),
        };

        entry.state = TaskState::Running;
        entry.decision = Some(decision("w1"));
        entry.attempts.push(AttemptRecord::started("w1"));
        assert!(entry.accepts_result("w1", 1));

        entry.close_attempt(AttemptOutcome::Reassigned {
            reason: "timeout".to_string(),
        });
        entry.attempts.push(AttemptRecord::started("w1"));
        assert_eq!(entry.current_attempt(), Some(2));
        assert!(!entry.accepts_result("w1", 1));
        assert!(!entry.accepts_result("w2", 2));
        assert!(entry.accepts_result("w1", 2));

        entry.state = TaskState::Succeeded;
        assert!(!entry.accepts_result("w1", 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_only_reports_pending() {
        let mut queue = TaskQueue::new(10);
        let now = Instant::now();
        let r = request(Priority::Normal).with_deadline(Utc::now() - chrono::Duration::seconds(1));
        queue.insert(r.clone(), 3, now);

        assert_eq!(queue.past_deadline(now), vec![r.id]);
        queue.get_mut(&r.id).unwrap().state = TaskState::FailedPermanent;
        assert!(queue.past_deadline(now).is_empty());
    }
}
