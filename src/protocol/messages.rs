//! Task and worker message types for the federation router
//!
//! This module defines the data model shared by the scheduler and the worker
//! transport: task requests, execution results, attempt history and the two
//! wire enums exchanged with workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Worker identifiers follow the `[a-zA-Z0-9._-]+` rule enforced at registration.
pub type WorkerId = String;

/// Default retry budget when a request does not carry its own.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Complexity tier of a task, the second half of a learning bucket key
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(Complexity::Simple),
            "medium" => Ok(Complexity::Medium),
            "complex" => Ok(Complexity::Complex),
            other => Err(format!("Unknown complexity: {other}")),
        }
    }
}

/// Task priority. Ordering is `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Multiplier applied to a worker's final score
    pub fn score_multiplier(&self) -> f64 {
        match self {
            Priority::Urgent => 1.2,
            Priority::High => 1.1,
            Priority::Normal | Priority::Low => 1.0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

/// Optional per-task cost and latency budget
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
}

/// A unit of work submitted to the federation
///
/// # Examples
/// ```
/// use federation_router::protocol::{Complexity, Priority, TaskRequest};
/// use serde_json::json;
///
/// let task = TaskRequest::new("summarize", json!({"text": "..."}))
///     .with_complexity(Complexity::Simple)
///     .with_priority(Priority::High)
///     .with_cost_budget(0.5);
/// assert_eq!(task.task_type, "summarize");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: Uuid,
    pub task_type: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_worker: Option<WorkerId>,
    /// Falls back to the scheduler's configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskRequest {
    pub fn new<S: Into<String>>(task_type: S, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            complexity: Complexity::default(),
            priority: Priority::default(),
            payload,
            budget: Budget::default(),
            target_worker: None,
            max_retries: None,
            deadline: None,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost_budget(mut self, max_cost: f64) -> Self {
        self.budget.max_cost = Some(max_cost);
        self
    }

    pub fn with_latency_budget(mut self, max_latency_ms: u64) -> Self {
        self.budget.max_latency_ms = Some(max_latency_ms);
        self
    }

    pub fn with_target_worker<S: Into<String>>(mut self, worker_id: S) -> Self {
        self.target_worker = Some(worker_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Scheduler-side lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    FailedPermanent,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::FailedPermanent)
    }

    /// Assigned or running on a worker
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::FailedPermanent => "FAILED_PERMANENT",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful task, tagged with the worker that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub worker_id: WorkerId,
    pub success: bool,
    pub cost: f64,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// Error codes rendered on the wire and in task history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoEligibleWorker,
    WorkerUnavailable,
    ExecutionError,
    Timeout,
    RetriesExhausted,
    DeadlineExceeded,
    InvalidInput,
    TaskNotFound,
    InternalError,
}

impl ErrorCode {
    /// Transient codes are absorbed by retry and fallback
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::WorkerUnavailable | ErrorCode::ExecutionError | ErrorCode::Timeout
        )
    }
}

/// Sanitised error code and message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
}

/// How a single attempt on a worker ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    InFlight,
    Succeeded,
    Failed { code: ErrorCode, message: String },
    /// The worker went offline and the task was handed back to the queue
    Reassigned { reason: String },
}

/// One entry of a task's attempt history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn started(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: AttemptOutcome::InFlight,
        }
    }

    pub fn finish(&mut self, outcome: AttemptOutcome) {
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
    }
}

/// Terminal failure delivered to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub task_type: String,
    pub error: ErrorDetails,
    pub attempts: Vec<AttemptRecord>,
}

impl TaskFailure {
    /// Worker ids in the order they were attempted
    pub fn workers_attempted(&self) -> Vec<WorkerId> {
        self.attempts.iter().map(|a| a.worker_id.clone()).collect()
    }
}

/// Messages sent by workers to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        capabilities: Vec<String>,
        #[serde(default = "default_max_concurrency")]
        max_concurrency: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success_rate: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avg_cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avg_latency_ms: Option<f64>,
    },
    Heartbeat {
        #[serde(default)]
        load: f64,
        /// 0-100, higher is healthier
        #[serde(default = "default_health_score")]
        health_score: f64,
    },
    /// `attempt` echoes the number from the assignment being answered
    TaskCompleted {
        task_id: Uuid,
        attempt: u32,
        result: TaskCompletion,
    },
    TaskFailed {
        task_id: Uuid,
        attempt: u32,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
    },
    CapabilityUpdate {
        capabilities: Vec<String>,
    },
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

fn default_max_concurrency() -> u32 {
    1
}

fn default_health_score() -> f64 {
    100.0
}

/// Worker-reported result payload of `task_completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub cost: f64,
    /// Measured by the coordinator when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// Messages sent by the coordinator to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    TaskAssignment(TaskAssignment),
    TaskCancelled { task_id: Uuid, reason: String },
}

/// Work order handed to the selected worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    /// 1-based; results must echo it back
    pub attempt: u32,
    pub task_type: String,
    pub complexity: Complexity,
    pub priority: Priority,
    pub payload: Value,
    pub budget: Budget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl From<&TaskRequest> for TaskAssignment {
    fn from(request: &TaskRequest) -> Self {
        Self {
            task_id: request.id,
            attempt: 1,
            task_type: request.task_type.clone(),
            complexity: request.complexity,
            priority: request.priority,
            payload: request.payload.clone(),
            budget: request.budget.clone(),
            deadline: request.deadline,
        }
    }
}

impl TaskAssignment {
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}
