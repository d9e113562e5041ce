//! Error types for the federation router
//!
//! `FederationError` carries the routing failure taxonomy. Every variant can be
//! rendered as wire-safe `ErrorDetails`, with secrets and sensitive paths
//! scrubbed before the message leaves the process.

use crate::protocol::messages::{AttemptRecord, ErrorCode, ErrorDetails, TaskFailure};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for federation operations
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("No eligible worker for task type '{task_type}'")]
    NoEligibleWorker { task_type: String },

    #[error("Worker unavailable: {message}")]
    WorkerUnavailable { message: String },

    #[error("Execution failed on worker '{worker_id}': {message}")]
    ExecutionError { worker_id: String, message: String },

    #[error("Task timed out on worker '{worker_id}' after {elapsed_ms}ms")]
    Timeout { worker_id: String, elapsed_ms: u64 },

    #[error("Retries exhausted for task {task_id} after {} attempts: {last_error}", .attempts.len())]
    RetriesExhausted {
        task_id: Uuid,
        attempts: Vec<AttemptRecord>,
        last_error: String,
    },

    #[error("Deadline exceeded for task {task_id}")]
    DeadlineExceeded {
        task_id: Uuid,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),
}

impl FederationError {
    pub fn no_eligible_worker<S: Into<String>>(task_type: S) -> Self {
        Self::NoEligibleWorker {
            task_type: task_type.into(),
        }
    }

    pub fn worker_unavailable<S: Into<String>>(message: S) -> Self {
        Self::WorkerUnavailable {
            message: message.into(),
        }
    }

    pub fn execution_error<W: Into<String>, S: Into<String>>(worker_id: W, message: S) -> Self {
        Self::ExecutionError {
            worker_id: worker_id.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            FederationError::NoEligibleWorker { .. } => ErrorCode::NoEligibleWorker,
            FederationError::WorkerUnavailable { .. } => ErrorCode::WorkerUnavailable,
            FederationError::ExecutionError { .. } => ErrorCode::ExecutionError,
            FederationError::Timeout { .. } => ErrorCode::Timeout,
            FederationError::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            FederationError::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            FederationError::InvalidInput { .. } => ErrorCode::InvalidInput,
            FederationError::TaskNotFound(_) => ErrorCode::TaskNotFound,
            FederationError::Config(_)
            | FederationError::Transport(_)
            | FederationError::Persistence(_) => ErrorCode::InternalError,
        }
    }

    /// Attempt history for terminal failures, empty otherwise
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            FederationError::RetriesExhausted { attempts, .. }
            | FederationError::DeadlineExceeded { attempts, .. } => attempts,
            _ => &[],
        }
    }

    /// Render as a sanitised code/message pair for the wire
    pub fn to_error_details(&self) -> ErrorDetails {
        ErrorDetails {
            code: self.code(),
            message: sanitize_error_message(&self.to_string()),
        }
    }
}

impl From<TaskFailure> for FederationError {
    fn from(failure: TaskFailure) -> Self {
        match failure.error.code {
            ErrorCode::NoEligibleWorker => FederationError::NoEligibleWorker {
                task_type: failure.task_type,
            },
            ErrorCode::DeadlineExceeded => FederationError::DeadlineExceeded {
                task_id: failure.task_id,
                attempts: failure.attempts,
            },
            _ => FederationError::RetriesExhausted {
                task_id: failure.task_id,
                attempts: failure.attempts,
                last_error: failure.error.message,
            },
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Scrub secrets and sensitive paths, cap the length at 500 bytes
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for federation operations
pub type FederationResult<T> = Result<T, FederationError>;
