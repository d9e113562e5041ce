//! Topic canonicalization and worker ID validation
//!
//! Worker traffic uses two topics per worker under a configurable prefix:
//! `{prefix}/workers/{id}/events` (worker to coordinator) and
//! `{prefix}/workers/{id}/assignments` (coordinator to worker).

use thiserror::Error;

pub fn canonicalize_topic(topic: &str) -> String {
    if topic.is_empty() {
        return "/".to_string();
    }

    let mut result = if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("/{topic}")
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

pub fn validate_worker_id(worker_id: &str) -> Result<(), ValidationError> {
    if worker_id.is_empty() {
        return Err(ValidationError::EmptyWorkerId);
    }

    for ch in worker_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidWorkerIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for worker identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Worker ID cannot be empty")]
    EmptyWorkerId,
    #[error("Worker ID contains invalid character: '{0}'")]
    InvalidWorkerIdChar(char),
}

/// Builds and parses the per-worker topics under one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTopics {
    prefix: String,
}

impl WorkerTopics {
    pub fn new(prefix: &str) -> Self {
        let prefix = canonicalize_topic(prefix);
        let prefix = if prefix == "/" { String::new() } else { prefix };
        Self { prefix }
    }

    pub fn events(&self, worker_id: &str) -> String {
        canonicalize_topic(&format!("{}/workers/{worker_id}/events", self.prefix))
    }

    pub fn assignments(&self, worker_id: &str) -> String {
        canonicalize_topic(&format!("{}/workers/{worker_id}/assignments", self.prefix))
    }

    /// Wildcard subscription covering every worker's events topic
    pub fn events_subscription(&self) -> String {
        canonicalize_topic(&format!("{}/workers/+/events", self.prefix))
    }

    /// Retained coordinator presence topic
    pub fn coordinator_status(&self) -> String {
        canonicalize_topic(&format!("{}/coordinator/status", self.prefix))
    }

    /// Extract the worker id from an events topic, rejecting anything else
    pub fn worker_from_events_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.prefix.as_str())?;
        let rest = rest.strip_prefix("/workers/")?;
        let worker_id = rest.strip_suffix("/events")?;
        validate_worker_id(worker_id).ok()?;
        Some(worker_id)
    }
}
