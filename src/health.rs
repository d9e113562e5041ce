//! Worker health evaluation
//!
//! Pure functions that derive a worker's liveness status from its last
//! heartbeat, its failure streak and its self-reported health score. The
//! scheduler applies the results and performs reassignment when a worker
//! goes offline.

use crate::config::HealthSection;
use crate::protocol::WorkerId;
use crate::registry::{Worker, WorkerStatus};
use serde::{Serialize, Serializer};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Thresholds used to classify a worker
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    pub heartbeat_interval: Duration,
    pub health_timeout: Duration,
    pub failure_threshold: u32,
    pub degraded_health_score: f64,
}

impl HealthPolicy {
    pub fn from_config(config: &HealthSection) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            health_timeout: config.health_timeout(),
            failure_threshold: config.failure_threshold,
            degraded_health_score: config.degraded_health_score,
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from_config(&HealthSection::default())
    }
}

/// Change in a worker's liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Degraded,
    WentOffline,
    Recovered,
}

/// Point-in-time health view of one worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub consecutive_failures: u32,
    pub last_failure_reason: Option<String>,
    #[serde(rename = "last_heartbeat_age_ms", serialize_with = "duration_as_millis")]
    pub last_heartbeat_age: Duration,
}

fn duration_as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Pure health evaluation logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Liveness status a worker should have at `now` (pure function)
    ///
    /// Never returns `Paused`; pausing is orthogonal to liveness.
    pub fn evaluate(worker: &Worker, now: Instant, policy: &HealthPolicy) -> WorkerStatus {
        if worker.disconnected {
            return WorkerStatus::Offline;
        }

        let age = now.saturating_duration_since(worker.last_heartbeat);
        if age > policy.health_timeout {
            return WorkerStatus::Offline;
        }

        let stale = age > policy.heartbeat_interval;
        let failing =
            policy.failure_threshold > 0 && worker.consecutive_failures >= policy.failure_threshold;
        let unhealthy = worker
            .health_score
            .map(|score| score < policy.degraded_health_score)
            .unwrap_or(false);

        if stale || failing || unhealthy {
            WorkerStatus::Degraded
        } else {
            WorkerStatus::Active
        }
    }

    /// Classify a status change (pure function)
    pub fn classify(from: WorkerStatus, to: WorkerStatus) -> HealthTransition {
        match (from, to) {
            (a, b) if a == b => HealthTransition::Unchanged,
            (_, WorkerStatus::Offline) => HealthTransition::WentOffline,
            (_, WorkerStatus::Degraded) => HealthTransition::Degraded,
            (_, WorkerStatus::Active) => HealthTransition::Recovered,
            _ => HealthTransition::Unchanged,
        }
    }

    /// Re-evaluate and store a worker's liveness, returning the transition
    pub fn refresh(worker: &mut Worker, now: Instant, policy: &HealthPolicy) -> HealthTransition {
        let next = Self::evaluate(worker, now, policy);
        let transition = Self::classify(worker.health, next);
        if transition != HealthTransition::Unchanged {
            Self::log_transition(&worker.id, worker.health, next);
            worker.health = next;
        }
        transition
    }

    pub fn snapshot(worker: &Worker, now: Instant) -> HealthSnapshot {
        HealthSnapshot {
            worker_id: worker.id.clone(),
            status: worker.status(),
            consecutive_failures: worker.consecutive_failures,
            last_failure_reason: worker.last_failure.clone(),
            last_heartbeat_age: now.saturating_duration_since(worker.last_heartbeat),
        }
    }

    fn log_transition(worker_id: &str, from: WorkerStatus, to: WorkerStatus) {
        match to {
            WorkerStatus::Offline => {
                warn!(worker_id = %worker_id, from = ?from, "Worker went offline")
            }
            WorkerStatus::Degraded => {
                warn!(worker_id = %worker_id, from = ?from, "Worker degraded")
            }
            _ => info!(worker_id = %worker_id, from = ?from, to = ?to, "Worker recovered"),
        }
    }
}
