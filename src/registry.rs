//! Capability registry
//!
//! Tracks known workers, the task types each declares, and the per-worker
//! counters the scheduler mutates (in-flight count, rolling stats, failure
//! streak). All mutation happens under the registry's write lock, one worker
//! record at a time, so concurrent success and failure callbacks cannot lose
//! updates to the same worker.

use crate::protocol::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;
use tracing::{debug, info};

/// Capability matching any task type
pub const WILDCARD_CAPABILITY: &str = "general";

/// Externally visible worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Degraded,
    Offline,
    Paused,
}

impl WorkerStatus {
    /// Active or degraded workers count as online
    pub fn is_online(&self) -> bool {
        matches!(self, WorkerStatus::Active | WorkerStatus::Degraded)
    }
}

/// Strength of a worker's capability match for one task type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityMatch {
    Exact,
    Wildcard,
    None,
}

impl CapabilityMatch {
    pub fn fit(&self) -> f64 {
        match self {
            CapabilityMatch::Exact => 1.0,
            CapabilityMatch::Wildcard => 0.7,
            CapabilityMatch::None => 0.0,
        }
    }
}

/// Running averages over every outcome a worker has produced
///
/// Registration may seed the averages with values the worker reports about
/// itself; a seed counts as a single sample so local history quickly
/// dominates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingStats {
    pub samples: u64,
    pub success_rate: Option<f64>,
    pub avg_cost: Option<f64>,
    pub avg_latency_ms: Option<f64>,
}

impl RollingStats {
    pub fn seeded(
        success_rate: Option<f64>,
        avg_cost: Option<f64>,
        avg_latency_ms: Option<f64>,
    ) -> Self {
        let any = success_rate.is_some() || avg_cost.is_some() || avg_latency_ms.is_some();
        Self {
            samples: u64::from(any),
            success_rate: success_rate.map(|r| r.clamp(0.0, 1.0)),
            avg_cost: avg_cost.map(|c| c.max(0.0)),
            avg_latency_ms: avg_latency_ms.map(|l| l.max(0.0)),
        }
    }

    pub fn observe(&mut self, success: bool, cost: f64, latency_ms: f64) {
        let n = self.samples as f64;
        let observed = if success { 1.0 } else { 0.0 };
        self.success_rate = Some(running_mean(self.success_rate, n, observed));
        self.avg_cost = Some(running_mean(self.avg_cost, n, cost));
        self.avg_latency_ms = Some(running_mean(self.avg_latency_ms, n, latency_ms));
        self.samples += 1;
    }
}

/// `(old * n + observed) / (n + 1)`, or the observation itself when there is no prior
pub fn running_mean(old: Option<f64>, n: f64, observed: f64) -> f64 {
    match old {
        Some(old) if n > 0.0 => (old * n + observed) / (n + 1.0),
        _ => observed,
    }
}

/// A registered worker and its scheduler-owned counters
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    /// Lowercased task types
    pub capabilities: BTreeSet<String>,
    pub description: Option<String>,
    pub max_concurrency: u32,
    /// Authoritative count of tasks assigned or running on this worker
    pub in_flight: u32,
    pub stats: RollingStats,
    /// Liveness-derived status, never `Paused`
    pub health: WorkerStatus,
    pub paused: bool,
    /// Set by an explicit disconnect, cleared by the next heartbeat or registration
    pub disconnected: bool,
    pub last_heartbeat: Instant,
    pub registered_at: DateTime<Utc>,
    /// Load as reported by the worker, diagnostics only
    pub reported_load: Option<f64>,
    pub health_score: Option<f64>,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
}

impl Worker {
    pub fn new<S: Into<String>>(id: S, capabilities: Vec<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: normalize_capabilities(capabilities),
            description: None,
            max_concurrency: 1,
            in_flight: 0,
            stats: RollingStats::default(),
            health: WorkerStatus::Active,
            paused: false,
            disconnected: false,
            last_heartbeat: Instant::now(),
            registered_at: Utc::now(),
            reported_load: None,
            health_score: None,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_stats(mut self, stats: RollingStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Effective status: offline beats paused, paused beats health
    pub fn status(&self) -> WorkerStatus {
        if self.health == WorkerStatus::Offline {
            WorkerStatus::Offline
        } else if self.paused {
            WorkerStatus::Paused
        } else {
            self.health
        }
    }

    /// Current load in [0, 1], derived from the in-flight count
    pub fn load(&self) -> f64 {
        (f64::from(self.in_flight) / f64::from(self.max_concurrency.max(1))).min(1.0)
    }

    pub fn capability_match(&self, task_type: &str) -> CapabilityMatch {
        let task_type = task_type.to_lowercase();
        if self.capabilities.contains(&task_type) {
            CapabilityMatch::Exact
        } else if self.capabilities.contains(WILDCARD_CAPABILITY) {
            CapabilityMatch::Wildcard
        } else {
            CapabilityMatch::None
        }
    }

    /// Eligible to receive new assignments
    pub fn is_schedulable(&self) -> bool {
        !matches!(self.status(), WorkerStatus::Offline | WorkerStatus::Paused)
    }
}

fn normalize_capabilities(capabilities: Vec<String>) -> BTreeSet<String> {
    capabilities
        .into_iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Thread-safe registry of workers
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    workers: Arc<RwLock<HashMap<WorkerId, Worker>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WorkerId, Worker>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WorkerId, Worker>> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker, or refresh a known one.
    ///
    /// Re-registration keeps the in-flight count, rolling stats and pause flag
    /// of the existing record; capabilities, concurrency and description are
    /// replaced and the worker is marked live. Returns `true` for a new worker.
    pub fn register(&self, worker: Worker) -> bool {
        let worker_id = worker.id.clone();
        let mut workers = self.write();

        match workers.get_mut(&worker_id) {
            Some(existing) => {
                existing.capabilities = worker.capabilities;
                existing.max_concurrency = worker.max_concurrency.max(1);
                if worker.description.is_some() {
                    existing.description = worker.description;
                }
                if existing.stats.samples == 0 {
                    existing.stats = worker.stats;
                }
                existing.disconnected = false;
                existing.last_heartbeat = Instant::now();
                if existing.health == WorkerStatus::Offline {
                    existing.health = WorkerStatus::Active;
                }
                debug!(worker_id = %worker_id, "Re-registered worker");
                false
            }
            None => {
                info!(
                    worker_id = %worker_id,
                    capabilities = ?worker.capabilities,
                    max_concurrency = worker.max_concurrency,
                    "Registered new worker"
                );
                workers.insert(worker_id, worker);
                true
            }
        }
    }

    /// Remove a worker from membership entirely
    pub fn unregister(&self, worker_id: &str) -> Option<Worker> {
        let removed = self.write().remove(worker_id);
        if removed.is_some() {
            info!(worker_id = %worker_id, "Unregistered worker");
        }
        removed
    }

    /// Workers declaring `task_type` or the wildcard, in any status, ordered by id.
    ///
    /// An empty list is the normal "no eligible worker" answer.
    pub fn eligible_workers(&self, task_type: &str) -> Vec<Worker> {
        let mut matches: Vec<Worker> = self
            .read()
            .values()
            .filter(|w| w.capability_match(task_type) != CapabilityMatch::None)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    pub fn get(&self, worker_id: &str) -> Option<Worker> {
        self.read().get(worker_id).cloned()
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.read().contains_key(worker_id)
    }

    /// Every worker, ordered by id
    pub fn all(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.read().values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.read()
            .values()
            .filter(|w| w.status().is_online())
            .count()
    }

    pub fn update_capabilities(&self, worker_id: &str, capabilities: Vec<String>) -> bool {
        self.update(worker_id, |w| {
            w.capabilities = normalize_capabilities(capabilities);
            debug!(worker_id = %w.id, capabilities = ?w.capabilities, "Updated capabilities");
        })
        .is_some()
    }

    /// Apply `f` to one worker record under the write lock
    pub(crate) fn update<R>(&self, worker_id: &str, f: impl FnOnce(&mut Worker) -> R) -> Option<R> {
        self.write().get_mut(worker_id).map(f)
    }

    /// Apply `f` to every worker record under a single write lock
    pub(crate) fn update_all<R>(&self, mut f: impl FnMut(&mut Worker) -> Option<R>) -> Vec<R> {
        let mut workers = self.write();
        let mut ids: Vec<WorkerId> = workers.keys().cloned().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| workers.get_mut(&id).and_then(&mut f))
            .collect()
    }

    pub(crate) fn begin_task(&self, worker_id: &str) {
        self.update(worker_id, |w| w.in_flight += 1);
    }

    /// Release one in-flight slot and update the failure streak
    pub(crate) fn finish_task(&self, worker_id: &str, failure: Option<&str>) {
        self.update(worker_id, |w| {
            w.in_flight = w.in_flight.saturating_sub(1);
            match failure {
                Some(reason) => {
                    w.consecutive_failures += 1;
                    w.last_failure = Some(reason.to_string());
                }
                None => w.consecutive_failures = 0,
            }
        });
    }
}
