//! Outcome learning store
//!
//! Keeps one [`LearningRecord`] per (task type, complexity) bucket. Readers take
//! a cheap `Arc` snapshot of the whole table and never wait on a writer; writers
//! serialize on a separate mutex, clone the table, apply the update and swap
//! the new table in.

use crate::protocol::{Complexity, WorkerId};
use crate::registry::running_mean;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

/// Alternatives kept on a record besides the best worker
const MAX_ALTERNATIVES: usize = 3;

/// Confidence of a bucket with a single sample
pub const INITIAL_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub task_type: String,
    pub complexity: Complexity,
}

impl BucketKey {
    pub fn new(task_type: &str, complexity: Complexity) -> Self {
        Self {
            task_type: task_type.to_lowercase(),
            complexity,
        }
    }
}

/// Running averages of one worker within one bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerBucketStats {
    pub samples: u64,
    pub success_rate: f64,
    pub avg_cost: f64,
    pub avg_latency_ms: f64,
}

impl WorkerBucketStats {
    fn observe(&mut self, success: bool, cost: f64, latency_ms: f64) {
        let n = self.samples as f64;
        let prior = |v: f64| (self.samples > 0).then_some(v);
        let observed = if success { 1.0 } else { 0.0 };
        self.success_rate = running_mean(prior(self.success_rate), n, observed);
        self.avg_cost = running_mean(prior(self.avg_cost), n, cost);
        self.avg_latency_ms = running_mean(prior(self.avg_latency_ms), n, latency_ms);
        self.samples += 1;
    }
}

/// Learned performance of a (task type, complexity) bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub task_type: String,
    pub complexity: Complexity,
    pub best_worker: Option<WorkerId>,
    pub alternatives: Vec<WorkerId>,
    pub success_rate: f64,
    pub avg_cost: f64,
    pub avg_latency_ms: f64,
    pub confidence: f64,
    pub sample_size: u64,
    #[serde(default)]
    pub workers: BTreeMap<WorkerId, WorkerBucketStats>,
    pub updated_at: DateTime<Utc>,
}

impl LearningRecord {
    fn first(key: &BucketKey) -> Self {
        Self {
            task_type: key.task_type.clone(),
            complexity: key.complexity,
            best_worker: None,
            alternatives: Vec::new(),
            success_rate: 0.0,
            avg_cost: 0.0,
            avg_latency_ms: 0.0,
            confidence: 0.0,
            sample_size: 0,
            workers: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> BucketKey {
        BucketKey::new(&self.task_type, self.complexity)
    }

    pub fn worker_stats(&self, worker_id: &str) -> Option<&WorkerBucketStats> {
        self.workers.get(worker_id)
    }

    fn apply(&mut self, worker_id: &str, success: bool, cost: f64, latency_ms: f64, saturation: u64) {
        let n = self.sample_size as f64;
        let prior = |v: f64| (self.sample_size > 0).then_some(v);
        let observed = if success { 1.0 } else { 0.0 };
        self.success_rate = running_mean(prior(self.success_rate), n, observed);
        self.avg_cost = running_mean(prior(self.avg_cost), n, cost);
        self.avg_latency_ms = running_mean(prior(self.avg_latency_ms), n, latency_ms);
        self.sample_size += 1;
        self.confidence = confidence_for(self.sample_size, saturation);

        self.workers
            .entry(worker_id.to_string())
            .or_default()
            .observe(success, cost, latency_ms);
        self.rerank_workers();
        self.updated_at = Utc::now();
    }

    /// Best worker by success rate, then sample count, then id
    fn rerank_workers(&mut self) {
        let mut ranked: Vec<(&WorkerId, &WorkerBucketStats)> = self.workers.iter().collect();
        ranked.sort_by(|(a_id, a), (b_id, b)| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.samples.cmp(&a.samples))
                .then_with(|| a_id.cmp(b_id))
        });

        let mut ids = ranked.into_iter().map(|(id, _)| id.clone());
        self.best_worker = ids.next();
        self.alternatives = ids.take(MAX_ALTERNATIVES).collect();
    }
}

/// Confidence after `samples` observations: 0.1 for the first, rising
/// linearly to 1.0 at `saturation` samples.
pub fn confidence_for(samples: u64, saturation: u64) -> f64 {
    match samples {
        0 => 0.0,
        1 => INITIAL_CONFIDENCE,
        n if saturation <= 1 || n >= saturation => 1.0,
        n => {
            let progress = (n - 1) as f64 / (saturation - 1) as f64;
            (INITIAL_CONFIDENCE + (1.0 - INITIAL_CONFIDENCE) * progress).min(1.0)
        }
    }
}

/// Immutable view of every bucket at one point in time
pub type LearningView = Arc<HashMap<BucketKey, LearningRecord>>;

/// Copy-on-write store of learning records
#[derive(Debug)]
pub struct LearningStore {
    records: RwLock<LearningView>,
    writer: Mutex<()>,
    confidence_samples: u64,
}

impl Default for LearningStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl LearningStore {
    pub fn new(confidence_samples: u64) -> Self {
        Self {
            records: RwLock::new(Arc::new(HashMap::new())),
            writer: Mutex::new(()),
            confidence_samples: confidence_samples.max(2),
        }
    }

    /// Current table; holding it never blocks writers
    pub fn view(&self) -> LearningView {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, task_type: &str, complexity: Complexity) -> Option<LearningRecord> {
        self.view()
            .get(&BucketKey::new(task_type, complexity))
            .cloned()
    }

    /// Fold one outcome into its bucket and return the updated record
    pub fn record_outcome(
        &self,
        task_type: &str,
        complexity: Complexity,
        worker_id: &str,
        success: bool,
        cost: f64,
        latency_ms: f64,
    ) -> LearningRecord {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let key = BucketKey::new(task_type, complexity);

        let mut next = HashMap::clone(&self.view());
        let record = next
            .entry(key.clone())
            .or_insert_with(|| LearningRecord::first(&key));
        record.apply(
            worker_id,
            success,
            cost.max(0.0),
            latency_ms.max(0.0),
            self.confidence_samples,
        );
        let updated = record.clone();

        *self.records.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);

        debug!(
            task_type = %key.task_type,
            complexity = %key.complexity,
            worker_id = %worker_id,
            success,
            sample_size = updated.sample_size,
            confidence = updated.confidence,
            "Recorded outcome"
        );
        updated
    }

    /// Every record, ordered by bucket
    pub fn snapshot(&self) -> Vec<LearningRecord> {
        let mut records: Vec<LearningRecord> = self.view().values().cloned().collect();
        records.sort_by_key(|r| r.key());
        records
    }

    /// Seed the store; later records for the same bucket win
    pub fn restore(&self, records: Vec<LearningRecord>) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&self.view());
        for record in records {
            next.insert(record.key(), record);
        }
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.view().is_empty()
    }
}
