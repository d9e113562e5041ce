//! Worker scoring
//!
//! A worker's score for a task is a weighted sum of four normalized
//! sub-scores (capability fit, historical performance, cost efficiency and
//! availability), multiplied by the task's priority. Scoring is pure; ranking
//! breaks ties by worker id so identical inputs always give identical output.

use crate::config::ScoringSection;
use crate::learning::LearningRecord;
use crate::protocol::{TaskRequest, WorkerId};
use crate::registry::{CapabilityMatch, Worker, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Neutral historical score for a worker and bucket with no history at all
pub const UNKNOWN_HISTORY_SCORE: f64 = 0.5;

/// Which weighting the scorer uses for the live-capacity sub-score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Single-agent routing, availability weighted 0.1
    Agent,
    /// Fleet routing, load weighted 0.3
    #[default]
    Federation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub capability: f64,
    pub history: f64,
    pub cost: f64,
    pub availability: f64,
}

impl RoutingMode {
    pub fn weights(&self) -> ScoreWeights {
        let availability = match self {
            RoutingMode::Agent => 0.1,
            RoutingMode::Federation => 0.3,
        };
        ScoreWeights {
            capability: 0.4,
            history: 0.3,
            cost: 0.2,
            availability,
        }
    }
}

/// Sub-scores and estimates behind one worker's score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub capability_fit: f64,
    pub historical: f64,
    pub cost_efficiency: f64,
    pub availability: f64,
    pub priority_multiplier: f64,
    pub total: f64,
    pub estimated_cost: f64,
    pub estimated_latency_ms: f64,
}

impl ScoreBreakdown {
    pub fn reason(&self) -> String {
        format!(
            "capability={:.2} history={:.2} cost={:.2} availability={:.2} priority=x{:.1} total={:.3}",
            self.capability_fit,
            self.historical,
            self.cost_efficiency,
            self.availability,
            self.priority_multiplier,
            self.total
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredWorker {
    pub worker_id: WorkerId,
    pub breakdown: ScoreBreakdown,
}

/// Pure scoring function parameterised by mode and default budgets
#[derive(Debug, Clone, PartialEq)]
pub struct Scorer {
    mode: RoutingMode,
    default_cost_budget: f64,
    default_latency_ms: f64,
}

impl Default for Scorer {
    fn default() -> Self {
        Self::from_config(&ScoringSection::default())
    }
}

impl Scorer {
    pub fn new(mode: RoutingMode, default_cost_budget: f64, default_latency_ms: u64) -> Self {
        Self {
            mode,
            default_cost_budget,
            default_latency_ms: default_latency_ms as f64,
        }
    }

    pub fn from_config(config: &ScoringSection) -> Self {
        Self::new(
            config.mode,
            config.default_cost_budget,
            config.default_latency_ms,
        )
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Score one worker for one task (pure function)
    pub fn score(
        &self,
        worker: &Worker,
        task: &TaskRequest,
        record: Option<&LearningRecord>,
    ) -> ScoreBreakdown {
        let weights = self.mode.weights();
        let capability_fit = worker.capability_match(&task.task_type).fit();
        let historical = Self::historical_performance(worker, record);
        let estimated_cost = Self::estimated_cost(worker, record);
        let estimated_latency_ms = self.estimated_latency_ms(worker, record);

        let budget = task
            .budget
            .max_cost
            .filter(|b| *b > 0.0)
            .unwrap_or(self.default_cost_budget);
        let cost_efficiency = if budget > 0.0 {
            (1.0 - estimated_cost / budget).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let availability = if worker.status() == WorkerStatus::Offline {
            0.0
        } else {
            1.0 - worker.load()
        };

        let priority_multiplier = task.priority.score_multiplier();
        let weighted = weights.capability * capability_fit
            + weights.history * historical
            + weights.cost * cost_efficiency
            + weights.availability * availability;

        ScoreBreakdown {
            capability_fit,
            historical,
            cost_efficiency,
            availability,
            priority_multiplier,
            total: weighted * priority_multiplier,
            estimated_cost,
            estimated_latency_ms,
        }
    }

    /// Rank workers best first; workers without a capability match are dropped
    pub fn rank(
        &self,
        workers: &[Worker],
        task: &TaskRequest,
        record: Option<&LearningRecord>,
    ) -> Vec<ScoredWorker> {
        let mut ranked: Vec<ScoredWorker> = workers
            .iter()
            .filter(|w| w.capability_match(&task.task_type) != CapabilityMatch::None)
            .map(|w| ScoredWorker {
                worker_id: w.id.clone(),
                breakdown: self.score(w, task, record),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.breakdown
                .total
                .partial_cmp(&a.breakdown.total)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        ranked
    }

    /// Worker bucket history, then worker rolling rate, then bucket aggregate
    fn historical_performance(worker: &Worker, record: Option<&LearningRecord>) -> f64 {
        record
            .and_then(|r| r.worker_stats(&worker.id))
            .filter(|s| s.samples > 0)
            .map(|s| s.success_rate)
            .or(worker.stats.success_rate)
            .or_else(|| record.filter(|r| r.sample_size > 0).map(|r| r.success_rate))
            .unwrap_or(UNKNOWN_HISTORY_SCORE)
            .clamp(0.0, 1.0)
    }

    fn estimated_cost(worker: &Worker, record: Option<&LearningRecord>) -> f64 {
        record
            .and_then(|r| r.worker_stats(&worker.id))
            .filter(|s| s.samples > 0)
            .map(|s| s.avg_cost)
            .or(worker.stats.avg_cost)
            .or_else(|| record.filter(|r| r.sample_size > 0).map(|r| r.avg_cost))
            .unwrap_or(0.0)
    }

    fn estimated_latency_ms(&self, worker: &Worker, record: Option<&LearningRecord>) -> f64 {
        record
            .and_then(|r| r.worker_stats(&worker.id))
            .filter(|s| s.samples > 0)
            .map(|s| s.avg_latency_ms)
            .or(worker.stats.avg_latency_ms)
            .or_else(|| record.filter(|r| r.sample_size > 0).map(|r| r.avg_latency_ms))
            .unwrap_or(self.default_latency_ms)
    }
}
