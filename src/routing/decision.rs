//! Routing decisions and fallback chains

use super::scorer::ScoredWorker;
use crate::protocol::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The active assignment of a task plus its bounded fallback chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_id: Uuid,
    pub worker_id: WorkerId,
    /// Runner-up workers, best first
    pub fallbacks: Vec<WorkerId>,
    pub score: f64,
    pub reason: String,
    pub estimated_completion: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Build a decision from a ranking, keeping at most `fallback_count` runners-up
    pub fn from_ranking(
        task_id: Uuid,
        ranking: &[ScoredWorker],
        fallback_count: usize,
    ) -> Option<Self> {
        let (primary, rest) = ranking.split_first()?;
        let now = Utc::now();
        let eta_ms = primary.breakdown.estimated_latency_ms.max(0.0).round() as i64;

        Some(Self {
            task_id,
            worker_id: primary.worker_id.clone(),
            fallbacks: rest
                .iter()
                .take(fallback_count)
                .map(|s| s.worker_id.clone())
                .collect(),
            score: primary.breakdown.total,
            reason: primary.breakdown.reason(),
            estimated_completion: now + chrono::Duration::milliseconds(eta_ms),
            decided_at: now,
        })
    }

    /// Superseding decision that promotes the first fallback accepted by `usable`.
    ///
    /// Fallbacks rejected by `usable` are dropped from the chain.
    pub fn promote_fallback(&self, mut usable: impl FnMut(&str) -> bool) -> Option<Self> {
        let mut remaining = self.fallbacks.iter();
        let next = remaining.by_ref().find(|id| usable(id))?;

        Some(Self {
            task_id: self.task_id,
            worker_id: next.clone(),
            fallbacks: remaining.cloned().collect(),
            score: self.score,
            reason: format!("fallback after failure on {}", self.worker_id),
            estimated_completion: self.estimated_completion,
            decided_at: Utc::now(),
        })
    }
}
