//! Routing infrastructure
//!
//! ## Scoring (scorer.rs)
//!
//! The `Scorer` ranks eligible workers for a task from capability fit,
//! learned history, cost against budget and live load.
//!
//! ## Decisions (decision.rs)
//!
//! A `RoutingDecision` records the selected worker and a bounded chain of
//! runner-up workers consulted when the primary assignment fails.

pub mod decision;
pub mod scorer;

pub use decision::RoutingDecision;
pub use scorer::{RoutingMode, ScoreBreakdown, ScoreWeights, ScoredWorker, Scorer};
