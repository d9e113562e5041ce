//! Task scheduling
//!
//! - [`queue`] - per-task bookkeeping, priority ordering and the terminal archive
//! - [`retry`] - exponential backoff for same-pool requeues
//! - [`dispatcher`] - the [`Federation`] context that routes, dispatches and recovers tasks

pub mod dispatcher;
pub mod queue;
pub mod retry;

pub use dispatcher::{Federation, FederationStats, WorkerStatsView};
pub use queue::{QueueCounts, TaskOutcome, TaskQueue, TaskStatus};
pub use retry::RetryPolicy;
