//! Observability: structured logging, metrics and the stats HTTP server

pub mod logging;
pub mod metrics;
pub mod stats_server;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use stats_server::StatsServer;

// Span macros for structured logging
pub use logging::{task_span, tick_span, worker_span};
