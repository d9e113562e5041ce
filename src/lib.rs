//! Federation Router
//!
//! Adaptive task routing and scheduling for a federation of heterogeneous
//! workers.
//!
//! # Overview
//!
//! Workers declare the task types they can execute. The federation scores every
//! eligible worker on capability fit, learned history, cost and live capacity,
//! dispatches to the best one and keeps a short chain of fallbacks for when the
//! primary fails. Outcomes feed a per-(task type, complexity) learning store, so
//! routing improves as the federation observes results.
//!
//! - Protocol messages exchanged with workers
//! - Capability registry and heartbeat-driven worker health
//! - Weighted scoring with learned history
//! - Retry with fallback promotion and exponential backoff
//! - MQTT worker transport with automatic reconnection
//! - Optional JSONL persistence and an HTTP stats server
//!
//! # Quick Start
//!
//! ```rust
//! use federation_router::config::FederationConfig;
//! use federation_router::protocol::{CoordinatorMessage, TaskCompletion, TaskRequest, WorkerMessage};
//! use federation_router::registry::Worker;
//! use federation_router::scheduler::Federation;
//! use federation_router::transport::{ChannelWorkerLink, InboundEvent};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let link = Arc::new(ChannelWorkerLink::new());
//! let mut worker_rx = link.attach("summarizer-1");
//!
//! let federation = Federation::new(FederationConfig::with_id("demo"), link.clone());
//! federation.register_worker(Worker::new("summarizer-1", vec!["summarize".to_string()]))?;
//!
//! let task_id = federation.submit(TaskRequest::new("summarize", json!({"text": "..."})))?;
//! federation.tick().await;
//!
//! // The worker receives the assignment and reports back
//! if let Some(CoordinatorMessage::TaskAssignment(assignment)) = worker_rx.recv().await {
//!     let completed = WorkerMessage::TaskCompleted {
//!         task_id: assignment.task_id,
//!         attempt: assignment.attempt,
//!         result: TaskCompletion {
//!             output: json!({"summary": "..."}),
//!             cost: 0.01,
//!             latency_ms: Some(40),
//!             tokens_used: None,
//!         },
//!     };
//!     federation
//!         .handle_inbound(InboundEvent::new("summarizer-1", completed))
//!         .await;
//! }
//!
//! let result = federation.wait_for_outcome(task_id).await?;
//! assert_eq!(result.worker_id, "summarizer-1");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod learning;
pub mod observability;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod scheduler;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{FederationError, FederationResult};
pub use learning::{LearningRecord, LearningStore};
pub use protocol::*;
pub use registry::{CapabilityRegistry, Worker, WorkerStatus};
pub use routing::{RoutingDecision, RoutingMode, Scorer};
pub use scheduler::{Federation, FederationStats, TaskStatus};
pub use transport::{ChannelWorkerLink, InboundEvent, LinkError, MqttWorkerLink, WorkerLink};
