//! MQTT worker link
//!
//! Workers publish [`WorkerMessage`](crate::protocol::WorkerMessage)s on
//! `{prefix}/workers/{id}/events`; the coordinator publishes assignments and
//! cancellations on `{prefix}/workers/{id}/assignments`.
//!
//! - [`connection`] - options, coordinator presence and reconnection decisions
//! - [`message_handler`] - pure event routing and payload parsing
//! - [`link`] - the supervisor task and [`WorkerLink`](crate::transport::WorkerLink) impl
//!
//! ```rust,no_run
//! use federation_router::config::MqttSection;
//! use federation_router::observability::MetricsCollector;
//! use federation_router::transport::MqttWorkerLink;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     topic_prefix: "/federation".to_string(),
//! };
//! let (inbound_tx, _inbound_rx) = mpsc::channel(256);
//! let metrics = Arc::new(MetricsCollector::new());
//!
//! let link = MqttWorkerLink::connect("fed-1", &config, None, inbound_tx, metrics).await?;
//! link.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod link;
pub mod message_handler;

pub use connection::{
    configure_mqtt_options, ConnectionState, CoordinatorStatus, CoordinatorStatusType, MqttError,
    ReconnectConfig, ReconnectionDecision,
};
pub use link::MqttWorkerLink;
pub use message_handler::{EventRoute, MessageHandler};
