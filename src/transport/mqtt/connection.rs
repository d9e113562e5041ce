//! Pure connection state management for the MQTT worker link
//!
//! Configuration, coordinator status payloads and reconnection decisions live
//! here so they can be tested without a broker.

use crate::config::MqttSection;
use crate::protocol::WorkerTopics;
use chrono::{DateTime, Utc};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for the MQTT link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, indexed by attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Total time spent sleeping across all attempts, None when unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Decide whether the supervisor should try to reconnect
    pub fn decide(&self, current_attempts: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = self.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts };
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: self.calculate_backoff_delay(attempt),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded { max_attempts: u32 },
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStatusType {
    Online,
    Offline,
}

/// Retained presence message on `{prefix}/coordinator/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub federation_id: String,
    pub status: CoordinatorStatusType,
    pub timestamp: DateTime<Utc>,
}

impl CoordinatorStatus {
    pub fn new(federation_id: &str, status: CoordinatorStatusType) -> Self {
        Self {
            federation_id: federation_id.to_string(),
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Build MQTT options for the coordinator, including the offline last will
pub fn configure_mqtt_options(
    federation_id: &str,
    config: &MqttSection,
    credentials: Option<&(String, String)>,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique per attempt so a stale session never collides with a reconnect
    let client_id = format!(
        "federation-{federation_id}-{}",
        Utc::now().timestamp_millis()
    );
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = credentials {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    let topics = WorkerTopics::new(&config.topic_prefix);
    let offline = CoordinatorStatus::new(federation_id, CoordinatorStatusType::Offline);
    let lwt_payload = serde_json::to_string(&offline).map_err(MqttError::SerializationError)?;
    let lwt = LastWill::new(
        topics.coordinator_status(),
        lwt_payload,
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            topic_prefix: "/federation".to_string(),
        }
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(2), 50);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(5), 250);
        assert_eq!(config.calculate_backoff_delay(100), 250);
        assert_eq!(config.calculate_max_total_time(), None);
    }

    #[test]
    fn test_calculate_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![10, 20],
            sustained_delay: 50,
        };
        assert_eq!(config.calculate_max_total_time(), Some(80));
    }

    #[test]
    fn test_reconnection_decision() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        };

        assert_eq!(
            config.decide(0, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );
        assert_eq!(
            config.decide(2, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts: 2 }
        );
        assert_eq!(
            config.decide(0, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_unlimited_reconnection_never_aborts() {
        let config = ReconnectConfig::default();
        assert!(matches!(
            config.decide(10_000, false),
            ReconnectionDecision::Proceed { attempt: 10_001, .. }
        ));
    }

    #[test]
    fn test_connection_state_can_publish() {
        assert!(ConnectionState::Connected.can_publish());
        assert!(!ConnectionState::Connecting.can_publish());
        assert!(!ConnectionState::Reconnecting(3).can_publish());
        assert!(!ConnectionState::Disconnected("gone".into()).can_publish());
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_mqtt_config();
        let credentials = ("user".to_string(), "secret".to_string());
        assert!(configure_mqtt_options("fed-1", &config, None).is_ok());
        assert!(configure_mqtt_options("fed-1", &config, Some(&credentials)).is_ok());
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();

        let result = configure_mqtt_options("fed-1", &config, None);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_coordinator_status_serialization() {
        let status = CoordinatorStatus::new("fed-1", CoordinatorStatusType::Offline);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["federation_id"], "fed-1");
        assert_eq!(json["status"], "offline");
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected("test".to_string()),
            },
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
