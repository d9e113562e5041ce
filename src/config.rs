//! Configuration system for the federation router
//!
//! A single TOML file drives the coordinator. Every tunable has a default so a
//! file containing only `[federation] id = "..."` is valid. Broker credentials
//! are never stored in the file, only the names of the environment variables
//! that hold them.

use crate::routing::RoutingMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main federation configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FederationConfig {
    pub federation: FederationSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub scoring: ScoringSection,
    #[serde(default)]
    pub learning: LearningSection,
    pub mqtt: Option<MqttSection>,
    pub persistence: Option<PersistenceSection>,
    #[serde(default)]
    pub stats: StatsSection,
}

/// Federation identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FederationSection {
    /// Federation identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Scheduler tick, retry and archive settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum PENDING tasks drained per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Runner-up workers kept on each routing decision
    #[serde(default = "default_fallback_count")]
    pub fallback_count: usize,
    /// Terminal tasks kept queryable before the oldest are evicted
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
}

fn default_tick_interval_ms() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    32
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    crate::protocol::DEFAULT_MAX_RETRIES
}

fn default_fallback_count() -> usize {
    2
}

fn default_archive_capacity() -> usize {
    10_000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            batch_size: default_batch_size(),
            task_timeout_secs: default_task_timeout_secs(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            default_max_retries: default_max_retries(),
            fallback_count: default_fallback_count(),
            archive_capacity: default_archive_capacity(),
        }
    }
}

impl SchedulerSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Worker liveness thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Health timeout is this many heartbeat intervals
    #[serde(default = "default_offline_multiplier")]
    pub offline_multiplier: u32,
    /// Consecutive failures before a worker is degraded
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Heartbeat health score (0-100) below which a worker is degraded
    #[serde(default = "default_degraded_health_score")]
    pub degraded_health_score: f64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_offline_multiplier() -> u32 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_degraded_health_score() -> f64 {
    50.0
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            offline_multiplier: default_offline_multiplier(),
            failure_threshold: default_failure_threshold(),
            degraded_health_score: default_degraded_health_score(),
        }
    }
}

impl HealthSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.offline_multiplier
    }
}

/// Scorer weighting mode and defaults for tasks without a budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringSection {
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default = "default_cost_budget")]
    pub default_cost_budget: f64,
    #[serde(default = "default_latency_ms")]
    pub default_latency_ms: u64,
}

fn default_cost_budget() -> f64 {
    1.0
}

fn default_latency_ms() -> u64 {
    5000
}

impl Default for ScoringSection {
    fn default() -> Self {
        Self {
            mode: RoutingMode::default(),
            default_cost_budget: default_cost_budget(),
            default_latency_ms: default_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningSection {
    /// Sample count at which bucket confidence reaches 1.0
    #[serde(default = "default_confidence_samples")]
    pub confidence_samples: u64,
}

fn default_confidence_samples() -> u64 {
    100
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            confidence_samples: default_confidence_samples(),
        }
    }
}

/// MQTT transport for worker traffic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "/federation".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceSection {
    /// Directory holding `tasks.jsonl` and `learning.jsonl`
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSection {
    #[serde(default = "default_stats_port")]
    pub port: u16,
}

fn default_stats_port() -> u16 {
    8080
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            port: default_stats_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid federation ID format: {0}")]
    InvalidFederationId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

const MAX_FALLBACK_COUNT: usize = 8;

impl FederationConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FederationConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_federation_id(&self.federation.id)?;

        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduler.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduler.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.scheduler.fallback_count > MAX_FALLBACK_COUNT {
            return Err(ConfigError::InvalidConfig(format!(
                "scheduler.fallback_count {} exceeds maximum {MAX_FALLBACK_COUNT}",
                self.scheduler.fallback_count
            )));
        }
        if self.scheduler.base_backoff_ms > self.scheduler.max_backoff_ms {
            return Err(ConfigError::InvalidConfig(
                "scheduler.base_backoff_ms must not exceed scheduler.max_backoff_ms".to_string(),
            ));
        }
        if self.health.offline_multiplier < 2 {
            return Err(ConfigError::InvalidConfig(
                "health.offline_multiplier must be at least 2".to_string(),
            ));
        }
        if self.health.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "health.heartbeat_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.learning.confidence_samples < 2 {
            return Err(ConfigError::InvalidConfig(
                "learning.confidence_samples must be at least 2".to_string(),
            ));
        }
        if self.scoring.default_cost_budget <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "scoring.default_cost_budget must be positive".to_string(),
            ));
        }
        if let Some(mqtt) = &self.mqtt {
            validate_broker_url(&mqtt.broker_url)?;
        }

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from its environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        self.mqtt
            .as_ref()
            .and_then(|mqtt| Self::get_env_var_optional(mqtt.username_env.as_ref()))
    }

    /// Get MQTT password from its environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        self.mqtt
            .as_ref()
            .and_then(|mqtt| Self::get_env_var_optional(mqtt.password_env.as_ref()))
    }

    /// Credentials are all-or-nothing: a named variable that is unset is an error
    pub fn mqtt_credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        let Some(mqtt) = &self.mqtt else {
            return Ok(None);
        };
        match (&mqtt.username_env, &mqtt.password_env) {
            (Some(user_env), Some(pass_env)) => {
                let username = std::env::var(user_env)
                    .map_err(|_| ConfigError::EnvVarNotFound(user_env.clone()))?;
                let password = std::env::var(pass_env)
                    .map_err(|_| ConfigError::EnvVarNotFound(pass_env.clone()))?;
                Ok(Some((username, password)))
            }
            _ => Ok(None),
        }
    }

    /// Minimal configuration with every default applied
    pub fn with_id(id: &str) -> Self {
        Self {
            federation: FederationSection {
                id: id.to_string(),
                description: None,
            },
            scheduler: SchedulerSection::default(),
            health: HealthSection::default(),
            scoring: ScoringSection::default(),
            learning: LearningSection::default(),
            mqtt: None,
            persistence: None,
            stats: StatsSection::default(),
        }
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[federation]
id = "test-federation"
description = "A test federation"

[scheduler]
tick_interval_ms = 100
task_timeout_secs = 10

[health]
heartbeat_interval_secs = 5

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Federation ids share the worker id character rule
fn validate_federation_id(id: &str) -> Result<(), ConfigError> {
    crate::protocol::validate_worker_id(id).map_err(|_| {
        ConfigError::InvalidFederationId(format!(
            "Federation ID '{id}' must match pattern [a-zA-Z0-9._-]+"
        ))
    })
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("Invalid broker URL: {e}")))?;
    match url.scheme() {
        "mqtt" | "mqtts" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "Unsupported broker URL scheme '{other}', expected mqtt or mqtts"
        ))),
    }
}
