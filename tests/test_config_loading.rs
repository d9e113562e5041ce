//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use federation_router::config::{ConfigError, FederationConfig};
use federation_router::routing::RoutingMode;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn load(content: &str) -> Result<FederationConfig, ConfigError> {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    FederationConfig::load_from_file(temp_file.path())
}

#[test]
fn test_config_loads_with_defaults_from_minimal_file() {
    let config = load(
        r#"
[federation]
id = "fleet-1"
"#,
    )
    .unwrap();

    assert_eq!(config.federation.id, "fleet-1");
    assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(2));
    assert_eq!(config.scheduler.task_timeout(), Duration::from_secs(300));
    assert_eq!(config.scheduler.base_backoff_ms, 500);
    assert_eq!(config.scheduler.max_backoff_ms, 60_000);
    assert_eq!(config.scheduler.default_max_retries, 3);
    assert_eq!(config.health.health_timeout(), Duration::from_secs(150));
    assert_eq!(config.health.failure_threshold, 3);
    assert_eq!(config.scoring.mode, RoutingMode::Federation);
    assert_eq!(config.scoring.default_cost_budget, 1.0);
    assert!(config.mqtt.is_none());
}

#[test]
fn test_config_loads_every_section() {
    let config = load(
        r#"
[federation]
id = "fleet-1"
description = "Summarization fleet"

[scheduler]
tick_interval_ms = 500
batch_size = 8
task_timeout_secs = 60
base_backoff_ms = 250
max_backoff_ms = 5000
default_max_retries = 5
fallback_count = 3

[health]
heartbeat_interval_secs = 10
offline_multiplier = 3
failure_threshold = 4
degraded_health_score = 40.0

[scoring]
mode = "agent"
default_cost_budget = 0.5
default_latency_ms = 2000

[learning]
confidence_samples = 50

[mqtt]
broker_url = "mqtts://broker.example.com:8883"
topic_prefix = "/fleet"

[persistence]
directory = "/var/lib/federation"

[stats]
port = 9090
"#,
    )
    .unwrap();

    assert_eq!(config.federation.description.as_deref(), Some("Summarization fleet"));
    assert_eq!(config.scheduler.batch_size, 8);
    assert_eq!(config.scheduler.fallback_count, 3);
    assert_eq!(config.health.health_timeout(), Duration::from_secs(30));
    assert_eq!(config.health.degraded_health_score, 40.0);
    assert_eq!(config.scoring.mode, RoutingMode::Agent);
    assert_eq!(config.learning.confidence_samples, 50);

    let mqtt = config.mqtt.as_ref().unwrap();
    assert_eq!(mqtt.broker_url, "mqtts://broker.example.com:8883");
    assert_eq!(mqtt.topic_prefix, "/fleet");
    assert_eq!(
        config.persistence.as_ref().unwrap().directory,
        Path::new("/var/lib/federation")
    );
    assert_eq!(config.stats.port, 9090);
}

#[test]
fn test_config_returns_error_when_federation_section_missing() {
    let result = load(
        r#"
[scheduler]
tick_interval_ms = 500
"#,
    );
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_invalid_federation_id() {
    for id in ["", "has space", "slash/not/allowed"] {
        let result = load(&format!("[federation]\nid = \"{id}\"\n"));
        assert!(
            matches!(result, Err(ConfigError::InvalidFederationId(_))),
            "id {id:?} should be rejected"
        );
    }
}

#[test]
fn test_config_accepts_id_with_allowed_chars() {
    let config = load("[federation]\nid = \"fleet_1.prod-eu\"\n").unwrap();
    assert_eq!(config.federation.id, "fleet_1.prod-eu");
}

#[test]
fn test_config_returns_error_for_bad_broker_url() {
    for url in ["not a url", "http://localhost:1883"] {
        let result = load(&format!(
            "[federation]\nid = \"f1\"\n\n[mqtt]\nbroker_url = \"{url}\"\n"
        ));
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "broker url {url:?} should be rejected"
        );
    }
}

#[test]
fn test_config_rejects_out_of_range_values() {
    let cases = [
        ("[health]\noffline_multiplier = 1", "offline_multiplier"),
        ("[scheduler]\nfallback_count = 9", "fallback_count"),
        ("[learning]\nconfidence_samples = 1", "confidence_samples"),
        ("[scheduler]\nbatch_size = 0", "batch_size"),
        (
            "[scheduler]\nbase_backoff_ms = 2000\nmax_backoff_ms = 1000",
            "base_backoff_ms",
        ),
    ];

    for (section, field) in cases {
        let result = load(&format!("[federation]\nid = \"f1\"\n\n{section}\n"));
        match result {
            Err(ConfigError::InvalidConfig(message)) => {
                assert!(message.contains(field), "{message} should mention {field}")
            }
            other => panic!("Expected InvalidConfig for {field}, got {other:?}"),
        }
    }
}

#[test]
fn test_config_returns_error_for_invalid_toml_syntax() {
    let result = load("[federation\nid = ");
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_when_file_not_found() {
    let result = FederationConfig::load_from_file(Path::new("/nonexistent/federation.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_mqtt_credentials_read_from_environment() {
    unsafe {
        std::env::set_var("FEDERATION_LOADING_TEST_USER", "router");
        std::env::set_var("FEDERATION_LOADING_TEST_PASS", "hunter2");
    }

    let config = load(
        r#"
[federation]
id = "f1"

[mqtt]
broker_url = "mqtt://localhost:1883"
username_env = "FEDERATION_LOADING_TEST_USER"
password_env = "FEDERATION_LOADING_TEST_PASS"
"#,
    )
    .unwrap();

    assert_eq!(
        config.mqtt_credentials().unwrap(),
        Some(("router".to_string(), "hunter2".to_string()))
    );
    assert_eq!(config.get_mqtt_username(), Some("router".to_string()));

    unsafe {
        std::env::remove_var("FEDERATION_LOADING_TEST_USER");
        std::env::remove_var("FEDERATION_LOADING_TEST_PASS");
    }
}

#[test]
fn test_mqtt_credentials_error_when_named_variable_unset() {
    let config = load(
        r#"
[federation]
id = "f1"

[mqtt]
broker_url = "mqtt://localhost:1883"
username_env = "FEDERATION_LOADING_UNSET_USER"
password_env = "FEDERATION_LOADING_UNSET_PASS"
"#,
    )
    .unwrap();

    assert!(matches!(
        config.mqtt_credentials(),
        Err(ConfigError::EnvVarNotFound(name)) if name == "FEDERATION_LOADING_UNSET_USER"
    ));
}

#[test]
fn test_mqtt_credentials_absent_without_env_names() {
    let config = load(
        r#"
[federation]
id = "f1"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    )
    .unwrap();

    assert_eq!(config.mqtt_credentials().unwrap(), None);
    assert!(config.get_mqtt_password().is_none());
}
