// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! Loaded once at startup from YAML and validated before anything connects.
//!
//! ```yaml
//! broker:
//!   host: "192.168.15.6"
//!   port: 1883
//! influxdb:
//!   url: "http://localhost:8086"
//!   org: "globalsolution"
//!   bucket: "iot"
//!   token: "my-secret-token"
//! topics:
//!   - topic: "/energy"
//!     measurements: ["energy"]
//!     extractor: { kind: scalar, number: integer }
//! ```

use crate::topic::TopicFilter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `influxdb.token`.
pub const TOKEN_ENV_VAR: &str = "INFLUXDB_TOKEN";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// MQTT broker connection.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Reconnection policy for the broker connection.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// InfluxDB v2 connection.
    pub influxdb: InfluxDbConfig,

    /// Topic decoding rules.
    pub topics: Vec<TopicRuleConfig>,

    /// Write buffer settings.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Store write retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Where undeliverable points go.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Upper bound for a graceful shutdown (milliseconds).
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Statistics reporting interval (seconds, 0 to disable).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_stats_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// MQTT keep-alive interval (seconds, 0 disables pings).
    pub keep_alive_secs: u16,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Subscription QoS (0 or 1).
    pub qos: u8,
    pub clean_session: bool,
    pub connect_timeout_ms: u64,
    /// Largest accepted MQTT packet (bytes).
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 60,
            client_id: "telemetry-bridge".to_string(),
            username: None,
            password: None,
            qos: 1,
            clean_session: true,
            connect_timeout_ms: 10_000,
            max_packet_size: 256 * 1024,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Broker reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed connection attempts before giving up (0 = never).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: 10,
        }
    }
}

/// InfluxDB v2 connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDbConfig {
    /// InfluxDB URL (e.g., "http://localhost:8086").
    pub url: String,
    /// InfluxDB organization.
    pub org: String,
    /// InfluxDB bucket.
    pub bucket: String,
    /// Authentication token (overridden by `INFLUXDB_TOKEN` when set).
    #[serde(default)]
    pub token: String,
    /// HTTP request timeout (milliseconds).
    #[serde(default = "default_influx_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_influx_timeout_ms() -> u64 {
    10_000
}

/// One topic decoding rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRuleConfig {
    /// Topic or MQTT filter (`+`, `#`) to subscribe to.
    pub topic: String,
    /// Measurements written for every message on this topic.
    pub measurements: Vec<MeasurementConfig>,
    /// How the payload becomes fields.
    #[serde(default)]
    pub extractor: ExtractorConfig,
    /// Tag name receiving the concrete topic of each message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_tag: Option<String>,
}

/// Measurement template: a name plus static tags.
///
/// Accepts either a bare name or `{ name, tags }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MeasurementRepr")]
pub struct MeasurementConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl MeasurementConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MeasurementRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
}

impl From<MeasurementRepr> for MeasurementConfig {
    fn from(repr: MeasurementRepr) -> Self {
        match repr {
            MeasurementRepr::Name(name) => Self::named(name),
            MeasurementRepr::Full { name, tags } => Self { name, tags },
        }
    }
}

/// Payload-to-fields extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    /// The whole payload is one number.
    Scalar {
        #[serde(default = "default_scalar_field")]
        field: String,
        #[serde(default)]
        number: NumberKind,
    },
    /// The payload is a JSON object; dotted paths select values.
    Json {
        fields: Vec<String>,
        #[serde(default)]
        tags: Vec<String>,
    },
}

fn default_scalar_field() -> String {
    "value".to_string()
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig::Scalar {
            field: default_scalar_field(),
            number: NumberKind::default(),
        }
    }
}

/// How a scalar payload is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberKind {
    /// Must parse as a signed integer.
    Integer,
    /// Always stored as float.
    Float,
    /// Integer if it parses as one, float otherwise.
    #[default]
    Auto,
}

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait up to `enqueue_timeout_ms` for a slot.
    #[default]
    #[serde(alias = "backpressure")]
    Block,
    /// Evict the oldest queued point.
    DropOldest,
}

/// Write buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_interval_ms: u64,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub enqueue_timeout_ms: u64,
    /// Continuous overflow longer than this is fatal (`block` policy only).
    pub fatal_overflow_after_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_batch_interval_ms: 1000,
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::Block,
            enqueue_timeout_ms: 1000,
            fatal_overflow_after_ms: 60_000,
        }
    }
}

impl BatchConfig {
    pub fn max_batch_interval(&self) -> Duration {
        Duration::from_millis(self.max_batch_interval_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn fatal_overflow_after(&self) -> Duration {
        Duration::from_millis(self.fatal_overflow_after_ms)
    }
}

/// Store write retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per batch, including the first one.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Dead-letter sink target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Append-only JSON lines file.
    pub path: PathBuf,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dead-letter.jsonl"),
        }
    }
}

impl BridgeConfig {
    /// Parse configuration from a YAML string.
    ///
    /// Applies the token environment override and validates.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: BridgeConfig = serde_yaml::from_str(yaml)?;
        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.is_empty() {
                config.influxdb.token = token;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be non-zero".into()));
        }
        if self.broker.client_id.is_empty() && !self.broker.clean_session {
            return Err(ConfigError::Invalid(
                "broker.client_id may only be empty with clean_session".into(),
            ));
        }
        if self.broker.qos > 1 {
            return Err(ConfigError::Invalid(format!(
                "broker.qos {} not supported (0 or 1)",
                self.broker.qos
            )));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(ConfigError::Invalid(
                "broker.password requires broker.username".into(),
            ));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "reconnect.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }

        if !(self.influxdb.url.starts_with("http://") || self.influxdb.url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "influxdb.url '{}' must start with http:// or https://",
                self.influxdb.url
            )));
        }
        if self.influxdb.org.is_empty() || self.influxdb.bucket.is_empty() {
            return Err(ConfigError::Invalid(
                "influxdb.org and influxdb.bucket are required".into(),
            ));
        }

        if self.topics.is_empty() {
            return Err(ConfigError::Invalid("No topics configured".into()));
        }
        let mut seen = HashSet::new();
        for (i, rule) in self.topics.iter().enumerate() {
            TopicFilter::new(&rule.topic).map_err(|e| {
                ConfigError::Invalid(format!("Topic rule {}: {}", i, e))
            })?;
            if !seen.insert(rule.topic.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Topic '{}' configured more than once",
                    rule.topic
                )));
            }
            if rule.measurements.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Topic '{}' has no measurements",
                    rule.topic
                )));
            }
            if rule.measurements.iter().any(|m| m.name.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "Topic '{}' has an empty measurement name",
                    rule.topic
                )));
            }
            if matches!(rule.topic_tag.as_deref(), Some("")) {
                return Err(ConfigError::Invalid(format!(
                    "Topic '{}' has an empty topic_tag",
                    rule.topic
                )));
            }
            match &rule.extractor {
                ExtractorConfig::Scalar { field, .. } if field.is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "Topic '{}' has an empty scalar field name",
                        rule.topic
                    )));
                }
                ExtractorConfig::Json { fields, .. } if fields.is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "Topic '{}' json extractor has no fields",
                        rule.topic
                    )));
                }
                _ => {}
            }
        }

        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::Invalid("batch.max_batch_size must be > 0".into()));
        }
        if self.batch.max_batch_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "batch.max_batch_interval_ms must be > 0".into(),
            ));
        }
        if self.batch.queue_capacity == 0 {
            return Err(ConfigError::Invalid("batch.queue_capacity must be > 0".into()));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.base_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }

        if self.dead_letter.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("dead_letter.path is empty".into()));
        }

        Ok(())
    }

    /// Example configuration matching a three-topic energy deployment.
    pub fn example() -> Self {
        let rule = |topic: &str, measurement: &str| TopicRuleConfig {
            topic: topic.to_string(),
            measurements: vec![MeasurementConfig::named(measurement)],
            extractor: ExtractorConfig::Scalar {
                field: default_scalar_field(),
                number: NumberKind::Integer,
            },
            topic_tag: None,
        };

        Self {
            broker: BrokerConfig {
                host: "192.168.15.6".to_string(),
                ..Default::default()
            },
            reconnect: ReconnectConfig::default(),
            influxdb: InfluxDbConfig {
                url: "http://localhost:8086".to_string(),
                org: "globalsolution".to_string(),
                bucket: "iot".to_string(),
                token: String::new(),
                timeout_ms: default_influx_timeout_ms(),
            },
            topics: vec![
                rule("/energy", "energy"),
                rule("/vazao", "vazao"),
                rule("/price", "price"),
            ],
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            stats_interval_secs: default_stats_interval(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
influxdb:
  url: "http://localhost:8086"
  org: "myorg"
  bucket: "mybucket"
  token: "mytoken"
topics:
  - topic: "/energy"
    measurements: ["energy"]
"#;

    const FULL_YAML: &str = r#"
broker:
  host: "broker.example.com"
  port: 8883
  keep_alive_secs: 30
  client_id: "bridge-1"
  username: "bridge"
  password: "secret"
  qos: 0
reconnect:
  initial_backoff_ms: 100
  max_backoff_ms: 5000
  max_attempts: 0
influxdb:
  url: "http://influx.example.com:8086"
  org: "example-org"
  bucket: "telemetry"
  token: "test-token-placeholder"
topics:
  - topic: "/energy"
    measurements:
      - energy
      - name: vazao
        tags:
          source: energy
    extractor:
      kind: scalar
      number: integer
  - topic: "sensors/+/climate"
    measurements: ["climate"]
    topic_tag: topic
    extractor:
      kind: json
      fields: ["temperature", "humidity"]
      tags: ["sensor_id"]
batch:
  max_batch_size: 500
  max_batch_interval_ms: 2000
  queue_capacity: 100
  overflow_policy: drop_oldest
retry:
  max_attempts: 3
  base_backoff_ms: 50
  max_backoff_ms: 400
dead_letter:
  path: "/var/lib/bridge/dead.jsonl"
shutdown_timeout_ms: 2000
"#;

    #[test]
    fn test_config_parse_minimal() {
        let config = BridgeConfig::from_yaml(MINIMAL_YAML).expect("parse minimal yaml");

        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.influxdb.org, "myorg");
        assert_eq!(config.topics.len(), 1);
        assert_eq!(config.topics[0].measurements, vec![MeasurementConfig::named("energy")]);
        assert_eq!(config.topics[0].extractor, ExtractorConfig::default());
        assert_eq!(config.batch.max_batch_size, 1000);
        assert_eq!(config.batch.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_parse_all_fields() {
        let config = BridgeConfig::from_yaml(FULL_YAML).expect("parse full yaml");

        assert_eq!(config.broker.host, "broker.example.com");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.qos, 0);
        assert_eq!(config.broker.username.as_deref(), Some("bridge"));
        assert_eq!(config.reconnect.max_attempts, 0);

        let energy = &config.topics[0];
        assert_eq!(energy.measurements.len(), 2);
        assert_eq!(energy.measurements[1].name, "vazao");
        assert_eq!(
            energy.measurements[1].tags.get("source").map(String::as_str),
            Some("energy")
        );
        assert_eq!(
            energy.extractor,
            ExtractorConfig::Scalar {
                field: "value".into(),
                number: NumberKind::Integer
            }
        );

        let climate = &config.topics[1];
        assert_eq!(climate.topic_tag.as_deref(), Some("topic"));
        match &climate.extractor {
            ExtractorConfig::Json { fields, tags } => {
                assert_eq!(fields, &vec!["temperature".to_string(), "humidity".to_string()]);
                assert_eq!(tags, &vec!["sensor_id".to_string()]);
            }
            other => panic!("expected json extractor, got {:?}", other),
        }

        assert_eq!(config.batch.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.batch.queue_capacity, 100);
        assert_eq!(config.retry.max_backoff_ms, 400);
        assert_eq!(
            config.dead_letter.path,
            PathBuf::from("/var/lib/bridge/dead.jsonl")
        );
    }

    #[test]
    fn test_config_rejects_no_topics() {
        let yaml = r#"
influxdb: { url: "http://x:8086", org: "o", bucket: "b" }
topics: []
"#;
        let err = BridgeConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("No topics"));
    }

    #[test]
    fn test_config_rejects_bad_filter() {
        let yaml = r#"
influxdb: { url: "http://x:8086", org: "o", bucket: "b" }
topics:
  - topic: "a/#/b"
    measurements: ["m"]
"#;
        assert!(matches!(
            BridgeConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_config_rejects_duplicate_topic() {
        let yaml = r#"
influxdb: { url: "http://x:8086", org: "o", bucket: "b" }
topics:
  - { topic: "/energy", measurements: ["a"] }
  - { topic: "/energy", measurements: ["b"] }
"#;
        let err = BridgeConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_config_rejects_bad_url_and_qos() {
        let mut config = BridgeConfig::example();
        config.influxdb.url = "localhost:8086".into();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::example();
        config.broker.qos = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_is_valid_and_roundtrips() {
        let config = BridgeConfig::example();
        config.validate().expect("example valid");
        assert_eq!(config.topics.len(), 3);

        let yaml = serde_yaml::to_string(&config).expect("serialize");
        let parsed: BridgeConfig = serde_yaml::from_str(&yaml).expect("reparse");
        assert_eq!(parsed.topics[1].topic, "/vazao");
        assert_eq!(parsed.topics[2].measurements[0].name, "price");
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.yaml");
        std::fs::write(&path, MINIMAL_YAML).expect("write");
        let config = BridgeConfig::from_file(&path).expect("load");
        assert_eq!(config.topics[0].topic, "/energy");

        let missing = BridgeConfig::from_file(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
