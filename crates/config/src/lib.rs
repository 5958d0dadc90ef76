//! Metamorphosis Configuration
//!
//! TOML-based configuration loading with sensible defaults. A minimal
//! config only names the two brokers; everything else has a default.
//!
//! # Example
//!
//! ```toml
//! [mqtt]
//! broker = "mqtt.internal"
//! topic = "sensors/#"
//!
//! [kafka]
//! broker = "kafka.internal"
//! topic = "mqtt"
//!
//! [buffer]
//! batch_size = 100
//! max_batch_size = 1000
//! failure_retry_interval = "10s"
//! ```

mod error;

pub use error::{ConfigError, Result};

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Main configuration structure
///
/// All sections are optional with sensible defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,

    /// MQTT broker and subscription
    pub mqtt: MqttConfig,

    /// Kafka broker and topic
    pub kafka: KafkaConfig,

    /// Egress buffer tuning
    pub buffer: BufferConfig,

    /// Status endpoint
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&contents)
    }

    fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    fn validate(&self) -> Result<()> {
        if self.mqtt.topic.is_empty() {
            return Err(ConfigError::invalid_value(
                "mqtt",
                "topic",
                "must not be empty",
            ));
        }
        if self.kafka.topic.is_empty() {
            return Err(ConfigError::invalid_value(
                "kafka",
                "topic",
                "must not be empty",
            ));
        }
        if self.buffer.batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "buffer",
                "batch_size",
                "must be at least 1",
            ));
        }
        if self.buffer.max_batch_size < self.buffer.batch_size {
            return Err(ConfigError::invalid_value(
                "buffer",
                "max_batch_size",
                "must be at least batch_size",
            ));
        }
        if self.mqtt.connection_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "mqtt",
                "connection_attempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// MQTT broker and subscription settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host
    pub broker: String,

    /// Broker port
    pub port: u16,

    /// Topic filter to subscribe to
    pub topic: String,

    /// Client identifier
    pub client_id: String,

    /// Maximum startup connection attempts
    pub connection_attempts: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            topic: "#".to_string(),
            client_id: "metamorphosis".to_string(),
            connection_attempts: 10,
        }
    }
}

/// Kafka broker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Broker host
    pub broker: String,

    /// Broker port
    pub port: u16,

    /// Topic all records are produced to
    pub topic: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 9092,
            topic: "mqtt".to_string(),
        }
    }
}

/// Egress buffer tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Max latency between message arrival and a flush attempt
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Pacing between write attempts while the broker is down
    #[serde(with = "humantime_serde")]
    pub failure_retry_interval: Duration,

    /// Soft batch target
    pub batch_size: usize,

    /// Hard cap per submitted batch
    pub max_batch_size: usize,

    /// Per-write deadline
    #[serde(with = "humantime_serde")]
    pub kafka_timeout: Duration,

    /// Topic placed inside liveness probe records
    pub test_message_topic: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2),
            failure_retry_interval: Duration::from_secs(10),
            batch_size: 100,
            max_batch_size: 1000,
            kafka_timeout: Duration::from_secs(30),
            test_message_topic: "test".to_string(),
        }
    }
}

/// Status endpoint settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Port the health/status endpoint binds on
    pub health_port: u16,

    /// Capacity of the observability event channel
    pub channel_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            health_port: 8080,
            channel_capacity: 1024,
        }
    }
}
