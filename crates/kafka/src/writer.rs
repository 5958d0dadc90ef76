//! Writer abstraction and the rskafka-backed implementation
//!
//! The buffer only ever needs one capability from Kafka: submit a batch of
//! opaque record payloads and learn whether the whole batch was accepted.
//! Keeping that behind a trait lets the test suite drive the buffer with a
//! scriptable mock.

use async_trait::async_trait;
use chrono::Utc;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use rskafka::record::Record;

use crate::error::WriteError;

/// Batch sink for encoded record payloads
///
/// Invoked sequentially from the buffer task. A call may block up to the
/// deadline the buffer wraps around it; on error the whole batch counts as
/// undelivered and will be retried.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Submit a batch atomically
    async fn write(&self, payloads: &[Vec<u8>]) -> Result<(), WriteError>;
}

/// Configuration for the rskafka producer
#[derive(Debug, Clone)]
pub struct KafkaWriterConfig {
    /// Broker host
    pub broker: String,

    /// Broker port
    pub port: u16,

    /// Topic all records are produced to. The bridge is single-topic; the
    /// MQTT topic travels inside the record envelope instead.
    pub topic: String,
}

impl KafkaWriterConfig {
    /// Create a new writer config
    pub fn new(broker: impl Into<String>, port: u16, topic: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port,
            topic: topic.into(),
        }
    }

    fn bootstrap(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

/// Production writer backed by an rskafka partition producer
///
/// All records go to partition 0 of the configured topic, which is what
/// keeps end-to-end ordering intact on the consumer side.
pub struct KafkaWriter {
    partition: PartitionClient,
}

impl KafkaWriter {
    /// Connect to the broker and set up the partition producer
    pub async fn connect(config: KafkaWriterConfig) -> Result<Self, WriteError> {
        let bootstrap = config.bootstrap();

        let client = ClientBuilder::new(vec![bootstrap.clone()])
            .build()
            .await
            .map_err(|e| WriteError::Connect {
                broker: bootstrap.clone(),
                message: e.to_string(),
            })?;

        let partition = client
            .partition_client(&config.topic, 0, UnknownTopicHandling::Retry)
            .await
            .map_err(|e| WriteError::Connect {
                broker: bootstrap.clone(),
                message: e.to_string(),
            })?;

        tracing::debug!(broker = %bootstrap, topic = %config.topic, "kafka producer ready");

        Ok(Self { partition })
    }
}

#[async_trait]
impl Writer for KafkaWriter {
    async fn write(&self, payloads: &[Vec<u8>]) -> Result<(), WriteError> {
        let records = payloads
            .iter()
            .map(|payload| Record {
                key: None,
                value: Some(payload.clone()),
                headers: Default::default(),
                timestamp: Utc::now(),
            })
            .collect();

        self.partition
            .produce(records, Compression::NoCompression)
            .await
            .map(|_| ())
            .map_err(|e| WriteError::Broker(e.to_string()))
    }
}
