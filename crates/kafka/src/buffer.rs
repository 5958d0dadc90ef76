//! Kafka egress buffer
//!
//! Single-task batching engine between the ingress channel and the writer.
//!
//! # Design
//!
//! The buffer owns the spool exclusively and multiplexes four event sources
//! with `tokio::select!`: cancellation, ingress, the failure-retry timer and
//! a short flush tick. There are no locks; the writer is the only await
//! point besides the multiplex itself.
//!
//! Two states drive the loop:
//!
//! - **alive** - writes are attempted; messages batch up to `max_batch_size`
//!   per submission, triggered by spool size or by the flush tick.
//! - **down** - a write failed; ingress is diverted into the spool and the
//!   only write attempts are despools, paced by `failure_retry_interval`.
//!
//! A failed batch is returned to the *head* of the spool, in front of
//! anything that arrived while the write was in flight. That single rule is
//! what makes recovery order-preserving and despool resumable.
//!
//! A synthetic probe record is written once at startup; failure there is
//! fatal. After startup the spool is never empty while down (the failed
//! batch is back at the head), so the first despool chunk doubles as the
//! liveness check and no further probe records reach the wire.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;

use metamorphosis_observability::{Event, EventSender};
use metamorphosis_protocol::Message;

use crate::error::{BufferError, WriteError};
use crate::writer::Writer;

#[cfg(test)]
#[path = "buffer_test.rs"]
mod buffer_test;

/// Payload of the startup probe record. Consumers filter probes by topic,
/// not by content.
const PROBE_PAYLOAD: &[u8] = b"probe";

/// Default flush tick
const DEFAULT_INTERVAL: Duration = Duration::from_millis(2);

/// Default pacing between write attempts while down
const DEFAULT_FAILURE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Default soft batch target
const DEFAULT_BATCH_SIZE: usize = 100;

/// Default hard cap per submitted batch
const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Default per-write deadline
const DEFAULT_KAFKA_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the egress buffer
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Max latency between a message arriving and a flush attempt under
    /// normal load
    pub interval: Duration,

    /// Pacing between write attempts while the writer is down
    pub failure_retry_interval: Duration,

    /// Soft target; reaching it triggers a flush
    pub batch_size: usize,

    /// Hard cap per submitted batch; bigger spools drain across writes
    pub max_batch_size: usize,

    /// Per-write deadline handed to the writer call
    pub kafka_timeout: Duration,

    /// Kafka topic all records are produced to
    pub topic: String,

    /// Topic placed inside probe records (the Kafka topic is still `topic`)
    pub test_message_topic: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            failure_retry_interval: DEFAULT_FAILURE_RETRY_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            kafka_timeout: DEFAULT_KAFKA_TIMEOUT,
            topic: "mqtt".to_string(),
            test_message_topic: "test".to_string(),
        }
    }
}

impl BufferConfig {
    /// Set the flush tick interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the retry pacing used while down
    #[must_use]
    pub fn with_failure_retry_interval(mut self, interval: Duration) -> Self {
        self.failure_retry_interval = interval;
        self
    }

    /// Set the soft batch target
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the hard batch cap
    #[must_use]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Set the per-write deadline
    #[must_use]
    pub fn with_kafka_timeout(mut self, timeout: Duration) -> Self {
        self.kafka_timeout = timeout;
        self
    }

    /// Set the Kafka topic
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the topic placed inside probe records
    #[must_use]
    pub fn with_test_message_topic(mut self, topic: impl Into<String>) -> Self {
        self.test_message_topic = topic.into();
        self
    }
}

/// Lock-free counters for the buffer
#[derive(Debug, Default)]
struct BufferMetrics {
    /// Successful writer submissions (probe included)
    writes: AtomicU64,

    /// Records acknowledged by the writer
    msgs: AtomicU64,

    /// Failed write attempts
    failures: AtomicU64,
}

impl BufferMetrics {
    fn record_write(&self, batch: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.msgs.fetch_add(batch, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            msgs: self.msgs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of the buffer counters
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferSnapshot {
    pub writes: u64,
    pub msgs: u64,
    pub failures: u64,
}

/// Handle for reading buffer counters
///
/// Remains valid after `run()` consumes the buffer.
#[derive(Clone)]
pub struct BufferMetricsHandle {
    metrics: Arc<BufferMetrics>,
}

impl BufferMetricsHandle {
    /// Snapshot the counters
    pub fn snapshot(&self) -> BufferSnapshot {
        self.metrics.snapshot()
    }
}

/// The egress buffer engine
pub struct EgressBuffer<W> {
    /// Ingress channel from the MQTT side
    receiver: mpsc::Receiver<Message>,

    /// Batch sink towards Kafka
    writer: W,

    /// Configuration
    config: BufferConfig,

    /// Messages awaiting delivery, oldest at the head
    spool: VecDeque<Message>,

    /// Whether the writer is believed healthy
    alive: bool,

    /// Time of the last failed write attempt; paces retries while down
    last_attempt: Instant,

    /// Set during the final drain so write attempts are bounded by the
    /// deadline alone instead of aborting on the already-fired cancel signal
    draining: bool,

    /// Counters
    metrics: Arc<BufferMetrics>,

    /// Side-band outcome events
    events: EventSender,

    /// Shutdown signal
    cancel: CancellationToken,
}

impl<W: Writer> EgressBuffer<W> {
    /// Create a new egress buffer
    pub fn new(
        writer: W,
        config: BufferConfig,
        receiver: mpsc::Receiver<Message>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            writer,
            spool: VecDeque::with_capacity(config.batch_size),
            config,
            alive: true,
            last_attempt: Instant::now(),
            draining: false,
            metrics: Arc::new(BufferMetrics::default()),
            events,
            cancel,
        }
    }

    /// Get a handle that outlives `run()`
    pub fn metrics_handle(&self) -> BufferMetricsHandle {
        BufferMetricsHandle {
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Run the buffer until cancellation or ingress closure
    ///
    /// Writes the startup probe synchronously first; a broker that cannot
    /// take the probe is a fatal configuration problem and surfaces as
    /// [`BufferError::StartupProbe`].
    pub async fn run(mut self) -> Result<BufferSnapshot, BufferError> {
        tracing::info!(
            topic = %self.config.topic,
            batch_size = self.config.batch_size,
            max_batch_size = self.config.max_batch_size,
            retry_interval = ?self.config.failure_retry_interval,
            "kafka egress buffer starting"
        );

        self.write_probe().await?;
        tracing::info!("startup probe acknowledged, accepting ingress");

        let mut flush_tick = tokio::time::interval(self.config.interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.last_attempt + self.config.failure_retry_interval;

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::info!(spool = self.spool.len(), "shutdown signal received");
                    self.drain_and_exit().await;
                    break;
                }

                recv = self.receiver.recv() => match recv {
                    Some(msg) => self.on_ingress(msg).await,
                    None => {
                        tracing::info!(spool = self.spool.len(), "ingress channel closed");
                        self.drain_and_exit().await;
                        break;
                    }
                },

                _ = tokio::time::sleep_until(retry_at), if !self.alive => {
                    self.despool().await;
                }

                _ = flush_tick.tick() => {
                    if self.alive && !self.spool.is_empty() {
                        self.flush_chunk().await;
                    }
                }
            }
        }

        Ok(self.metrics.snapshot())
    }

    /// Write the synthetic probe record
    async fn write_probe(&mut self) -> Result<(), BufferError> {
        let probe = Message::new(self.config.test_message_topic.clone(), PROBE_PAYLOAD);
        let payload = probe.encode()?;

        self.submit(&[payload]).await.map_err(|e| {
            self.metrics.record_failure();
            self.events.emit(Event::KafkaError);
            BufferError::StartupProbe(e)
        })?;

        self.metrics.record_write(1);
        self.events.emit(Event::KafkaSent);
        Ok(())
    }

    /// Handle one message from the ingress channel
    async fn on_ingress(&mut self, msg: Message) {
        self.spool.push_back(msg);

        if self.alive {
            if self.spool.len() >= self.config.batch_size {
                self.flush_chunk().await;
            }
        } else if self.last_attempt.elapsed() >= self.config.failure_retry_interval {
            self.despool().await;
        } else {
            tracing::debug!(spool = self.spool.len(), "message spooled while kafka is down");
        }
    }

    /// Flush one batch off the spool head
    ///
    /// Takes up to `max_batch_size` messages, encodes them (a message that
    /// cannot be serialized is dropped, not allowed to wedge the pipeline),
    /// and submits the batch atomically. On failure the batch returns to the
    /// spool head and the buffer is marked down.
    ///
    /// Returns whether the write succeeded.
    async fn flush_chunk(&mut self) -> bool {
        let take = self.spool.len().min(self.config.max_batch_size);
        if take == 0 {
            return true;
        }

        let batch: Vec<Message> = self.spool.drain(..take).collect();
        let mut payloads = Vec::with_capacity(take);
        let mut pending = Vec::with_capacity(take);

        for msg in batch {
            match msg.encode() {
                Ok(payload) => {
                    payloads.push(payload);
                    pending.push(msg);
                }
                Err(e) => {
                    tracing::error!(
                        topic = %msg.topic,
                        error = %e,
                        "dropping message that cannot be serialized"
                    );
                    self.events.emit(Event::KafkaError);
                }
            }
        }

        if payloads.is_empty() {
            return true;
        }

        match self.submit(&payloads).await {
            Ok(()) => {
                self.metrics.record_write(payloads.len() as u64);
                for _ in 0..payloads.len() {
                    self.events.emit(Event::KafkaSent);
                }
                self.alive = true;
                true
            }
            Err(e) => {
                self.metrics.record_failure();
                self.events.emit(Event::KafkaError);

                // Unacknowledged batch goes back to the head, in front of
                // anything newer, so recovery replays in arrival order.
                for msg in pending.into_iter().rev() {
                    self.spool.push_front(msg);
                }

                if self.alive {
                    tracing::warn!(
                        error = %e,
                        spool = self.spool.len(),
                        "kafka write failed, entering spool mode"
                    );
                } else {
                    tracing::debug!(error = %e, spool = self.spool.len(), "kafka still down");
                }

                self.alive = false;
                self.last_attempt = Instant::now();
                false
            }
        }
    }

    /// Drain the spool after an outage
    ///
    /// The first chunk write doubles as the liveness check. Resumable: a
    /// failure leaves the remaining suffix at the spool head for the next
    /// attempt. Ingress keeps landing in the spool tail between chunks.
    async fn despool(&mut self) {
        tracing::info!(spool = self.spool.len(), "retrying kafka, attempting to despool");
        let mut delivered = 0usize;

        while !self.spool.is_empty() {
            if self.cancel.is_cancelled() {
                return;
            }

            let chunk = self.spool.len().min(self.config.max_batch_size);
            if !self.flush_chunk().await {
                tracing::warn!(
                    delivered,
                    remaining = self.spool.len(),
                    "kafka failed again mid-despool, rest stays spooled"
                );
                return;
            }
            delivered += chunk;

            self.drain_ingress();
        }

        // Normally set by the first successful chunk; also covers a spool
        // emptied entirely by codec drops, where no write ever happened.
        self.alive = true;
        tracing::info!(delivered, "kafka recovered, spool drained");
    }

    /// Pull everything currently queued on the ingress channel into the
    /// spool tail without blocking
    fn drain_ingress(&mut self) {
        while let Ok(msg) = self.receiver.try_recv() {
            self.spool.push_back(msg);
        }
    }

    /// Final drain before exit
    ///
    /// Collects whatever ingress already queued, then makes bounded flush
    /// attempts while the writer is believed healthy. While down nothing is
    /// written; a broker that just failed will not suddenly take a batch
    /// during shutdown, and a blocked writer must not stall exit.
    async fn drain_and_exit(&mut self) {
        self.draining = true;
        self.drain_ingress();

        if self.alive {
            while !self.spool.is_empty() {
                if !self.flush_chunk().await {
                    break;
                }
                self.drain_ingress();
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            spool = self.spool.len(),
            writes = snapshot.writes,
            msgs = snapshot.msgs,
            failures = snapshot.failures,
            "kafka egress buffer stopped"
        );
    }

    /// Submit a batch with the per-write deadline applied
    ///
    /// During normal operation the shutdown signal is raced against the
    /// write so a wedged writer unblocks the moment the scope is cancelled.
    async fn submit(&self, payloads: &[Vec<u8>]) -> Result<(), WriteError> {
        let write = async {
            match timeout(self.config.kafka_timeout, self.writer.write(payloads)).await {
                Ok(result) => result,
                Err(_) => Err(WriteError::Timeout),
            }
        };

        if self.draining {
            return write.await;
        }

        tokio::select! {
            biased;
            result = write => result,
            _ = self.cancel.cancelled() => Err(WriteError::Cancelled),
        }
    }
}
