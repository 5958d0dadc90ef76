//! Tests for the egress buffer
//!
//! The buffer is driven end-to-end against a scriptable mock writer whose
//! failure modes are switched on and off mid-test.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use metamorphosis_observability::{Event, channel};
use metamorphosis_protocol::Message;

use super::{BufferConfig, BufferMetricsHandle, BufferSnapshot, EgressBuffer};
use crate::error::{BufferError, WriteError};
use crate::writer::Writer;

// =============================================================================
// Mock writer
// =============================================================================

#[derive(Clone, Default)]
struct MockWriter {
    inner: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    storage: Mutex<Vec<Vec<u8>>>,
    failed: AtomicBool,
    deadlock: AtomicBool,
    delays: Mutex<(Duration, Duration)>,
    writes: AtomicU64,
    msgs: AtomicU64,
}

impl MockWriter {
    fn set_failed(&self, failed: bool) {
        self.inner.failed.store(failed, Ordering::Release);
    }

    fn set_deadlock(&self, deadlock: bool) {
        self.inner.deadlock.store(deadlock, Ordering::Release);
    }

    fn set_delay(&self, batch: Duration, per_msg: Duration) {
        *self.inner.delays.lock().unwrap() = (batch, per_msg);
    }

    fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Acquire)
    }

    fn msgs(&self) -> u64 {
        self.inner.msgs.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.inner.storage.lock().unwrap().len()
    }

    /// Decode the record at `index`
    fn message(&self, index: usize) -> Message {
        let storage = self.inner.storage.lock().unwrap();
        Message::decode(&storage[index]).expect("stored record should decode")
    }
}

#[async_trait]
impl Writer for MockWriter {
    async fn write(&self, payloads: &[Vec<u8>]) -> Result<(), WriteError> {
        if self.inner.deadlock.load(Ordering::Acquire) {
            // Never completes; only dropping the future (deadline or
            // shutdown) gets out of here.
            std::future::pending::<()>().await;
        }

        let (batch_delay, msg_delay) = *self.inner.delays.lock().unwrap();
        let delay = batch_delay + msg_delay * payloads.len() as u32;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.inner.failed.load(Ordering::Acquire) {
            return Err(WriteError::Broker("writer is in a failed state".into()));
        }

        self.inner
            .storage
            .lock()
            .unwrap()
            .extend_from_slice(payloads);
        self.inner.writes.fetch_add(1, Ordering::AcqRel);
        self.inner
            .msgs
            .fetch_add(payloads.len() as u64, Ordering::AcqRel);
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct TestBuffer {
    ingress: mpsc::Sender<Message>,
    writer: MockWriter,
    metrics: BufferMetricsHandle,
    cancel: CancellationToken,
    events: mpsc::Receiver<Event>,
    task: JoinHandle<Result<BufferSnapshot, BufferError>>,
}

impl TestBuffer {
    /// Cancel the buffer and wait for `run` to finish
    async fn shutdown(self) -> Result<BufferSnapshot, BufferError> {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("buffer should stop after cancellation")
            .expect("buffer task should not panic")
    }

    /// Count the observability events emitted so far
    fn event_counts(&mut self) -> (u64, u64) {
        let (mut sent, mut errors) = (0, 0);
        while let Ok(event) = self.events.try_recv() {
            match event {
                Event::KafkaSent => sent += 1,
                Event::KafkaError => errors += 1,
                Event::MqttReceived => {}
            }
        }
        (sent, errors)
    }
}

fn test_config() -> BufferConfig {
    BufferConfig::default()
        .with_interval(Duration::from_millis(2))
        .with_failure_retry_interval(Duration::from_millis(200))
        .with_batch_size(5)
        .with_max_batch_size(20)
        .with_kafka_timeout(Duration::from_millis(25))
        .with_topic("unittest")
        .with_test_message_topic("test")
}

fn spawn_buffer(writer: MockWriter, config: BufferConfig) -> TestBuffer {
    let (ingress, receiver) = mpsc::channel(1);
    let (events_tx, events_rx) = channel(65536);
    let cancel = CancellationToken::new();

    let buffer = EgressBuffer::new(writer.clone(), config, receiver, events_tx, cancel.clone());
    let metrics = buffer.metrics_handle();
    let task = tokio::spawn(buffer.run());

    TestBuffer {
        ingress,
        writer,
        metrics,
        cancel,
        events: events_rx,
        task,
    }
}

fn make_message(id: usize) -> Message {
    Message::new("test", id.to_string().into_bytes())
}

/// Poll `current` until it reaches `target` or the timeout expires
async fn wait_for(what: &str, target: u64, limit: Duration, current: impl Fn() -> u64) {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if current() >= target {
            return;
        }
        tokio::time::sleep(Duration::from_micros(500)).await;
    }
    panic!(
        "timed out waiting for {what} to reach {target}, currently {}",
        current()
    );
}

// =============================================================================
// Lifecycle
// =============================================================================

// A buffer that starts, receives nothing and is cancelled writes exactly
// one probe record.
#[tokio::test]
async fn test_run_and_cancel() {
    let rig = spawn_buffer(MockWriter::default(), test_config());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let writer = rig.writer.clone();
    let snapshot = rig.shutdown().await.expect("run should succeed");

    assert_eq!(writer.msgs(), 1);
    assert_eq!(writer.writes(), 1);
    let probe = writer.message(0);
    assert_eq!(probe.topic, "test");
    assert_eq!(probe.content, b"probe");
    assert_eq!(snapshot.msgs, 1);
    assert_eq!(snapshot.failures, 0);
}

// Startup with the writer already failed is fatal.
#[tokio::test]
async fn test_startup_failure_is_fatal() {
    let writer = MockWriter::default();
    writer.set_failed(true);

    let rig = spawn_buffer(writer.clone(), test_config());
    let result = tokio::time::timeout(Duration::from_secs(2), rig.task)
        .await
        .expect("run should return promptly")
        .expect("buffer task should not panic");

    assert!(matches!(result, Err(BufferError::StartupProbe(_))));
    assert_eq!(writer.len(), 0);
    assert_eq!(rig.metrics.snapshot().failures, 1);
}

// Closing the ingress channel drains the spool and exits normally.
#[tokio::test]
async fn test_ingress_close_drains_and_exits() {
    let rig = spawn_buffer(MockWriter::default(), test_config());

    for i in 0..7 {
        rig.ingress.send(make_message(i)).await.expect("send");
    }
    let writer = rig.writer.clone();
    drop(rig.ingress);

    let snapshot = tokio::time::timeout(Duration::from_secs(2), rig.task)
        .await
        .expect("run should return after channel closure")
        .expect("buffer task should not panic")
        .expect("run should succeed");

    assert_eq!(writer.msgs(), 8);
    for i in 0..7 {
        assert_eq!(writer.message(i + 1).content, i.to_string().into_bytes());
    }
    assert_eq!(snapshot.failures, 0);
}

// =============================================================================
// Delivery and ordering
// =============================================================================

// Ten messages arrive in storage behind the probe, in order.
#[tokio::test]
async fn test_delivers_in_order() {
    let mut rig = spawn_buffer(MockWriter::default(), test_config());
    let writer = rig.writer.clone();

    for i in 0..10 {
        rig.ingress.send(make_message(i)).await.expect("send");
    }

    wait_for("mock msgs", 11, Duration::from_secs(2), || writer.msgs()).await;

    let (sent, errors) = rig.event_counts();
    rig.shutdown().await.expect("run should succeed");

    assert_eq!(writer.msgs(), 11);
    assert_eq!(writer.message(0).topic, "test");
    for i in 1..=10 {
        let msg = writer.message(i);
        assert_eq!(msg.content, (i - 1).to_string().into_bytes());
    }
    assert_eq!(sent, 11);
    assert_eq!(errors, 0);
}

// A slowed-down writer must not reorder anything.
#[tokio::test]
async fn test_slow_writer_preserves_order() {
    const COUNT: usize = 500;

    let writer = MockWriter::default();
    writer.set_delay(Duration::from_millis(2), Duration::from_micros(20));

    let rig = spawn_buffer(writer.clone(), test_config());
    for i in 0..COUNT {
        rig.ingress.send(make_message(i)).await.expect("send");
    }

    wait_for("mock msgs", COUNT as u64 + 1, Duration::from_secs(10), || {
        writer.msgs()
    })
    .await;
    rig.shutdown().await.expect("run should succeed");

    assert_eq!(writer.msgs(), COUNT as u64 + 1);
    for i in 1..=COUNT {
        let msg = writer.message(i);
        assert_eq!(msg.content, (i - 1).to_string().into_bytes());
        assert_eq!(msg.topic, "test");
    }
}

// =============================================================================
// Failure and recovery
// =============================================================================

// A mid-stream outage spools messages and despools them in order.
#[tokio::test]
async fn test_failure_and_recovery() {
    let mut rig = spawn_buffer(MockWriter::default(), test_config());
    let writer = rig.writer.clone();

    for i in 0..5 {
        rig.ingress.send(make_message(i)).await.expect("send");
    }
    wait_for("mock msgs", 6, Duration::from_secs(2), || writer.msgs()).await;

    writer.set_failed(true);
    for i in 5..10 {
        rig.ingress.send(make_message(i)).await.expect("send");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    writer.set_failed(false);

    wait_for("mock msgs", 11, Duration::from_secs(2), || writer.msgs()).await;

    let (sent, errors) = rig.event_counts();
    let snapshot = rig.shutdown().await.expect("run should succeed");

    for i in 1..=10 {
        assert_eq!(writer.message(i).content, (i - 1).to_string().into_bytes());
    }
    assert_eq!(snapshot.failures, 1);
    assert_eq!(sent, 11);
    assert_eq!(errors, 1);
}

// Batched recovery: one failure, then the whole backlog drains in
// max_batch_size chunks. Counter expectations are exact.
#[tokio::test]
async fn test_batch_recovery() {
    const TOTAL: usize = 10_000;

    let config = test_config()
        .with_batch_size(100)
        .with_max_batch_size(1000)
        .with_failure_retry_interval(Duration::from_millis(500));
    let rig = spawn_buffer(MockWriter::default(), config);
    let writer = rig.writer.clone();

    rig.ingress.send(make_message(0)).await.expect("send");
    wait_for("mock msgs", 2, Duration::from_secs(2), || writer.msgs()).await;

    writer.set_failed(true);
    for i in 0..TOTAL {
        rig.ingress.send(make_message(i)).await.expect("send");
    }
    writer.set_failed(false);

    wait_for(
        "mock msgs",
        TOTAL as u64 + 2,
        Duration::from_secs(5),
        || writer.msgs(),
    )
    .await;

    let snapshot = rig.shutdown().await.expect("run should succeed");

    // probe + single message + ten chunks of 1000
    assert_eq!(writer.msgs(), TOTAL as u64 + 2);
    assert_eq!(writer.writes(), 12);
    assert_eq!(snapshot.failures, 1);
}

// Recovery that is interrupted by a second outage resumes where it
// stopped, without re-sending or reordering.
#[tokio::test]
async fn test_recovery_interrupted() {
    const COUNT: usize = 1000;

    let config = test_config()
        .with_batch_size(10)
        .with_max_batch_size(100);
    let writer = MockWriter::default();
    writer.set_delay(Duration::from_millis(1), Duration::ZERO);

    let rig = spawn_buffer(writer.clone(), config);
    wait_for("mock msgs", 1, Duration::from_secs(2), || writer.msgs()).await;

    writer.set_failed(true);
    for i in 1..=COUNT {
        rig.ingress.send(make_message(i)).await.expect("send");
    }
    writer.set_failed(false);

    wait_for("mock msgs", 500, Duration::from_secs(3), || writer.msgs()).await;
    writer.set_failed(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    writer.set_failed(false);

    wait_for(
        "mock msgs",
        COUNT as u64 + 1,
        Duration::from_secs(5),
        || writer.msgs(),
    )
    .await;
    rig.shutdown().await.expect("run should succeed");

    assert_eq!(writer.len(), COUNT + 1);
    for i in 1..=COUNT {
        assert_eq!(writer.message(i).content, i.to_string().into_bytes());
    }
}

// A wedged writer must not survive cancellation; nothing half-written may
// appear in storage.
#[tokio::test]
async fn test_deadlocked_writer_unblocks_on_cancel() {
    let rig = spawn_buffer(MockWriter::default(), test_config());
    let writer = rig.writer.clone();
    wait_for("mock msgs", 1, Duration::from_secs(2), || writer.msgs()).await;

    writer.set_deadlock(true);
    for i in 0..50 {
        rig.ingress.send(make_message(i)).await.expect("send");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = rig.shutdown().await.expect("run should succeed");

    // Every data write timed out against the deadlocked writer; storage
    // holds the probe and nothing else, cleanly.
    assert_eq!(writer.len(), 1);
    assert_eq!(writer.message(0).topic, "test");
    assert!(snapshot.failures >= 1);
}

// =============================================================================
// Configuration and metrics
// =============================================================================

#[test]
fn test_config_defaults() {
    let config = BufferConfig::default();

    assert_eq!(config.interval, Duration::from_millis(2));
    assert_eq!(config.failure_retry_interval, Duration::from_secs(10));
    assert_eq!(config.batch_size, 100);
    assert_eq!(config.max_batch_size, 1000);
    assert_eq!(config.kafka_timeout, Duration::from_secs(30));
    assert_eq!(config.test_message_topic, "test");
}

#[test]
fn test_config_builders() {
    let config = BufferConfig::default()
        .with_interval(Duration::from_millis(5))
        .with_failure_retry_interval(Duration::from_secs(1))
        .with_batch_size(7)
        .with_max_batch_size(70)
        .with_kafka_timeout(Duration::from_secs(3))
        .with_topic("bridge")
        .with_test_message_topic("probe");

    assert_eq!(config.interval, Duration::from_millis(5));
    assert_eq!(config.failure_retry_interval, Duration::from_secs(1));
    assert_eq!(config.batch_size, 7);
    assert_eq!(config.max_batch_size, 70);
    assert_eq!(config.kafka_timeout, Duration::from_secs(3));
    assert_eq!(config.topic, "bridge");
    assert_eq!(config.test_message_topic, "probe");
}

#[test]
fn test_config_batch_sizes_clamped() {
    let config = BufferConfig::default()
        .with_batch_size(0)
        .with_max_batch_size(0);

    assert_eq!(config.batch_size, 1);
    assert_eq!(config.max_batch_size, 1);
}

#[test]
fn test_metrics_handle_starts_at_zero() {
    let (_ingress, receiver) = mpsc::channel(1);
    let (events, _events_rx) = channel(8);
    let buffer = EgressBuffer::new(
        MockWriter::default(),
        BufferConfig::default(),
        receiver,
        events,
        CancellationToken::new(),
    );

    let snapshot = buffer.metrics_handle().snapshot();
    assert_eq!(snapshot.writes, 0);
    assert_eq!(snapshot.msgs, 0);
    assert_eq!(snapshot.failures, 0);
}
