//! Event collector
//!
//! Drains the observability channel into atomic counters. The counters stay
//! readable through a [`CollectorHandle`] after `run()` consumes the
//! collector itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Event;

/// Lock-free counters for pipeline outcomes
#[derive(Debug, Default)]
struct Counters {
    kafka_sent: AtomicU64,
    kafka_errors: AtomicU64,
    mqtt_received: AtomicU64,
}

/// Point-in-time snapshot of the counters
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CountersSnapshot {
    pub kafka_sent: u64,
    pub kafka_errors: u64,
    pub mqtt_received: u64,
}

/// Background task that counts observability events
pub struct Collector {
    receiver: mpsc::Receiver<Event>,
    counters: Arc<Counters>,
    ready: Arc<AtomicBool>,
    start: Instant,
    cancel: CancellationToken,
}

impl Collector {
    /// Create a collector draining `receiver` until `cancel` fires
    pub fn new(receiver: mpsc::Receiver<Event>, cancel: CancellationToken) -> Self {
        Self {
            receiver,
            counters: Arc::new(Counters::default()),
            ready: Arc::new(AtomicBool::new(false)),
            start: Instant::now(),
            cancel,
        }
    }

    /// Get a handle that outlives `run()`
    pub fn handle(&self) -> CollectorHandle {
        CollectorHandle {
            counters: Arc::clone(&self.counters),
            ready: Arc::clone(&self.ready),
            start: self.start,
        }
    }

    /// Run the collector until cancellation or channel closure
    pub async fn run(mut self) -> CountersSnapshot {
        tracing::debug!("observability collector started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.receiver.recv() => match event {
                    Some(event) => self.count(event),
                    None => break,
                },
            }
        }

        // Pick up anything the pipeline emitted just before shutdown.
        while let Ok(event) = self.receiver.try_recv() {
            self.count(event);
        }

        let snapshot = self.handle().snapshot();
        tracing::info!(
            kafka_sent = snapshot.kafka_sent,
            kafka_errors = snapshot.kafka_errors,
            mqtt_received = snapshot.mqtt_received,
            "observability collector stopped"
        );
        snapshot
    }

    fn count(&self, event: Event) {
        let counter = match event {
            Event::KafkaSent => &self.counters.kafka_sent,
            Event::KafkaError => &self.counters.kafka_errors,
            Event::MqttReceived => &self.counters.mqtt_received,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cloneable view of the collector state
///
/// Handed to the status endpoint and to the binary for the final report.
#[derive(Clone)]
pub struct CollectorHandle {
    counters: Arc<Counters>,
    ready: Arc<AtomicBool>,
    start: Instant,
}

impl CollectorHandle {
    /// Snapshot the counters
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            kafka_sent: self.counters.kafka_sent.load(Ordering::Relaxed),
            kafka_errors: self.counters.kafka_errors.load(Ordering::Relaxed),
            mqtt_received: self.counters.mqtt_received.load(Ordering::Relaxed),
        }
    }

    /// Mark the bridge ready to serve
    ///
    /// Called once the pipeline is wired and the startup probe has passed.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Whether the bridge has finished starting up
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Seconds since the collector was created
    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }
}
