//! Metamorphosis - Observability
//!
//! Side-band event stream for the bridge pipeline.
//!
//! # Design
//!
//! Components emit one [`Event`] per outcome (message received, record sent,
//! write error) into a bounded channel. The [`Collector`] drains the channel
//! into lock-free counters, and a small axum server exposes them together
//! with health and readiness probes.
//!
//! Emission is non-blocking: if the collector falls behind, events are
//! dropped rather than back-pressuring the pipeline hot path.

mod collector;
mod server;

pub use collector::{Collector, CollectorHandle, CountersSnapshot};
pub use server::serve;

use tokio::sync::mpsc;

/// A single pipeline outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A record was acknowledged by the Kafka writer
    KafkaSent,

    /// A write attempt failed, or a message could not be serialized
    KafkaError,

    /// A message arrived from the MQTT broker
    MqttReceived,
}

/// Sending half of the event channel
///
/// Cheap to clone; one per emitting component.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Emit an event without blocking
    ///
    /// Drops the event if the collector is not keeping up. The hot path must
    /// never wait on observability.
    pub fn emit(&self, event: Event) {
        if self.sender.try_send(event).is_err() {
            tracing::trace!(?event, "observability channel full, dropping event");
        }
    }
}

/// Create an event channel
///
/// Returns the sending half for pipeline components and the receiver for the
/// [`Collector`].
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (EventSender { sender }, receiver)
}
