//! Metamorphosis - Kafka egress
//!
//! Everything between the ingress channel and the Kafka broker.
//!
//! # Architecture
//!
//! ```text
//! [MQTT source] --Message--> [EgressBuffer] --batch of records--> [Writer] --> broker
//!                                  │
//!                                  └─ spool (in-memory, order-preserving) on write failure
//! ```
//!
//! The [`EgressBuffer`] is a single task that multiplexes ingress, flush
//! ticks, the failure-retry timer and cancellation. Under normal operation
//! it batches messages up to a hard cap per write; when the writer fails it
//! diverts ingress into an in-memory spool and despools in order once the
//! broker recovers.
//!
//! The [`Writer`] trait is the one seam to the outside: production code uses
//! the rskafka-backed [`KafkaWriter`], tests substitute a mock.

mod buffer;
mod error;
mod writer;

pub use buffer::{BufferConfig, BufferMetricsHandle, BufferSnapshot, EgressBuffer};
pub use error::{BufferError, WriteError};
pub use writer::{KafkaWriter, KafkaWriterConfig, Writer};
