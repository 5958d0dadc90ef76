//! Error types for the Kafka egress path

use thiserror::Error;

/// Errors from a [`Writer`](crate::Writer) or its construction
///
/// Every variant returned from a write is treated as a transient full-batch
/// failure: the buffer keeps the records and retries them later.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Could not reach the broker to set up the producer
    #[error("failed to connect to kafka broker {broker}: {message}")]
    Connect { broker: String, message: String },

    /// The broker rejected the batch or the transport failed mid-write
    #[error("kafka write failed: {0}")]
    Broker(String),

    /// The per-write deadline elapsed
    #[error("kafka write timed out")]
    Timeout,

    /// The write was abandoned because the bridge is shutting down
    #[error("kafka write aborted by shutdown")]
    Cancelled,
}

/// Fatal errors from [`EgressBuffer::run`](crate::EgressBuffer::run)
///
/// Anything transient is handled inside the run loop; only cold-start
/// problems surface here.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The startup probe could not be written. A broker that is unreachable
    /// before the first message is a configuration problem, not an outage.
    #[error("startup probe failed: {0}")]
    StartupProbe(#[source] WriteError),

    /// The probe record could not be serialized
    #[error(transparent)]
    ProbeEncode(#[from] metamorphosis_protocol::CodecError),
}
