//! Metamorphosis - MQTT to Kafka bridge
//!
//! Subscribes to an MQTT topic, wraps each message in a framed envelope and
//! forwards it to Kafka with at-least-once delivery.
//!
//! # Usage
//!
//! ```bash
//! metamorphosis
//! metamorphosis --config configs/config.toml --log-level debug
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use metamorphosis_config::Config;
use metamorphosis_kafka::{BufferConfig, EgressBuffer, KafkaWriter, KafkaWriterConfig};
use metamorphosis_mqtt::{MqttConfig, MqttSource};
use metamorphosis_observability::{self as observability, Collector};

/// Grace period between stopping the MQTT side and stopping the Kafka side,
/// long enough for the pipeline to flush what is already in flight.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Metamorphosis - MQTT to Kafka bridge
#[derive(Parser, Debug)]
#[command(name = "metamorphosis")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "configs/config.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_logging(level)?;

    run(config).await
}

/// Initialize the tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    // The two sides stop in order on shutdown: MQTT first so no new
    // messages arrive, Kafka after a grace period so the pipeline flushes.
    let mqtt_cancel = CancellationToken::new();
    let kafka_cancel = CancellationToken::new();

    // Observability: event collector plus the status endpoint.
    let (events, events_rx) = observability::channel(config.observability.channel_capacity);
    let collector = Collector::new(events_rx, kafka_cancel.child_token());
    let status = collector.handle();
    tokio::spawn(collector.run());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.observability.health_port))
        .await
        .with_context(|| {
            format!(
                "binding status endpoint on port {}",
                config.observability.health_port
            )
        })?;
    tokio::spawn(observability::serve(
        listener,
        status.clone(),
        kafka_cancel.child_token(),
    ));

    // Kafka side: producer and egress buffer.
    let writer_config = KafkaWriterConfig::new(
        config.kafka.broker.clone(),
        config.kafka.port,
        config.kafka.topic.clone(),
    );
    let writer = KafkaWriter::connect(writer_config)
        .await
        .context("connecting to kafka")?;

    let buffer_config = BufferConfig::default()
        .with_interval(config.buffer.interval)
        .with_failure_retry_interval(config.buffer.failure_retry_interval)
        .with_batch_size(config.buffer.batch_size)
        .with_max_batch_size(config.buffer.max_batch_size)
        .with_kafka_timeout(config.buffer.kafka_timeout)
        .with_topic(config.kafka.topic.clone())
        .with_test_message_topic(config.buffer.test_message_topic.clone());

    // Capacity 1 keeps the ingress channel as close to unbuffered as tokio
    // allows; backpressure reaches the MQTT session instead of hiding in a
    // queue.
    let (ingress, ingress_rx) = mpsc::channel(1);
    let buffer = EgressBuffer::new(
        writer,
        buffer_config,
        ingress_rx,
        events.clone(),
        kafka_cancel.clone(),
    );
    let mut buffer_task = tokio::spawn(buffer.run());

    // MQTT side.
    let mqtt_config = MqttConfig::new(
        config.mqtt.broker.clone(),
        config.mqtt.port,
        config.mqtt.topic.clone(),
    )
    .with_client_id(config.mqtt.client_id.clone())
    .with_connection_attempts(config.mqtt.connection_attempts);
    let source = MqttSource::new(mqtt_config, ingress, events, mqtt_cancel.clone());
    let mut mqtt_task = tokio::spawn(source.run());

    status.set_ready();
    tracing::info!("bridge running");

    let outcome = tokio::select! {
        result = shutdown_signal() => {
            if result.is_ok() {
                tracing::info!("signal received, shutting down");
            }
            result
        }
        result = &mut buffer_task => {
            match result.context("egress buffer panicked")? {
                Ok(_) => Err(anyhow::anyhow!("egress buffer exited unexpectedly")),
                Err(e) => Err(anyhow::Error::new(e).context("egress buffer failed")),
            }
        }
        result = &mut mqtt_task => {
            match result.context("mqtt source panicked")? {
                Ok(()) => Err(anyhow::anyhow!("mqtt source exited unexpectedly")),
                Err(e) => Err(anyhow::Error::new(e).context("mqtt source failed")),
            }
        }
    };

    // Stop the MQTT side first.
    mqtt_cancel.cancel();
    if !mqtt_task.is_finished() {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut mqtt_task).await;
    }

    // The MQTT task owned the ingress sender, so the buffer now sees
    // end-of-stream and drains on its own; the token covers the case where
    // it is stuck mid-retry.
    kafka_cancel.cancel();
    if !buffer_task.is_finished() {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut buffer_task).await;
    }

    let counters = status.snapshot();
    tracing::info!(
        mqtt_received = counters.mqtt_received,
        kafka_sent = counters.kafka_sent,
        kafka_errors = counters.kafka_errors,
        "bridge stopped"
    );

    outcome
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    Ok(())
}
