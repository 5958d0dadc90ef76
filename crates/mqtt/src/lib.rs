//! Metamorphosis - MQTT ingress
//!
//! Thin wrapper around a rumqttc subscribe loop. Every publish received on
//! the configured topic becomes a [`Message`] on the ingress channel; the
//! egress buffer does the rest.
//!
//! Subscriptions use QoS 1, so the broker redelivers anything the bridge
//! did not acknowledge before a crash. That redelivery is where the
//! pipeline's at-least-once guarantee comes from.

use std::time::Duration;

use rumqttc::{AsyncClient, Event as PacketEvent, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use metamorphosis_observability::{Event, EventSender};
use metamorphosis_protocol::Message;

/// Pause between reconnect attempts, so a flapping broker is not rushed
const RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Default number of attempts before startup gives up
const DEFAULT_CONNECTION_ATTEMPTS: usize = 10;

/// Configuration for the MQTT source
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host
    pub broker: String,

    /// Broker port
    pub port: u16,

    /// Topic filter to subscribe to
    pub topic: String,

    /// Client identifier presented to the broker
    pub client_id: String,

    /// Event-loop errors tolerated before the first successful connection
    pub connection_attempts: usize,
}

impl MqttConfig {
    /// Create a new MQTT config
    pub fn new(broker: impl Into<String>, port: u16, topic: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port,
            topic: topic.into(),
            client_id: "metamorphosis".to_string(),
            connection_attempts: DEFAULT_CONNECTION_ATTEMPTS,
        }
    }

    /// Set the client identifier
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set the startup connection attempt limit
    #[must_use]
    pub fn with_connection_attempts(mut self, attempts: usize) -> Self {
        self.connection_attempts = attempts.max(1);
        self
    }
}

/// Errors from the MQTT source
#[derive(Debug, Error)]
pub enum MqttError {
    /// The broker could not be reached within the startup attempt limit
    #[error("could not connect to mqtt broker {broker} after {attempts} attempts: {message}")]
    Connect {
        broker: String,
        attempts: usize,
        message: String,
    },

    /// The subscribe request could not be queued
    #[error("could not subscribe to '{topic}': {message}")]
    Subscribe { topic: String, message: String },
}

/// MQTT subscribe loop feeding the ingress channel
pub struct MqttSource {
    config: MqttConfig,
    sender: mpsc::Sender<Message>,
    events: EventSender,
    cancel: CancellationToken,
}

impl MqttSource {
    /// Create a new MQTT source
    pub fn new(
        config: MqttConfig,
        sender: mpsc::Sender<Message>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            sender,
            events,
            cancel,
        }
    }

    /// Run the subscribe loop until cancellation
    ///
    /// Failing to reach the broker within the startup attempt limit is an
    /// error; after the first successful connection the loop rides out
    /// broker outages and re-subscribes on every reconnect.
    pub async fn run(self) -> Result<(), MqttError> {
        let broker = format!("{}:{}", self.config.broker, self.config.port);
        tracing::info!(
            broker = %broker,
            topic = %self.config.topic,
            client_id = %self.config.client_id,
            "mqtt source starting"
        );

        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.broker.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, 16);

        let mut connected = false;
        let mut attempts = 0usize;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::info!("mqtt source shutting down");
                    let _ = client.unsubscribe(self.config.topic.as_str()).await;
                    let _ = client.disconnect().await;
                    break;
                }

                event = event_loop.poll() => match event {
                    Ok(PacketEvent::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!(broker = %broker, "connected to mqtt broker");
                        connected = true;
                        // rumqttc does not replay subscriptions across
                        // reconnects, so issue it on every ConnAck.
                        client
                            .subscribe(self.config.topic.as_str(), QoS::AtLeastOnce)
                            .await
                            .map_err(|e| MqttError::Subscribe {
                                topic: self.config.topic.clone(),
                                message: e.to_string(),
                            })?;
                    }
                    Ok(PacketEvent::Incoming(Packet::SubAck(_))) => {
                        tracing::info!(topic = %self.config.topic, "subscribed");
                    }
                    Ok(PacketEvent::Incoming(Packet::Publish(publish))) => {
                        tracing::trace!(topic = %publish.topic, len = publish.payload.len(), "message received");
                        let msg = Message::new(publish.topic.clone(), publish.payload.to_vec());
                        if self.sender.send(msg).await.is_err() {
                            tracing::warn!("ingress channel closed, stopping mqtt source");
                            break;
                        }
                        self.events.emit(Event::MqttReceived);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !connected {
                            attempts += 1;
                            tracing::error!(
                                broker = %broker,
                                attempt = attempts,
                                max_attempts = self.config.connection_attempts,
                                error = %e,
                                "mqtt connection attempt failed"
                            );
                            if attempts >= self.config.connection_attempts {
                                return Err(MqttError::Connect {
                                    broker,
                                    attempts,
                                    message: e.to_string(),
                                });
                            }
                        } else {
                            tracing::error!(error = %e, "mqtt event loop error, reconnecting");
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
            }
        }

        Ok(())
    }
}
