//! rumqttc backed transport
//!
//! The connection is confirmed (CONNACK) before `connect` returns, so a dead
//! broker surfaces as `TransportUnavailable` before anything is published.
//! The event loop runs on its own task and forwards publishes to a channel.
//! There is no reconnect: the session is clean, so subscriptions would be
//! gone. A connection error closes the channel and the invocation fails.

use super::{InboundMessage, Transport};
use crate::config::MqttConfig;
use crate::error::{DispatchError, DispatchResult};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Request queue size; large enough for a fan-out to the whole fleet
const REQUEST_CAPACITY: usize = 128;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

pub struct MqttTransport {
    client: AsyncClient,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    event_loop: JoinHandle<()>,
    broker: String,
}

impl MqttTransport {
    /// Connect and wait for the broker to accept the session
    pub async fn connect(config: &MqttConfig, client_id: &str) -> DispatchResult<Self> {
        let broker = format!("{}:{}", config.host, config.port);

        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        match timeout(connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(DispatchError::TransportUnavailable(format!("{}: {}", broker, reason)))
            }
            Err(_) => {
                return Err(DispatchError::TransportUnavailable(format!(
                    "{}: no CONNACK within {}s",
                    broker, config.connect_timeout_secs
                )))
            }
        }

        info!("Connected to broker {} as {}", broker, client_id);

        let (tx, inbound) = mpsc::unbounded_channel();
        let event_loop = tokio::spawn(run_event_loop(eventloop, tx));

        Ok(Self {
            client,
            inbound,
            event_loop,
            broker,
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("connection refused: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, tx: mpsc::UnboundedSender<InboundMessage>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                debug!("Received MQTT message on topic: {}", publish.topic);
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                break;
            }
        }
    }
    // Dropping `tx` ends the inbound stream
    debug!("MQTT event loop stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topic: &str) -> DispatchResult<()> {
        debug!("Subscribing to {}", topic);
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| DispatchError::TransportUnavailable(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> DispatchResult<()> {
        debug!("Publishing {} bytes to {}", payload.len(), topic);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| DispatchError::TransportUnavailable(e.to_string()))
    }

    async fn next_message(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }

    async fn disconnect(&mut self) -> DispatchResult<()> {
        if let Err(e) = self.client.disconnect().await {
            warn!("Disconnect request failed: {}", e);
        }

        // Let the event loop flush the DISCONNECT packet
        if timeout(DISCONNECT_GRACE, &mut self.event_loop).await.is_err() {
            self.event_loop.abort();
        }

        info!("Disconnected from broker {}", self.broker);
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
