//! Publish/subscribe transport abstraction
//!
//! The dispatcher only needs four capabilities from the broker connection.
//! `MqttTransport` is the real implementation; tests plug in the devkit mock.

mod mqtt;

use crate::error::DispatchResult;
use async_trait::async_trait;

pub use mqtt::MqttTransport;

/// Message received on a subscribed topic
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> DispatchResult<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> DispatchResult<()>;

    /// Next inbound message, `None` once the connection is gone
    async fn next_message(&mut self) -> Option<InboundMessage>;

    /// Close the connection; must be called on every exit path
    async fn disconnect(&mut self) -> DispatchResult<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::{InboundMessage, Transport};
    use crate::error::{DispatchError, DispatchResult};
    use async_trait::async_trait;
    use opentb_devkit::{MockMessage, MockMqttClient};
    use rumqttc::QoS;
    use tokio::sync::mpsc;

    /// Transport backed by the devkit mock client
    pub(crate) struct MockTransport {
        client: MockMqttClient,
        inbound: mpsc::UnboundedReceiver<MockMessage>,
    }

    impl MockTransport {
        pub(crate) fn new(client: &MockMqttClient) -> Self {
            Self {
                inbound: client.setup_receiver(),
                client: client.clone(),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn subscribe(&self, topic: &str) -> DispatchResult<()> {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| DispatchError::TransportUnavailable(e.to_string()))
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> DispatchResult<()> {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| DispatchError::TransportUnavailable(e.to_string()))
        }

        async fn next_message(&mut self) -> Option<InboundMessage> {
            self.inbound.recv().await.map(|m| InboundMessage {
                topic: m.topic,
                payload: m.payload,
            })
        }

        async fn disconnect(&mut self) -> DispatchResult<()> {
            self.client
                .disconnect()
                .await
                .map_err(|e| DispatchError::TransportUnavailable(e.to_string()))
        }
    }
}
