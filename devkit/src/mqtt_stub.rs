/*!
Mock MQTT Client pour développement sans broker

Permet de tester le dispatcher `opentb` sans broker MQTT réel.
Enregistre tous les messages publiés et permet de simuler les réponses
des boxes et des motes du testbed.
*/

use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use anyhow::Result;

const BASE_BOX_TOPIC: &str = "opentestbed/deviceType/box/deviceId";
const BASE_MOTE_TOPIC: &str = "opentestbed/deviceType/mote/deviceId";

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT Client qui simule rumqttc::AsyncClient
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
    disconnected: Arc<Mutex<bool>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_sender: Arc::new(Mutex::new(None)),
            disconnected: Arc::new(Mutex::new(false)),
        }
    }

    /// Configuration d'un channel pour recevoir les messages simulés
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Simule la publication d'un message (compatible avec AsyncClient)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        if *self.disconnected.lock().unwrap() {
            anyhow::bail!("publish on a disconnected client");
        }

        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };

        self.published_messages.lock().unwrap().push(message.clone());

        log::info!("📤 [MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        Ok(())
    }

    /// Simule l'abonnement à un topic (compatible avec AsyncClient)
    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        self.subscriptions.lock().unwrap().push(topic.clone());
        log::info!("📥 [MOCK] Subscribed to {}", topic);
        Ok(())
    }

    /// Simule la déconnexion (compatible avec AsyncClient)
    pub async fn disconnect(&self) -> Result<()> {
        *self.disconnected.lock().unwrap() = true;
        // Fermer le channel : le récepteur voit la fin du flux
        self.message_sender.lock().unwrap().take();
        log::info!("🔌 [MOCK] Disconnected");
        Ok(())
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.lock().unwrap()
    }

    /// Simule la réception d'un message (pour tests)
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        if let Some(sender) = self.message_sender.lock().unwrap().as_ref() {
            sender.send(message.clone()).map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        }

        log::info!("📨 [MOCK] Simulated incoming: {}", message.topic);
        Ok(())
    }

    /// Simule une réponse JSON sur un topic
    pub async fn simulate_json(&self, topic: impl Into<String>, payload: &Value) -> Result<()> {
        self.simulate_incoming(topic, serde_json::to_vec(payload)?).await
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Récupère les abonnements (pour assertions de tests)
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper pour créer les réponses telles que les envoient les boxes et les motes
pub struct TestbedMessageBuilder;

impl TestbedMessageBuilder {
    /// Topic de commande d'une box: `.../box/deviceId/{box}/cmd/{cmd}`
    pub fn box_cmd_topic(box_id: &str, cmd: &str) -> String {
        format!("{}/{}/cmd/{}", BASE_BOX_TOPIC, box_id, cmd)
    }

    /// Topic de réponse d'une box: `.../box/deviceId/{box}/resp/{cmd}`
    pub fn box_resp_topic(box_id: &str, cmd: &str) -> String {
        format!("{}/{}/resp/{}", BASE_BOX_TOPIC, box_id, cmd)
    }

    pub fn mote_cmd_topic(mote: &str, cmd: &str) -> String {
        format!("{}/{}/cmd/{}", BASE_MOTE_TOPIC, mote, cmd)
    }

    pub fn mote_resp_topic(mote: &str, cmd: &str) -> String {
        format!("{}/{}/resp/{}", BASE_MOTE_TOPIC, mote, cmd)
    }

    /// Réponse `echo` réussie
    pub fn echo_ok(payload: &str) -> Value {
        serde_json::json!({
            "success": true,
            "returnVal": { "payload": payload }
        })
    }

    /// Réponse `discovermotes` réussie: (serialport, EUI64, bootload_success)
    pub fn discover_ok(motes: &[(&str, Option<&str>, bool)]) -> Value {
        let motes: Vec<Value> = motes
            .iter()
            .map(|(port, eui64, bootloaded)| {
                let mut mote = serde_json::json!({
                    "serialport": port,
                    "bootload_success": bootloaded,
                });
                if let Some(eui64) = eui64 {
                    mote["EUI64"] = Value::String(eui64.to_string());
                }
                mote
            })
            .collect();

        serde_json::json!({
            "success": true,
            "returnVal": { "motes": motes }
        })
    }

    /// Résultat simple `{"success": bool}` (program, changesoftware)
    pub fn result(success: bool) -> Value {
        serde_json::json!({ "success": success })
    }

    /// Notification intermédiaire qu'une box publie avant la réponse finale
    pub fn exception(message: &str) -> Value {
        serde_json::json!({ "exception": message })
    }
}
