/*!
# OpenTestbed DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement et les tests de `opentb` avec:
- Stub MQTT pour tests sans broker
- Réponses canoniques des boxes et des motes du testbed
- Fixtures de firmware (Intel HEX / binaire) sur disque temporaire
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockMqttClient, TestbedMessageBuilder};
pub use test_utils::FirmwareFixtures;
