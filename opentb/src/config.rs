//! Configuration of the testbed client
//!
//! Loaded once at startup:
//! - `.env` (dotenvy) if present
//! - YAML file from `OPENTB_CONFIG` (default `opentb.yaml`), defaults when absent
//! - `OPENTB_BROKER` / `OPENTB_BROKER_PORT` environment overrides

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

pub const DEFAULT_BROKER: &str = "argus.paris.inria.fr";
pub const DEFAULT_CONFIG_FILE: &str = "opentb.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    pub mqtt: MqttConfig,
    pub dispatch: DispatchConfig,
    pub fleet: FleetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// A random suffix is appended per invocation
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Must hold a base64 encoded firmware image
    pub max_packet_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Should exceed the time from publish until the slowest answer
    pub response_timeout_secs: u64,
    pub addressing: AddressingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// One publish per recipient
    FanOut,
    /// One publish on the `all` group address when the selector is `all`
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub motes: usize,
    pub boxes: usize,
    pub discovery_timeout_secs: u64,
    pub inventory: InventoryConfig,
}

/// Known device ids; an empty list is resolved by a discovery round-trip
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub boxes: Vec<String>,
    pub motes: Vec<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER.to_string(),
            port: 1883,
            client_id_prefix: "OpenWSN".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            max_packet_size: 2 * 1024 * 1024,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: 60,
            addressing: AddressingMode::FanOut,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            motes: 76,
            boxes: 19,
            discovery_timeout_secs: 60,
            inventory: InventoryConfig::default(),
        }
    }
}

impl TestbedConfig {
    /// Load `.env`, the YAML file named by `OPENTB_CONFIG`, then env overrides
    pub async fn load() -> Self {
        dotenvy::dotenv().ok(); // Ok si .env n'existe pas

        let path = std::env::var("OPENTB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        let mut config = Self::load_from(&path).await;
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Read a YAML file, falling back to defaults when absent or invalid
    pub async fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No {}, using default configuration", path.display());
            return Self::default();
        }

        let txt = match fs::read_to_string(path).await {
            Ok(txt) => txt,
            Err(e) => {
                warn!("Cannot read {}: {}, using default configuration", path.display(), e);
                return Self::default();
            }
        };
        if txt.trim().is_empty() {
            return Self::default();
        }

        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("Invalid configuration {}: {}, using default configuration", path.display(), e);
            Self::default()
        })
    }

    /// Apply `OPENTB_BROKER` / `OPENTB_BROKER_PORT` from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("OPENTB_BROKER").filter(|h| !h.trim().is_empty()) {
            self.mqtt.host = host.trim().to_string();
        }
        if let Some(port) = lookup("OPENTB_BROKER_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => warn!("Ignoring invalid OPENTB_BROKER_PORT '{}'", port),
            }
        }
    }

    /// Client id unique to this invocation
    pub fn client_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.mqtt.client_id_prefix, &suffix[..8])
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.response_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.fleet.discovery_timeout_secs)
    }
}
