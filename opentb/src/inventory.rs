//! Fleet inventory used to resolve the `all` selector
//!
//! Device lists from the config file win. When the list for the needed
//! device kind is empty, a `discovermotes` round-trip on the box group
//! address tells which boxes are alive and which motes they carry. It stops
//! early once the whole fleet answered: every box for box commands, every
//! mote for mote commands.

use crate::config::TestbedConfig;
use crate::dispatcher::deadline_after;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{dedup_preserving_order, Command, CommandKind, DeviceId, DeviceKind, Response};
use crate::topics;
use crate::transport::Transport;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FleetInventory {
    boxes: Vec<DeviceId>,
    motes: Vec<DeviceId>,
    /// Fleet size; discovery stops early once it is reached
    expected_boxes: usize,
    expected_motes: usize,
    discovery_timeout: Duration,
}

impl FleetInventory {
    pub fn new(
        boxes: Vec<DeviceId>,
        motes: Vec<DeviceId>,
        expected_boxes: usize,
        expected_motes: usize,
        discovery_timeout: Duration,
    ) -> Self {
        Self {
            boxes: dedup_preserving_order(boxes),
            motes: dedup_preserving_order(motes),
            expected_boxes,
            expected_motes,
            discovery_timeout,
        }
    }

    pub fn from_config(config: &TestbedConfig) -> Self {
        Self::new(
            config.fleet.inventory.boxes.clone(),
            config.fleet.inventory.motes.clone(),
            config.fleet.boxes,
            config.fleet.motes,
            config.discovery_timeout(),
        )
    }

    /// Every device of `kind` currently in the fleet
    pub async fn resolve_all<T>(&self, kind: DeviceKind, transport: &mut T) -> DispatchResult<Vec<DeviceId>>
    where
        T: Transport + ?Sized,
    {
        let known = match kind {
            DeviceKind::Box => &self.boxes,
            DeviceKind::Mote => &self.motes,
        };
        if !known.is_empty() {
            debug!("Resolved 'all' to {} {} from inventory", known.len(), kind.label());
            return Ok(known.clone());
        }

        let answers = self.discover(kind, transport).await?;
        let devices: Vec<DeviceId> = match kind {
            DeviceKind::Box => answers
                .iter()
                .filter(|r| r.is_success())
                .map(|r| r.device.clone())
                .collect(),
            DeviceKind::Mote => answers
                .iter()
                .filter(|r| r.is_success())
                .flat_map(|r| r.discovered_motes())
                .filter_map(|m| m.eui64)
                .collect(),
        };
        let devices = dedup_preserving_order(devices);

        if devices.is_empty() {
            return Err(DispatchError::InvalidSelector(format!(
                "fleet discovery found no {}",
                kind.label()
            )));
        }

        info!("Resolved 'all' to {} {} by discovery", devices.len(), kind.label());
        Ok(devices)
    }

    async fn discover<T>(&self, kind: DeviceKind, transport: &mut T) -> DispatchResult<Vec<Response>>
    where
        T: Transport + ?Sized,
    {
        let command = CommandKind::Discover;
        info!("Discovering the fleet (waiting up to {}s)", self.discovery_timeout.as_secs());

        transport
            .subscribe(&topics::wildcard_resp_topic(DeviceKind::Box, command))
            .await?;
        transport
            .publish(
                &topics::group_cmd_topic(DeviceKind::Box, command),
                Command::Discover.encode()?,
            )
            .await?;

        let deadline = deadline_after(Instant::now(), self.discovery_timeout);
        let mut answered = HashSet::new();
        let mut answers = Vec::new();
        let mut motes_found = 0;

        while answered.len() < self.expected_boxes
            && !(kind == DeviceKind::Mote && motes_found >= self.expected_motes)
        {
            match timeout_at(deadline, transport.next_message()).await {
                Ok(Some(message)) => {
                    let Some(box_id) =
                        topics::device_from_resp_topic(&message.topic, DeviceKind::Box, command)
                    else {
                        continue;
                    };
                    if answered.contains(box_id) {
                        continue;
                    }
                    if let Some(response) = Response::from_payload(box_id.to_string(), &message.payload) {
                        if response.is_success() {
                            motes_found += response
                                .discovered_motes()
                                .iter()
                                .filter(|mote| mote.eui64.is_some())
                                .count();
                        }
                        answered.insert(box_id.to_string());
                        answers.push(response);
                    }
                }
                Ok(None) => {
                    warn!("Connection lost during discovery");
                    return Err(DispatchError::TransportUnavailable(
                        "connection lost during fleet discovery".into(),
                    ));
                }
                Err(_) => {
                    warn!(
                        "Discovery timeout: {} of {} boxes answered",
                        answered.len(),
                        self.expected_boxes
                    );
                    break;
                }
            }
        }

        Ok(answers)
    }
}
