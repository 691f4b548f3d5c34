//! Value types exchanged with the testbed
//!
//! Commands, target selectors and responses are built once per invocation
//! and never persisted.

use crate::error::{DispatchError, DispatchResult};
use crate::firmware::FirmwareImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Box id (`otbox02`) or mote EUI64 (`00-12-4b-00-14-b5-b5-45`)
pub type DeviceId = String;

/// Token echoed back by the boxes, fixed by the testbed firmware
pub const REQUEST_TOKEN: u32 = 123;

/// Literal device token addressing the whole fleet
pub const ALL_DEVICES: &str = "all";

/// Echo test string
pub const ECHO_TEST_STRING: &str = "Echo Test String";

/// Which side of the testbed a command talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Box,
    Mote,
}

impl DeviceKind {
    pub fn base_topic(self) -> &'static str {
        match self {
            DeviceKind::Box => "opentestbed/deviceType/box/deviceId",
            DeviceKind::Mote => "opentestbed/deviceType/mote/deviceId",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DeviceKind::Box => "otboxes",
            DeviceKind::Mote => "motes",
        }
    }
}

/// Command selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CommandKind {
    Discover,
    Echo,
    Program,
    #[value(name = "changesoftware")]
    ChangeSoftware,
}

impl CommandKind {
    /// Name used in the `cmd/` and `resp/` topic segments
    pub fn wire_name(self) -> &'static str {
        match self {
            CommandKind::Discover => "discovermotes",
            CommandKind::Echo => "echo",
            CommandKind::Program => "program",
            CommandKind::ChangeSoftware => "changesoftware",
        }
    }

    pub fn device_kind(self) -> DeviceKind {
        match self {
            CommandKind::Program => DeviceKind::Mote,
            CommandKind::Discover | CommandKind::Echo | CommandKind::ChangeSoftware => DeviceKind::Box,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Discover => "discover",
            CommandKind::Echo => "echo",
            CommandKind::Program => "program",
            CommandKind::ChangeSoftware => "changesoftware",
        };
        f.write_str(name)
    }
}

/// Hardware variant of a mote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardType {
    OpenmoteB,
}

impl BoardType {
    pub fn as_str(self) -> &'static str {
        match self {
            BoardType::OpenmoteB => "openmote-b",
        }
    }

    /// Total flash size in bytes
    pub fn flash_size(self) -> u64 {
        match self {
            BoardType::OpenmoteB => 512 * 1024,
        }
    }

    /// Flash page size; the last page holds the CC2538 customer configuration area
    pub fn flash_page_size(self) -> u64 {
        match self {
            BoardType::OpenmoteB => 2048,
        }
    }
}

impl FromStr for BoardType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openmote-b" => Ok(BoardType::OpenmoteB),
            _ => Err(DispatchError::UnsupportedBoard(s.to_string())),
        }
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated command, ready to be encoded
#[derive(Debug, Clone)]
pub enum Command {
    Discover,
    Echo,
    Program {
        board: BoardType,
        image: FirmwareImage,
    },
    ChangeSoftware {
        url: String,
        version: Option<String>,
    },
}

#[derive(Serialize)]
struct EchoPayload<'a> {
    token: u32,
    payload: &'a str,
}

#[derive(Serialize)]
struct DiscoverPayload {
    token: u32,
}

#[derive(Serialize)]
struct ProgramPayload<'a> {
    token: u32,
    description: &'a str,
    hex: String,
}

#[derive(Serialize)]
struct ChangeSoftwarePayload<'a> {
    token: u32,
    version: Option<&'a str>,
    url: &'a str,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Discover => CommandKind::Discover,
            Command::Echo => CommandKind::Echo,
            Command::Program { .. } => CommandKind::Program,
            Command::ChangeSoftware { .. } => CommandKind::ChangeSoftware,
        }
    }

    /// JSON body published on every `cmd/` topic of this invocation
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Command::Discover => serde_json::to_vec(&DiscoverPayload { token: REQUEST_TOKEN }),
            Command::Echo => serde_json::to_vec(&EchoPayload {
                token: REQUEST_TOKEN,
                payload: ECHO_TEST_STRING,
            }),
            Command::Program { image, .. } => serde_json::to_vec(&ProgramPayload {
                token: REQUEST_TOKEN,
                description: image.name(),
                hex: image.to_base64(),
            }),
            Command::ChangeSoftware { url, version } => serde_json::to_vec(&ChangeSoftwarePayload {
                token: REQUEST_TOKEN,
                version: version.as_deref(),
                url,
            }),
        }
    }
}

/// Wildcard or explicit list of recipients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    All,
    Explicit(Vec<DeviceId>),
}

impl TargetSelector {
    /// Build a selector from `--devices` tokens
    ///
    /// A lone `all` is the wildcard. Duplicates are dropped keeping the first
    /// occurrence. An empty list, or `all` mixed with explicit ids, is rejected.
    pub fn from_tokens<I, S>(tokens: I) -> DispatchResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .collect();

        if tokens.iter().any(|t| t.is_empty()) {
            return Err(DispatchError::InvalidSelector("empty device identifier".into()));
        }

        if tokens.iter().any(|t| t == ALL_DEVICES) {
            if tokens.len() == 1 {
                return Ok(TargetSelector::All);
            }
            return Err(DispatchError::InvalidSelector(
                "'all' cannot be combined with explicit devices".into(),
            ));
        }

        let total = tokens.len();
        let devices = dedup_preserving_order(tokens);
        if devices.is_empty() {
            return Err(DispatchError::InvalidSelector("no device given".into()));
        }
        if devices.len() != total {
            warn!("{} duplicates removed", total - devices.len());
        }

        Ok(TargetSelector::Explicit(devices))
    }
}

pub(crate) fn dedup_preserving_order(ids: Vec<DeviceId>) -> Vec<DeviceId> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Failure,
    Timeout,
}

/// Outcome reported for one addressed recipient
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub device: DeviceId,
    pub status: ResponseStatus,
    /// `returnVal` of the device answer, if any
    pub payload: Option<Value>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    success: Option<bool>,
    #[serde(rename = "returnVal")]
    return_val: Option<Value>,
    exception: Option<Value>,
}

impl Response {
    pub fn timeout(device: DeviceId) -> Self {
        Self {
            device,
            status: ResponseStatus::Timeout,
            payload: None,
            message: Some("no response before timeout".into()),
        }
    }

    /// Parse a device answer; `None` for intermediate `exception` notices
    pub fn from_payload(device: DeviceId, payload: &[u8]) -> Option<Self> {
        let raw: RawResponse = match serde_json::from_slice(payload) {
            Ok(raw) => raw,
            Err(e) => {
                return Some(Self {
                    device,
                    status: ResponseStatus::Failure,
                    payload: None,
                    message: Some(format!("invalid response payload: {}", e)),
                })
            }
        };

        if raw.exception.is_some() {
            return None;
        }

        let status = if raw.success.unwrap_or(false) {
            ResponseStatus::Success
        } else {
            ResponseStatus::Failure
        };
        let message = raw
            .return_val
            .as_ref()
            .and_then(|v| v.get("payload"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Self {
            device,
            status,
            payload: raw.return_val,
            message,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Motes listed in a `discovermotes` answer
    pub fn discovered_motes(&self) -> Vec<DiscoveredMote> {
        let Some(motes) = self
            .payload
            .as_ref()
            .and_then(|v| v.get("motes"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        motes
            .iter()
            .map(|mote| DiscoveredMote {
                box_id: self.device.clone(),
                port: mote
                    .get("serialport")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                eui64: mote.get("EUI64").and_then(Value::as_str).map(str::to_string),
                bootloaded: mote
                    .get("bootload_success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredMote {
    pub box_id: DeviceId,
    pub port: String,
    pub eui64: Option<String>,
    pub bootloaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_wildcard() {
        assert_eq!(TargetSelector::from_tokens(["all"]).unwrap(), TargetSelector::All);
    }

    #[test]
    fn test_selector_dedups_in_order() {
        let selector = TargetSelector::from_tokens(["otbox10", "otbox02", "otbox10"]).unwrap();
        assert_eq!(
            selector,
            TargetSelector::Explicit(vec!["otbox10".into(), "otbox02".into()])
        );
    }

    #[test]
    fn test_selector_rejects_empty_and_mixed() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            TargetSelector::from_tokens(empty),
            Err(DispatchError::InvalidSelector(_))
        ));
        assert!(matches!(
            TargetSelector::from_tokens(["all", "otbox02"]),
            Err(DispatchError::InvalidSelector(_))
        ));
        assert!(matches!(
            TargetSelector::from_tokens(["  "]),
            Err(DispatchError::InvalidSelector(_))
        ));
    }

    #[test]
    fn test_board_parsing() {
        assert_eq!("openmote-b".parse::<BoardType>().unwrap(), BoardType::OpenmoteB);
        assert_eq!("OpenMote-B".parse::<BoardType>().unwrap(), BoardType::OpenmoteB);
        assert!(matches!(
            "telosb".parse::<BoardType>(),
            Err(DispatchError::UnsupportedBoard(b)) if b == "telosb"
        ));
    }

    #[test]
    fn test_command_routing() {
        assert_eq!(CommandKind::Discover.wire_name(), "discovermotes");
        assert_eq!(CommandKind::Program.device_kind(), DeviceKind::Mote);
        assert_eq!(CommandKind::Echo.device_kind(), DeviceKind::Box);
        assert_eq!(CommandKind::ChangeSoftware.to_string(), "changesoftware");
    }

    #[test]
    fn test_echo_and_change_software_encoding() {
        let echo: Value = serde_json::from_slice(&Command::Echo.encode().unwrap()).unwrap();
        assert_eq!(echo, serde_json::json!({"token": 123, "payload": "Echo Test String"}));

        let change = Command::ChangeSoftware {
            url: "https://example.org/develop.zip".into(),
            version: None,
        };
        let change: Value = serde_json::from_slice(&change.encode().unwrap()).unwrap();
        assert_eq!(change["url"], "https://example.org/develop.zip");
        assert!(change["version"].is_null());
    }

    #[test]
    fn test_response_parsing() {
        let ok = Response::from_payload(
            "otbox02".into(),
            br#"{"success": true, "returnVal": {"payload": "Echo Test String"}}"#,
        )
        .unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.message.as_deref(), Some("Echo Test String"));

        let failed = Response::from_payload("m1".into(), br#"{"success": false}"#).unwrap();
        assert_eq!(failed.status, ResponseStatus::Failure);

        assert!(Response::from_payload("m1".into(), br#"{"exception": "busy"}"#).is_none());

        let garbage = Response::from_payload("m1".into(), b"not json").unwrap();
        assert_eq!(garbage.status, ResponseStatus::Failure);
    }

    #[test]
    fn test_discovered_motes() {
        let resp = Response::from_payload(
            "otbox02".into(),
            br#"{"success": true, "returnVal": {"motes": [
                {"serialport": "/dev/ttyUSB0", "EUI64": "00-12-4b-00-14-b5-b5-45", "bootload_success": true},
                {"serialport": "/dev/ttyUSB1", "bootload_success": false}
            ]}}"#,
        )
        .unwrap();

        let motes = resp.discovered_motes();
        assert_eq!(motes.len(), 2);
        assert_eq!(motes[0].box_id, "otbox02");
        assert_eq!(motes[0].eui64.as_deref(), Some("00-12-4b-00-14-b5-b5-45"));
        assert!(motes[0].bootloaded);
        assert_eq!(motes[1].eui64, None);
    }
}
