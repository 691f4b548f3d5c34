//! MQTT topic layout of the testbed
//!
//! `opentestbed/deviceType/{box|mote}/deviceId/{id}/{cmd|resp}/{command}`

use crate::models::{CommandKind, DeviceKind, ALL_DEVICES};

pub fn cmd_topic(kind: DeviceKind, device: &str, command: CommandKind) -> String {
    format!("{}/{}/cmd/{}", kind.base_topic(), device, command.wire_name())
}

pub fn resp_topic(kind: DeviceKind, device: &str, command: CommandKind) -> String {
    format!("{}/{}/resp/{}", kind.base_topic(), device, command.wire_name())
}

/// Group address reaching every device of a kind
pub fn group_cmd_topic(kind: DeviceKind, command: CommandKind) -> String {
    cmd_topic(kind, ALL_DEVICES, command)
}

/// Single-level wildcard matching every device answer
pub fn wildcard_resp_topic(kind: DeviceKind, command: CommandKind) -> String {
    resp_topic(kind, "+", command)
}

/// Extract the device id from a response topic, `None` if the topic is for another command
pub fn device_from_resp_topic(topic: &str, kind: DeviceKind, command: CommandKind) -> Option<&str> {
    let suffix = format!("/resp/{}", command.wire_name());
    let device = topic
        .strip_prefix(kind.base_topic())?
        .strip_prefix('/')?
        .strip_suffix(suffix.as_str())?;

    if device.is_empty() || device.contains('/') {
        None
    } else {
        Some(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(
            cmd_topic(DeviceKind::Box, "otbox02", CommandKind::Echo),
            "opentestbed/deviceType/box/deviceId/otbox02/cmd/echo"
        );
        assert_eq!(
            resp_topic(DeviceKind::Mote, "00-12-4b-00-14-b5-b5-45", CommandKind::Program),
            "opentestbed/deviceType/mote/deviceId/00-12-4b-00-14-b5-b5-45/resp/program"
        );
        assert_eq!(
            group_cmd_topic(DeviceKind::Box, CommandKind::Discover),
            "opentestbed/deviceType/box/deviceId/all/cmd/discovermotes"
        );
        assert_eq!(
            wildcard_resp_topic(DeviceKind::Box, CommandKind::Discover),
            "opentestbed/deviceType/box/deviceId/+/resp/discovermotes"
        );
    }

    #[test]
    fn test_device_from_resp_topic() {
        let topic = resp_topic(DeviceKind::Box, "otbox10", CommandKind::Echo);
        assert_eq!(
            device_from_resp_topic(&topic, DeviceKind::Box, CommandKind::Echo),
            Some("otbox10")
        );

        // Other command, other kind, or a command topic
        assert_eq!(device_from_resp_topic(&topic, DeviceKind::Box, CommandKind::Discover), None);
        assert_eq!(device_from_resp_topic(&topic, DeviceKind::Mote, CommandKind::Echo), None);
        let cmd = cmd_topic(DeviceKind::Box, "otbox10", CommandKind::Echo);
        assert_eq!(device_from_resp_topic(&cmd, DeviceKind::Box, CommandKind::Echo), None);
    }
}
