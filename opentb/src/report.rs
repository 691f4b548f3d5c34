//! End-of-invocation summary
//!
//! Aggregates the responses of one invocation and writes the operator
//! report through `tracing`.

use crate::models::{CommandKind, DeviceId, DiscoveredMote, Response, ResponseStatus};
use tracing::{error, info};

const RULE: &str = "-------------------------------------------------";

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub command: CommandKind,
    pub succeeded: Vec<Response>,
    pub failed: Vec<Response>,
    pub timed_out: Vec<DeviceId>,
    pub discovered: Vec<DiscoveredMote>,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.timed_out.len()
    }

    /// Recipients that actually answered
    pub fn answered(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn log(&self) {
        info!("{}", RULE);
        match self.command {
            CommandKind::Discover => {
                info!("Discovered {} motes", self.discovered.len());
                for mote in &self.discovered {
                    info!(
                        "    {} {} {} {}",
                        mote.box_id,
                        mote.eui64.as_deref().unwrap_or("None"),
                        mote.port,
                        u8::from(mote.bootloaded)
                    );
                }
            }
            CommandKind::Echo => {
                info!("{} otboxes responded", self.succeeded.len());
                for response in &self.succeeded {
                    info!("   {}: {}", response.device, response.message.as_deref().unwrap_or(""));
                }
            }
            CommandKind::Program | CommandKind::ChangeSoftware => {
                info!(
                    "{} of {} {} reported with success",
                    self.succeeded.len(),
                    self.answered(),
                    self.command.device_kind().label()
                );
                for response in &self.succeeded {
                    info!("    {} OK", response.device);
                }
                for response in &self.failed {
                    info!("    {} FAIL", response.device);
                }
            }
        }
        for device in &self.timed_out {
            info!("    {} MUTE", device);
        }
        info!("{}", RULE);
    }
}

/// Split responses by outcome, keeping arrival order inside each group
pub fn summarize(command: CommandKind, responses: &[Response]) -> Summary {
    let mut summary = Summary {
        command,
        succeeded: Vec::new(),
        failed: Vec::new(),
        timed_out: Vec::new(),
        discovered: Vec::new(),
    };

    for response in responses {
        match response.status {
            ResponseStatus::Success => {
                if command == CommandKind::Discover {
                    summary.discovered.extend(response.discovered_motes());
                }
                summary.succeeded.push(response.clone());
            }
            ResponseStatus::Failure => {
                match command {
                    CommandKind::Discover => error!("discover motes on box {} failed", response.device),
                    CommandKind::Echo => error!("'status' on box {} failed", response.device),
                    _ => {}
                }
                summary.failed.push(response.clone());
            }
            ResponseStatus::Timeout => summary.timed_out.push(response.device.clone()),
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentb_devkit::TestbedMessageBuilder as Msg;

    fn answer(device: &str, body: serde_json::Value) -> Response {
        Response::from_payload(device.into(), &serde_json::to_vec(&body).unwrap()).unwrap()
    }

    #[test]
    fn test_program_summary_counts() {
        let responses = vec![
            answer("00-12-4b-00-14-b5-b5-e4", Msg::result(true)),
            answer("00-12-4b-00-14-b5-b5-45", Msg::result(false)),
            Response::timeout("00-12-4b-00-14-b5-b5-01".into()),
        ];

        let summary = summarize(CommandKind::Program, &responses);

        assert_eq!(summary.succeeded.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.timed_out, vec!["00-12-4b-00-14-b5-b5-01"]);
        assert_eq!(summary.answered(), 2);
        assert_eq!(summary.total(), 3);
        assert!(summary.discovered.is_empty());
    }

    #[test]
    fn test_discover_collects_motes_from_every_box() {
        let responses = vec![
            answer(
                "otbox02",
                Msg::discover_ok(&[
                    ("/dev/ttyUSB0", Some("00-12-4b-00-14-b5-b5-45"), true),
                    ("/dev/ttyUSB1", None, false),
                ]),
            ),
            answer("otbox10", Msg::discover_ok(&[("/dev/ttyUSB3", Some("00-12-4b-00-14-b5-b5-e4"), true)])),
            answer("otbox11", Msg::result(false)),
        ];

        let summary = summarize(CommandKind::Discover, &responses);

        assert_eq!(summary.discovered.len(), 3);
        assert_eq!(summary.discovered[2].box_id, "otbox10");
        assert_eq!(summary.failed.len(), 1);
        summary.log();
    }
}
