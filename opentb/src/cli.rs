//! Command-line interface of `opentb-cli`

use crate::app::CommandRequest;
use crate::config::TestbedConfig;
use crate::logging::LogLevel;
use crate::models::{BoardType, CommandKind, ALL_DEVICES};
use clap::Parser;
use std::path::PathBuf;

const USAGE_EXAMPLE: &str = "\
example:
- discover motes 'echo':
    opentb-cli echo --d otbox02 otbox10

- discover motes 'discover':
    opentb-cli discover --d otbox02

- program motes 'program':
    opentb-cli program --b openmote-b --x example/main.ihex
             --d 00-12-4b-00-14-b5-b5-45 00-12-4b-00-14-b5-b5-e4
    opentb-cli program --b openmote-b --d all --x example/main.ihex

- change software 'changesoftware':
    opentb-cli changesoftware --url \"https://github.com/openwsn-berkeley/opentestbed/archive/develop.zip\" --version develop
";

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "opentb-cli")]
#[command(about = "Send MQTT commands to OpenWSN OpenTestbed boxes and motes")]
#[command(after_help = USAGE_EXAMPLE)]
pub struct Cli {
    /// Supported MQTT commands
    #[arg(value_enum)]
    pub command: CommandKind,

    /// Board name (only openmote-b is currently supported)
    #[arg(long, visible_alias = "b", default_value = BoardType::OpenmoteB.as_str())]
    pub board: String,

    /// Mote address or otbox id, 'all' for devices
    #[arg(long, visible_alias = "d", num_args = 1.., default_value = ALL_DEVICES)]
    pub devices: Vec<String>,

    /// Hexfile program to bootload
    #[arg(long, visible_aliases = ["x", "flashfile"], value_name = "HEXFILE")]
    pub hexfile: Option<PathBuf>,

    /// URL where otbox should fetch the zip file containing new software to run
    #[arg(long, visible_alias = "u")]
    pub url: Option<String>,

    /// Version identifier
    #[arg(long = "version", visible_alias = "v", value_name = "VERSION")]
    pub software_version: Option<String>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub loglevel: LogLevel,

    /// MQTT broker address (overrides config)
    #[arg(long)]
    pub broker: Option<String>,

    /// MQTT broker port (overrides config)
    #[arg(long)]
    pub port: Option<u16>,

    /// Response timeout in seconds (overrides config)
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl Cli {
    /// Apply the command-line overrides on top of the loaded config
    pub fn apply_to(&self, config: &mut TestbedConfig) {
        if let Some(broker) = &self.broker {
            config.mqtt.host = broker.clone();
        }
        if let Some(port) = self.port {
            config.mqtt.port = port;
        }
        if let Some(timeout) = self.timeout {
            config.dispatch.response_timeout_secs = timeout;
        }
    }

    pub fn into_request(self) -> CommandRequest {
        CommandRequest {
            command: self.command,
            board: self.board,
            devices: self.devices,
            hexfile: self.hexfile,
            url: self.url,
            version: self.software_version,
        }
    }
}
