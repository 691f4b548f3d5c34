//! One invocation of the command helper
//!
//! Inputs are validated first, then the broker connection is opened, used
//! for one dispatch and closed on every exit path.

use crate::config::TestbedConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, DispatchResult};
use crate::firmware::FirmwareImage;
use crate::inventory::FleetInventory;
use crate::models::{BoardType, Command, CommandKind, TargetSelector};
use crate::report::{summarize, Summary};
use crate::software;
use crate::transport::{MqttTransport, Transport};
use std::future::Future;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Raw user input, as given on the command line
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: CommandKind,
    pub board: String,
    pub devices: Vec<String>,
    pub hexfile: Option<PathBuf>,
    pub url: Option<String>,
    pub version: Option<String>,
}

/// Validated command and selector
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: Command,
    pub selector: TargetSelector,
}

impl Invocation {
    /// Offline validation: selector, board, firmware image, URL syntax
    pub fn prepare(request: &CommandRequest) -> DispatchResult<Self> {
        let selector = TargetSelector::from_tokens(&request.devices)?;
        let board: BoardType = request.board.parse()?;

        let command = match request.command {
            CommandKind::Discover => Command::Discover,
            CommandKind::Echo => Command::Echo,
            CommandKind::Program => Command::Program {
                board,
                image: FirmwareImage::load(request.hexfile.as_deref(), board)?,
            },
            CommandKind::ChangeSoftware => {
                let url = request
                    .url
                    .as_deref()
                    .ok_or_else(|| DispatchError::InvalidSoftwareSource("provide an archive URL with --url".into()))?;
                software::parse_source(url)?;
                Command::ChangeSoftware {
                    url: url.to_string(),
                    version: request.version.clone(),
                }
            }
        };

        Ok(Self { command, selector })
    }
}

/// Dispatch on an open transport, then close it whatever happened
pub async fn execute<T: Transport>(
    transport: T,
    invocation: &Invocation,
    config: &TestbedConfig,
) -> DispatchResult<Summary> {
    let inventory = FleetInventory::from_config(config);
    let mut dispatcher = Dispatcher::new(transport, inventory, config.dispatch.addressing);

    let outcome = dispatcher
        .run(&invocation.command, &invocation.selector, config.response_timeout())
        .await;

    let mut transport = dispatcher.into_transport();
    if let Err(e) = transport.disconnect().await {
        warn!("Failed to close the broker connection: {}", e);
    }

    let responses = outcome?;
    let summary = summarize(invocation.command.kind(), &responses);
    summary.log();
    Ok(summary)
}

/// Validate, connect through `connect`, dispatch and report
pub async fn run_with<T, F, Fut>(request: &CommandRequest, config: &TestbedConfig, connect: F) -> DispatchResult<Summary>
where
    T: Transport,
    F: FnOnce() -> Fut,
    Fut: Future<Output = DispatchResult<T>>,
{
    let invocation = Invocation::prepare(request)?;

    if let Command::ChangeSoftware { url, .. } = &invocation.command {
        software::verify_source(url).await?;
    }

    debug!("Input validated, connecting");
    let transport = connect().await?;
    execute(transport, &invocation, config).await
}

/// Run against the configured MQTT broker
pub async fn run(request: &CommandRequest, config: &TestbedConfig) -> DispatchResult<Summary> {
    let client_id = config.client_id();
    run_with(request, config, || MqttTransport::connect(&config.mqtt, &client_id)).await
}
