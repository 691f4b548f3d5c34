//! MQTT data logger
//!
//! Subscribes to the testbed data topic and appends every message to a
//! JSON lines file until the runtime elapses or Ctrl-C is pressed.

use crate::config::DEFAULT_BROKER;
use crate::dispatcher::deadline_after;
use crate::logging::LogLevel;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

pub const LOGFILE_NAME: &str = "opentestbed";
pub const UDP_INJECT_TOPIC: &str = "opentestbed/uinject/arrived";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const USAGE_EXAMPLE: &str = "\
example:

    opentb-logger-cli testlogs
    opentb-logger-cli testlogs --runtime 60 --name dummyname
";

/// Command-line arguments of `opentb-logger-cli`
#[derive(Parser, Debug, Clone)]
#[command(name = "opentb-logger-cli")]
#[command(about = "Log OpenTestbed MQTT data to a file")]
#[command(after_help = USAGE_EXAMPLE)]
pub struct LoggerArgs {
    /// Logs directory
    #[arg(default_value = "logs")]
    pub directory: PathBuf,

    /// MQTT broker address
    #[arg(long, visible_alias = "b", default_value = DEFAULT_BROKER)]
    pub broker: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub port: u16,

    /// Default topic to subscribe for data
    #[arg(long, default_value = UDP_INJECT_TOPIC)]
    pub data_topic: String,

    /// Log file base name
    #[arg(long, visible_alias = "lf", default_value = LOGFILE_NAME)]
    pub name: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub loglevel: LogLevel,

    /// Logging time in seconds, 0 means until interrupted
    #[arg(long, visible_alias = "e", default_value_t = 0.0)]
    pub runtime: f64,

    /// Timestamp to append to log file name, creation time when not given
    #[arg(long, visible_alias = "t")]
    pub timestamp: Option<f64>,
}

#[derive(Serialize)]
struct LogRecord {
    timestamp: String,
    data: Value,
}

/// Create `{directory}/{name}_{timestamp}.jsonl`, refusing to reuse a file
pub async fn create_logfile(directory: &Path, name: &str, timestamp: Option<f64>) -> Result<PathBuf> {
    fs::create_dir_all(directory)
        .await
        .with_context(|| format!("Failed to create directory {}", directory.display()))?;

    // A given timestamp keeps its fractional part (`1600000000.0`), the default is whole seconds
    let timestamp = match timestamp {
        Some(ts) => format!("{:?}", ts),
        None => Local::now().timestamp().to_string(),
    };
    let file_name = format!("{}_{}.jsonl", name, timestamp);
    let path = directory.join(&file_name);

    if fs::try_exists(&path).await.unwrap_or(false) {
        bail!("Log file {} already exists", file_name);
    }

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to create a log file: {}", path.display()))?;

    Ok(path)
}

/// One JSON line for a received payload
pub fn format_record(payload: &[u8], received_at: DateTime<Local>) -> serde_json::Result<String> {
    let record = LogRecord {
        timestamp: received_at.format(TIMESTAMP_FORMAT).to_string(),
        data: serde_json::from_slice(payload)?,
    };
    serde_json::to_string(&record)
}

pub async fn append_record(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

/// Log until the runtime elapses or the process is interrupted
pub async fn run(args: &LoggerArgs) -> Result<()> {
    let logfile = create_logfile(&args.directory, &args.name, args.timestamp).await?;
    info!("Logging {} to {}", args.data_topic, logfile.display());

    let client_id = format!("opentb-logger-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let mut options = MqttOptions::new(client_id, &args.broker, args.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    let deadline = runtime_deadline(args.runtime, Instant::now());
    let runtime_elapsed = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(runtime_elapsed);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut runtime_elapsed => {
                info!("Runtime of {}s elapsed", args.runtime);
                break;
            }
            _ = &mut interrupted => {
                info!("Keyboard Interrupt, forced exit!");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("Connection succeeded");
                        // Clean session: subscribe again after every reconnect
                        client.try_subscribe(args.data_topic.as_str(), QoS::AtMostOnce)?;
                        info!("Subscribed to {}", args.data_topic);
                    } else {
                        error!("Connection failed: {:?}", ack.code);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    info!("Message received: {}", String::from_utf8_lossy(&publish.payload));
                    match format_record(&publish.payload, Local::now()) {
                        Ok(line) => append_record(&logfile, &line)
                            .await
                            .with_context(|| format!("Failed to write {}", logfile.display()))?,
                        Err(e) => warn!("Skipping non-JSON message on {}: {}", publish.topic, e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {}", e);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("Disconnect request failed: {}", e);
    }
    flush_disconnect(&mut eventloop).await;
    Ok(())
}

/// `None` runs until interrupted (runtime 0); a negative runtime stops at once
fn runtime_deadline(runtime: f64, now: Instant) -> Option<Instant> {
    if runtime == 0.0 {
        return None;
    }
    if runtime.is_nan() || runtime < 0.0 {
        return Some(now);
    }
    let run_for = Duration::try_from_secs_f64(runtime).unwrap_or(Duration::MAX);
    Some(deadline_after(now, run_for))
}

async fn flush_disconnect(eventloop: &mut EventLoop) {
    let drained = timeout(Duration::from_secs(2), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!("Broker did not see the DISCONNECT in time");
    }
}
