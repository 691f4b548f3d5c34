//! OpenTestbed command helper
//!
//! Sends MQTT commands to the boxes and motes of an OpenWSN OpenTestbed:
//! - `discover`: list the motes attached to each box
//! - `echo`: liveness check of the boxes
//! - `program`: flash a firmware image on motes
//! - `changesoftware`: make boxes fetch and run new software
//!
//! The `data_logger` module backs the `opentb-logger-cli` binary.

pub mod app;
pub mod cli;
pub mod config;
pub mod data_logger;
pub mod dispatcher;
pub mod error;
pub mod firmware;
pub mod inventory;
pub mod logging;
pub mod models;
pub mod report;
pub mod software;
pub mod topics;
pub mod transport;

pub use error::{DispatchError, DispatchResult};
