//! Error taxonomy for a testbed invocation
//!
//! Validation errors are raised before anything is published so a bad input
//! never produces a partial fan-out. A recipient that stays silent is not an
//! error: it is reported as a `Timeout` response.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Empty or malformed device list
    #[error("invalid device selector: {0}")]
    InvalidSelector(String),

    /// Board tag not recognized
    #[error("unsupported board '{0}' (only openmote-b is currently supported)")]
    UnsupportedBoard(String),

    /// Firmware image absent or unreadable
    #[error("missing firmware: {0}")]
    MissingFirmware(String),

    /// Firmware image readable but rejected for the target board
    #[error("invalid firmware image {path}: {reason}")]
    InvalidFirmware { path: String, reason: String },

    /// Software archive URL missing, malformed or unreachable
    #[error("invalid software source: {0}")]
    InvalidSoftwareSource(String),

    /// Command payload could not be serialized
    #[error("failed to encode command payload: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Broker unreachable or connection lost before dispatch was confirmed
    #[error("MQTT transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl DispatchError {
    /// True for errors detected before any connection or publish
    pub fn is_validation(&self) -> bool {
        !matches!(self, DispatchError::TransportUnavailable(_))
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
