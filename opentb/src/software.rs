//! Software archive check for `changesoftware`
//!
//! Boxes download the archive themselves, so a bad URL would only show up
//! as a fleet of failed responses. The URL is checked once before dispatch.

use crate::error::{DispatchError, DispatchResult};
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, warn};

const CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Parse `url` and make sure it answers a GET
pub async fn verify_source(url: &str) -> DispatchResult<Url> {
    let parsed = parse_source(url)?;

    let client = reqwest::Client::builder()
        .timeout(CHECK_TIMEOUT)
        .build()
        .map_err(|e| DispatchError::InvalidSoftwareSource(e.to_string()))?;

    // Only the headers are read; the archive body is never downloaded
    let response = client
        .get(parsed.clone())
        .header("User-Agent", "opentb")
        .send()
        .await
        .map_err(|e| {
            warn!("Cannot verify the URL");
            DispatchError::InvalidSoftwareSource(format!("{}: {}", url, e))
        })?;

    if !response.status().is_success() {
        return Err(DispatchError::InvalidSoftwareSource(format!(
            "{} answered {}",
            url,
            response.status()
        )));
    }

    debug!("URL verified successfully");
    Ok(parsed)
}

/// Syntax check only, no network
pub fn parse_source(url: &str) -> DispatchResult<Url> {
    let parsed = Url::parse(url).map_err(|e| DispatchError::InvalidSoftwareSource(format!("{}: {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DispatchError::InvalidSoftwareSource(format!(
            "unsupported scheme '{}' in {}",
            other, url
        ))),
    }
}
