//! HTTP probe implementation.

use std::time::Duration;
use reqwest::StatusCode;
use super::{ProbeError, ProbeResult};

/// Whether a response status counts as reachable.
///
/// 204 is what connectivity-check endpoints return; 200 covers ordinary
/// health pages.
pub fn is_healthy_status(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::NO_CONTENT
}

/// Run an HTTP probe against the given URL.
pub async fn run_http_probe(client: &reqwest::Client, url: &str, timeout: Duration) -> ProbeResult {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify(e, timeout))?;

    let status = response.status();

    // Drain the body so the connection goes back to the pool
    response.bytes().await.map_err(|e| classify(e, timeout))?;

    if is_healthy_status(status) {
        Ok(())
    } else {
        Err(ProbeError::UnexpectedStatus(status.as_u16()))
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Network(e.to_string())
    }
}
