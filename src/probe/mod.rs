//! Probe module for reachability checks.
//!
//! Supports HTTP and Ping probes.

mod http;
mod ping;

pub use http::*;
pub use ping::*;

use crate::config::{ProbeKind, ProbeSpec};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),
    #[error("ping probe unfinished: {received}/{sent} replies received")]
    PacketLoss { sent: u32, received: u32 },
    #[error("command failed: {0}")]
    Command(String),
}

/// Outcome of one check. Only success or failure folds into the monitor.
pub type ProbeResult = Result<(), ProbeError>;

/// A single health check against one target.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn check(&self, spec: &ProbeSpec) -> ProbeResult;
}

/// Production prober, dispatching on the probe kind.
#[derive(Clone)]
pub struct NetProber {
    client: reqwest::Client,
}

impl NetProber {
    /// The client is shared by every HTTP probe so connections are reused.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Prober for NetProber {
    async fn check(&self, spec: &ProbeSpec) -> ProbeResult {
        match &spec.kind {
            ProbeKind::Http { url } => run_http_probe(&self.client, url, spec.timeout).await,
            ProbeKind::Icmp { host } => run_ping_probe(host).await,
        }
    }
}
