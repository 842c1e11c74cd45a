//! Remediation module: running the recovery command on a remote host.

mod ssh;

pub use ssh::*;

use crate::config::RemediationTarget;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Remediation error types.
#[derive(Error, Debug)]
pub enum RemediationError {
    #[error("failed to load key file: {0}")]
    Key(String),
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("authentication rejected for user {0}")]
    AuthRejected(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("command exited with status {exit_status}")]
    CommandFailed { exit_status: u32, output: String },
    #[error("command finished without an exit status")]
    ExitStatusMissing { output: String },
    #[error("remediation timed out after {0:?}")]
    Timeout(Duration),
}

impl RemediationError {
    /// Whatever the command printed before failing, if it got that far.
    pub fn output(&self) -> Option<&str> {
        match self {
            RemediationError::CommandFailed { output, .. }
            | RemediationError::ExitStatusMissing { output } => Some(output),
            _ => None,
        }
    }
}

/// Runs a target's recovery command. Returns the captured output.
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn remediate(&self, target: &RemediationTarget) -> Result<String, RemediationError>;
}
