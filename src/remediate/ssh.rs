//! SSH remediation using russh.
//!
//! Every attempt dials a fresh connection, runs one command on one session
//! and disconnects. Host keys are not checked.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;

use super::{RemediationError, Remediator};
use crate::config::RemediationTarget;

/// Accepts whatever host key the server presents.
struct AcceptAnyHost;

#[async_trait]
impl client::Handler for AcceptAnyHost {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Production remediator over SSH.
pub struct SshRemediator {
    config: Arc<client::Config>,
}

impl SshRemediator {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }

    async fn run(
        &self,
        target: &RemediationTarget,
        key: Option<key::KeyPair>,
    ) -> Result<String, RemediationError> {
        let mut session = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            AcceptAnyHost,
        )
        .await
        .map_err(|e| RemediationError::Connect(e.to_string()))?;

        let result = match authenticate(&mut session, target, key).await {
            Ok(()) => exec(&session, &target.command).await,
            Err(e) => Err(e),
        };

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!("disconnect from {} failed: {}", target.address(), e);
        }

        result
    }
}

impl Default for SshRemediator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Remediator for SshRemediator {
    async fn remediate(&self, target: &RemediationTarget) -> Result<String, RemediationError> {
        // Load the key before dialing so a bad key file fails fast
        let key = target.key_file.as_deref().map(load_key).transpose()?;

        tokio::time::timeout(target.timeout, self.run(target, key))
            .await
            .map_err(|_| RemediationError::Timeout(target.timeout))?
    }
}

fn load_key(path: &Path) -> Result<key::KeyPair, RemediationError> {
    russh_keys::load_secret_key(path, None)
        .map_err(|e| RemediationError::Key(format!("{}: {}", path.display(), e)))
}

/// The authentication calls `authenticate` needs from a session.
#[async_trait]
trait AuthSession: Send {
    type Key: Send;

    async fn password(&mut self, user: &str, password: &str) -> Result<bool, russh::Error>;
    async fn publickey(&mut self, user: &str, key: Self::Key) -> Result<bool, russh::Error>;
}

#[async_trait]
impl AuthSession for Handle<AcceptAnyHost> {
    type Key = key::KeyPair;

    async fn password(&mut self, user: &str, password: &str) -> Result<bool, russh::Error> {
        self.authenticate_password(user, password).await
    }

    async fn publickey(&mut self, user: &str, key: key::KeyPair) -> Result<bool, russh::Error> {
        self.authenticate_publickey(user, Arc::new(key)).await
    }
}

/// Try password, then key, stopping at the first method the server accepts.
async fn authenticate<S: AuthSession>(
    session: &mut S,
    target: &RemediationTarget,
    key: Option<S::Key>,
) -> Result<(), RemediationError> {
    let user = target.username.as_str();

    if let Some(password) = target.password.as_deref() {
        let accepted = session
            .password(user, password)
            .await
            .map_err(|e| RemediationError::Session(e.to_string()))?;
        if accepted {
            return Ok(());
        }
        tracing::debug!("password rejected by {} for {}", target.address(), user);
    }

    if let Some(key) = key {
        let accepted = session
            .publickey(user, key)
            .await
            .map_err(|e| RemediationError::Session(e.to_string()))?;
        if accepted {
            return Ok(());
        }
        tracing::debug!("public key rejected by {} for {}", target.address(), user);
    }

    Err(RemediationError::AuthRejected(user.to_string()))
}

/// What a command channel produced: output and, if reported, its exit status.
#[derive(Debug, Default)]
struct CommandOutput {
    output: Vec<u8>,
    exit_status: Option<u32>,
}

impl CommandOutput {
    fn absorb(&mut self, msg: &ChannelMsg) {
        match msg {
            ChannelMsg::Data { data } => self.output.extend_from_slice(data),
            // stderr is folded into the same buffer
            ChannelMsg::ExtendedData { data, .. } => self.output.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_status = Some(*exit_status),
            _ => {}
        }
    }

    /// Only a zero exit status counts as success.
    fn into_result(self) -> Result<String, RemediationError> {
        let output = String::from_utf8_lossy(&self.output).into_owned();
        match self.exit_status {
            Some(0) => Ok(output),
            Some(code) => Err(RemediationError::CommandFailed {
                exit_status: code,
                output,
            }),
            None => Err(RemediationError::ExitStatusMissing { output }),
        }
    }
}

/// Run `command` on a new session channel and collect its output.
async fn exec(session: &Handle<AcceptAnyHost>, command: &str) -> Result<String, RemediationError> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| RemediationError::Session(e.to_string()))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| RemediationError::Session(e.to_string()))?;

    let mut collected = CommandOutput::default();
    while let Some(msg) = channel.wait().await {
        collected.absorb(&msg);
    }
    collected.into_result()
}
