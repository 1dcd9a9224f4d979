//! SSH transport for the collector, backed by russh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key::PublicKey;

use super::shell::{CommandOutput, RemoteSession, SessionConnector, SessionKey, ShellError};

/// Connection parameters shared by every SSH session.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub strict_host_keys: bool,
}

/// Host-key policy. Cluster nodes are trusted unless strict checking is on,
/// in which case the key must be present in `~/.ssh/known_hosts`.
struct HostKeyPolicy {
    host: String,
    port: u16,
    strict: bool,
}

#[async_trait]
impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if !self.strict {
            return Ok(true);
        }
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => {
                if !known {
                    tracing::warn!(host = %self.host, "host key not in known_hosts");
                }
                Ok(known)
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "host key verification failed");
                Ok(false)
            }
        }
    }
}

pub struct SshConnector {
    config: Arc<client::Config>,
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            settings,
        }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, key: &SessionKey, password: &str) -> Result<SshSession, ShellError> {
        let policy = HostKeyPolicy {
            host: key.host.clone(),
            port: self.settings.port,
            strict: self.settings.strict_host_keys,
        };
        let addr = (key.host.as_str(), self.settings.port);

        let connecting = client::connect(Arc::clone(&self.config), addr, policy);
        let mut handle = tokio::time::timeout(self.settings.connect_timeout, connecting)
            .await
            .map_err(|_| ShellError::Timeout(self.settings.connect_timeout))?
            .map_err(|e| ShellError::Connect {
                host: key.host.clone(),
                reason: e.to_string(),
            })?;

        let authenticated = tokio::time::timeout(
            self.settings.connect_timeout,
            handle.authenticate_password(key.user.as_str(), password),
        )
        .await
        .map_err(|_| ShellError::Timeout(self.settings.connect_timeout))?
        .map_err(|e| ShellError::Connect {
            host: key.host.clone(),
            reason: e.to_string(),
        })?;
        if !authenticated {
            return Err(ShellError::Auth(key.clone()));
        }

        Ok(SshSession {
            handle,
            command_timeout: self.settings.command_timeout,
        })
    }
}

/// One authenticated SSH connection. Each command runs on a fresh channel.
pub struct SshSession {
    handle: client::Handle<HostKeyPolicy>,
    command_timeout: Duration,
}

impl SshSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, ShellError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ShellError::Exec(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ShellError::Exec(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ShellError> {
        let timeout = self.command_timeout;
        tokio::time::timeout(timeout, self.run(command))
            .await
            .map_err(|_| ShellError::Timeout(timeout))?
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}
