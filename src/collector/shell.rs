//! Remote-shell abstraction used by the collector.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Pool key: one set of sessions per `(user, host)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user: String,
    pub host: String,
}

impl SessionKey {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },
    #[error("authentication rejected for {0}")]
    Auth(SessionKey),
    #[error("remote command failed: {0}")]
    Exec(String),
    #[error("remote operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("session pool is shut down")]
    PoolClosed,
}

/// An authenticated session able to run commands one at a time.
#[async_trait]
pub trait RemoteSession: Send + 'static {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ShellError>;

    /// Whether the underlying transport is known to be gone.
    fn is_closed(&self) -> bool;
}

/// Opens new sessions for the pool.
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    type Session: RemoteSession;

    async fn connect(&self, key: &SessionKey, password: &str) -> Result<Self::Session, ShellError>;
}
