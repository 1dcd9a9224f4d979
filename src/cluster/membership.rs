//! Cluster membership document.
//!
//! A JSON file listing the admin credentials and every node with its role.
//! Read fresh by each monitor cycle and never written by this crate.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors raised while loading the membership document.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("membership file {path} could not be read: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("membership file {path} is not valid: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("membership file {0} lists no members")]
    Empty(String),
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Worker,
}

/// Shared admin credentials used for every remote session.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Admin {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Admin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admin")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One node listed in the membership document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Member {
    pub hostname: String,
    pub role: Role,
}

/// Parsed membership document.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSetup {
    pub admin: Admin,
    #[serde(alias = "nodes")]
    pub members: Vec<Member>,
}

impl ClusterSetup {
    /// Parses a membership document from its JSON text.
    pub fn from_json(path: &str, text: &str) -> Result<Self, MembershipError> {
        let setup: ClusterSetup =
            serde_json::from_str(text).map_err(|source| MembershipError::Parse {
                path: path.to_string(),
                source,
            })?;
        if setup.members.is_empty() {
            return Err(MembershipError::Empty(path.to_string()));
        }
        Ok(setup)
    }

    /// Reads and parses the membership document at `path`.
    pub async fn load(path: &Path) -> Result<Self, MembershipError> {
        let display = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| MembershipError::Read {
                path: display.clone(),
                source,
            })?;
        Self::from_json(&display, &text)
    }
}
