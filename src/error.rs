//! Error types for the deploy-key lifecycle.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no `deploy_key` or `deploy_key_path` configured; unable to deploy")]
    NoKeySource,

    #[error("unable to load deploy key at path '{}'", .0.display())]
    KeyPathMissing(PathBuf),

    #[error("invalid `git-ci` config section: {0}")]
    InvalidOptions(#[source] serde_json::Error),

    #[error("failed to write deploy key to '{}': {source}", path.display())]
    KeyWrite { path: PathBuf, source: io::Error },

    #[error("failed to set permissions 0600 on '{}': {source}", path.display())]
    KeyPermissions { path: PathBuf, source: io::Error },

    #[error("failed to start ssh-agent: {0}")]
    AgentStart(String),

    #[error("ssh-agent socket '{}' did not appear", .0.display())]
    AgentSocket(PathBuf),

    #[error("ssh-add failed for '{}': {detail}", path.display())]
    KeyRegistration { path: PathBuf, detail: String },

    #[error("git config failed: {0}")]
    GitConfig(String),

    #[error("failed to remove temporary deploy key '{}': {source}", path.display())]
    KeyCleanup { path: PathBuf, source: io::Error },
}

/// Coarse classification used by callers that only care which stage broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing/invalid key source or a failure staging it on disk.
    Configuration,
    /// Agent startup, socket exposure, or key registration.
    Agent,
    /// A `git config --global` write (or the spawn of git itself).
    Git,
    /// Cleanup of the temporary key file.
    Teardown,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoKeySource
            | Error::KeyPathMissing(_)
            | Error::InvalidOptions(_)
            | Error::KeyWrite { .. }
            | Error::KeyPermissions { .. } => ErrorKind::Configuration,
            Error::AgentStart(_) | Error::AgentSocket(_) | Error::KeyRegistration { .. } => {
                ErrorKind::Agent
            }
            Error::GitConfig(_) => ErrorKind::Git,
            Error::KeyCleanup { .. } => ErrorKind::Teardown,
        }
    }
}
