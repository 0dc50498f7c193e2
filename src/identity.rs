//! Global git identity for deployment commits.
//!
//! A CI runner usually has no `user.name` / `user.email` configured, and git
//! refuses to commit without one.  [`GitIdentity::configure`] guarantees both
//! keys end up set: an explicit caller value wins, an already-configured
//! value is preserved, and otherwise a built-in default is written.

use std::ffi::OsString;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::GitCiConfig;
use crate::error::Error;

pub const DEFAULT_USER_NAME: &str = "Tomster";
pub const DEFAULT_USER_EMAIL: &str = "tomster@emberjs.com";

/// Ensures a global git identity is present.
///
/// Extra env pairs are applied to every git invocation; tests use this to
/// point `GIT_CONFIG_GLOBAL` at a scratch file instead of the real one.
#[derive(Debug, Clone, Default)]
pub struct GitIdentity {
    env: Vec<(String, OsString)>,
}

impl GitIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(env: Vec<(String, OsString)>) -> Self {
        Self { env }
    }

    /// Ensure `user.name` and `user.email` are configured.
    ///
    /// The two keys are independent and run concurrently.
    pub async fn configure(&self, config: &GitCiConfig) -> Result<(), Error> {
        tokio::try_join!(
            self.ensure("user.name", config.user_name.as_deref(), DEFAULT_USER_NAME),
            self.ensure("user.email", config.user_email.as_deref(), DEFAULT_USER_EMAIL),
        )?;
        Ok(())
    }

    /// Set the global git config value for `key`, falling back to `default`
    /// when no explicit value was given and no value is already present.
    ///
    /// An empty explicit value counts as "not supplied".
    pub async fn ensure(
        &self,
        key: &str,
        explicit: Option<&str>,
        default: &str,
    ) -> Result<(), Error> {
        let explicit = explicit.filter(|v| !v.is_empty());

        // A failed read means "no value set at any scope", not an error.
        let already_set = self.git(&["config", key]).await?.status.success();
        if already_set && explicit.is_none() {
            debug!(key, "git identity already configured, leaving as-is");
            return Ok(());
        }

        let value = explicit.unwrap_or(default);
        let output = self.git(&["config", "--global", key, value]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::GitConfig(format!(
                "`git config --global {key}` failed: {}",
                if stderr.is_empty() { output.status.to_string() } else { stderr }
            )));
        }

        info!(key, value, "git identity configured");
        Ok(())
    }

    pub(crate) async fn git(&self, args: &[&str]) -> Result<std::process::Output, Error> {
        Command::new("git")
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_os_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::GitConfig(format!("failed to spawn git: {e}")))
    }
}
