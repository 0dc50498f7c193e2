//! Setup/teardown orchestration for one deployment run.
//!
//! [`Coordinator`] is the crate's entry point for the outer pipeline.  It is
//! a small state machine rather than a chain of callbacks, so a failure at
//! any stage leaves an unambiguous current phase for logging and for
//! deciding what teardown still has to clean up.
//!
//! ```text
//! Idle ──setup──► Configuring ──► Ready ──teardown──► TearingDown ──► Done
//!   │                  │                                    ▲
//!   │                  └──────── (setup failed) ────────────┘
//!   └──setup (disabled)──► Disabled
//! ```
//!
//! Setup does no partial rollback on failure; the error surfaces to the
//! pipeline, which decides whether to run teardown.  Teardown from a
//! half-configured state cleans up whatever exists: the temporary key file
//! (fatal if that fails — a leaked key is worth failing loudly over) and the
//! agent (best-effort, it may already be gone).

use std::ffi::OsString;

use tracing::{debug, info};

use crate::agent::AgentSession;
use crate::config::Context;
use crate::error::Error;
use crate::identity::GitIdentity;
use crate::key::KeyFile;

/// Lifecycle phase of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No setup attempted yet.
    Idle,
    /// The feature was turned off; both entry points are no-ops.
    Disabled,
    /// Setup in progress, or setup failed partway through.
    Configuring,
    /// Key staged, agent running, identity ensured.
    Ready,
    /// Teardown in progress, or teardown failed partway through.
    TearingDown,
    /// Teardown finished.
    Done,
}

/// Owns the deploy key file and the agent session for one run.
///
/// One coordinator per deployment; concurrent runs must not share an
/// instance (the temp key path and agent socket are pid-scoped).
#[derive(Debug)]
pub struct Coordinator {
    phase: Phase,
    identity: GitIdentity,
    key_file: Option<KeyFile>,
    agent: Option<AgentSession>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::with_identity(GitIdentity::new())
    }

    /// Use a custom-configured identity layer (extra env for git calls).
    pub fn with_identity(identity: GitIdentity) -> Self {
        Self {
            phase: Phase::Idle,
            identity,
            key_file: None,
            agent: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Env overrides (`SSH_AUTH_SOCK`) the pipeline must pass to every
    /// SSH-backed git invocation while the session is live.  Empty when no
    /// agent is running.
    pub fn env(&self) -> Vec<(String, OsString)> {
        self.agent.as_ref().map(AgentSession::env).unwrap_or_default()
    }

    /// Stage the deploy key, start the agent, and ensure a git identity.
    ///
    /// A disabled config short-circuits with no side effects.  Any failure
    /// aborts setup and surfaces to the caller; the phase stays at
    /// `Configuring` so [`Coordinator::teardown`] can clean up what exists.
    pub async fn setup(&mut self, context: &Context) -> Result<(), Error> {
        let config = context.git_ci()?;
        if !config.enabled {
            info!("git-ci disabled, skipping deploy key setup");
            self.phase = Phase::Disabled;
            return Ok(());
        }

        self.phase = Phase::Configuring;
        debug!("staging deploy key");
        let key_file = KeyFile::materialize(&config).await?;
        let key_path = key_file.path().to_path_buf();
        // Recorded before the agent starts, so a failed registration still
        // gets its temp key cleaned up by teardown.
        self.key_file = Some(key_file);

        self.agent = Some(AgentSession::start(&key_path).await?);
        self.identity.configure(&config).await?;

        self.phase = Phase::Ready;
        info!("deploy key session ready");
        Ok(())
    }

    /// Reverse-order cleanup: delete the temporary key file, then stop the
    /// agent.
    ///
    /// No-op when setup never ran or the feature is disabled.  A key file
    /// that cannot be deleted is fatal and propagates; a missing agent is
    /// not.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        match self.phase {
            Phase::Idle | Phase::Disabled | Phase::Done => {
                debug!(phase = ?self.phase, "nothing to tear down");
                return Ok(());
            }
            Phase::Configuring | Phase::Ready | Phase::TearingDown => {}
        }

        self.phase = Phase::TearingDown;
        if let Some(key_file) = self.key_file.take() {
            key_file.remove().await?;
        }
        if let Some(agent) = self.agent.take() {
            agent.stop().await;
        }

        self.phase = Phase::Done;
        info!("deploy key session torn down");
        Ok(())
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TEST_ENV_MUTEX;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::process::Stdio;

    fn binary_available(name: &str) -> bool {
        std::process::Command::new(name)
            .arg("-h")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    fn full_stack_available() -> bool {
        ["ssh-agent", "ssh-add", "ssh-keygen", "git"]
            .iter()
            .all(|b| binary_available(b))
    }

    fn generate_test_key(dir: &Path) -> PathBuf {
        let key_path = dir.join("test_key");
        let status = std::process::Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", ""])
            .arg("-f")
            .arg(&key_path)
            .status()
            .unwrap();
        assert!(status.success(), "ssh-keygen failed");
        key_path
    }

    /// An identity layer writing to a scratch global config file.
    fn isolated_identity(dir: &Path) -> GitIdentity {
        let global = dir.join("gitconfig");
        std::fs::write(&global, "").unwrap();
        GitIdentity::with_env(vec![
            ("GIT_CONFIG_GLOBAL".to_string(), global.into_os_string()),
            ("GIT_CONFIG_NOSYSTEM".to_string(), OsString::from("1")),
        ])
    }

    #[tokio::test]
    async fn disabled_config_is_a_noop_both_ways() {
        let mut coordinator = Coordinator::new();
        let context = Context::with_git_ci(json!({ "enabled": false }));

        coordinator.setup(&context).await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Disabled);
        assert!(coordinator.env().is_empty());

        coordinator.teardown().await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Disabled);
    }

    #[tokio::test]
    async fn teardown_before_setup_is_a_noop() {
        let mut coordinator = Coordinator::new();
        coordinator.teardown().await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn setup_without_key_source_fails_in_configuring() {
        let _guard = TEST_ENV_MUTEX.lock().unwrap();
        unsafe { std::env::remove_var("DEPLOY_KEY") };

        let mut coordinator = Coordinator::new();
        let context = Context::with_git_ci(json!({ "enabled": true }));

        let err = coordinator.setup(&context).await.unwrap_err();
        assert!(matches!(err, Error::NoKeySource));
        assert_eq!(coordinator.phase(), Phase::Configuring);

        // Nothing was staged; teardown still completes.
        coordinator.teardown().await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn full_run_with_key_material() {
        if !full_stack_available() {
            eprintln!("skipping: OpenSSH tools or git not available");
            return;
        }
        // Serializes the pid-scoped temp key path and agent socket.
        let _guard = TEST_ENV_MUTEX.lock().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let material = std::fs::read_to_string(generate_test_key(dir.path())).unwrap();
        let identity = isolated_identity(dir.path());

        let mut coordinator = Coordinator::with_identity(identity.clone());
        let context = Context::with_git_ci(json!({
            "enabled": true,
            "deploy_key": material,
            "user_name": "",
            "user_email": "",
        }));

        coordinator.setup(&context).await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Ready);

        // A 0600 temp key exists, the agent answers through the override,
        // and the empty identity fields fell back to the defaults.
        let temp_key = std::env::temp_dir().join(format!("deploy_key_{}", std::process::id()));
        assert!(temp_key.exists());
        use std::os::unix::fs::PermissionsExt as _;
        assert_eq!(
            std::fs::metadata(&temp_key).unwrap().permissions().mode() & 0o777,
            0o600
        );

        let env = coordinator.env();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].0, "SSH_AUTH_SOCK");
        let listed = std::process::Command::new("ssh-add")
            .arg("-l")
            .envs(env)
            .output()
            .unwrap();
        assert!(listed.status.success());

        let name = identity.git(&["config", "user.name"]).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&name.stdout).trim(),
            crate::identity::DEFAULT_USER_NAME
        );

        coordinator.teardown().await.unwrap();
        assert_eq!(coordinator.phase(), Phase::Done);
        assert!(!temp_key.exists());
        assert!(coordinator.env().is_empty());
    }

    #[tokio::test]
    async fn pre_existing_key_survives_teardown() {
        if !full_stack_available() {
            eprintln!("skipping: OpenSSH tools or git not available");
            return;
        }
        let _guard = TEST_ENV_MUTEX.lock().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let key_path = generate_test_key(dir.path());
        let identity = isolated_identity(dir.path());

        let mut coordinator = Coordinator::with_identity(identity);
        let context = Context::with_git_ci(json!({
            "enabled": true,
            "deploy_key_path": key_path.to_str().unwrap(),
        }));

        coordinator.setup(&context).await.unwrap();
        coordinator.teardown().await.unwrap();
        assert!(key_path.exists());
    }
}
