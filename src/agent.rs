//! SSH agent session: one dedicated `ssh-agent` per deployment run.
//!
//! The agent is launched in the foreground (`-D`) on a socket path this
//! crate picks, so startup needs no output parsing: the address is the path
//! we chose and the pid comes from the owned [`Child`].  The socket is
//! exposed to later git/SSH subprocesses as an explicit env override via
//! [`AgentSession::env`]; the ambient process environment is never touched.
//!
//! Teardown kills exactly the child we spawned.  Killing by process name
//! would take down unrelated agents on a shared CI host.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::Error;

/// How often and how long to poll for the agent socket during startup.
/// Bounds startup detection only; key registration itself is not deadlined.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SOCKET_POLL_ATTEMPTS: u32 = 50;

/// A running SSH agent holding the deploy key.
///
/// Owns the agent process.  Dropping the session kills the agent
/// (`kill_on_drop`), so a failure partway through setup never leaves an
/// orphaned agent behind; [`AgentSession::stop`] is the graceful variant
/// that also reaps the child and removes the socket file.
pub struct AgentSession {
    child: Child,
    socket: PathBuf,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("socket", &self.socket)
            .field("pid", &self.child.id())
            .finish()
    }
}

impl AgentSession {
    /// Start an agent and register the key at `key_path` with it.
    ///
    /// Launch, socket wait, and registration are one logical unit: if any
    /// step fails the spawned agent is killed before the error propagates.
    pub async fn start(key_path: &Path) -> Result<Self, Error> {
        let socket = agent_socket_path();

        // Remove a stale socket from a previous run of this pid.
        if socket.exists()
            && let Err(e) = std::fs::remove_file(&socket)
        {
            warn!(path = %socket.display(), "failed to remove stale agent socket: {e}");
        }

        let mut child = Command::new("ssh-agent")
            .arg("-D")
            .arg("-a")
            .arg(&socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::AgentStart(format!("failed to spawn ssh-agent: {e}")))?;

        wait_for_socket(&mut child, &socket).await?;
        debug!(socket = %socket.display(), pid = ?child.id(), "ssh-agent started");

        let session = Self { child, socket };
        session.register(key_path).await?;
        Ok(session)
    }

    /// `ssh-add` the key through our socket.
    async fn register(&self, key_path: &Path) -> Result<(), Error> {
        let output = Command::new("ssh-add")
            .arg(key_path)
            .env("SSH_AUTH_SOCK", &self.socket)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::KeyRegistration {
                path: key_path.to_path_buf(),
                detail: format!("failed to spawn ssh-add: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() { output.status.to_string() } else { stderr };
            return Err(Error::KeyRegistration { path: key_path.to_path_buf(), detail });
        }

        info!(key = %key_path.display(), "deploy key registered with ssh-agent");
        Ok(())
    }

    /// The agent's listening socket.
    pub fn auth_sock(&self) -> &Path {
        &self.socket
    }

    /// Pid of the owned agent process, if it is still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Env overrides for subprocesses that should authenticate through this
    /// agent.  Pass these to each git/SSH invocation rather than mutating
    /// the process environment.
    pub fn env(&self) -> Vec<(String, OsString)> {
        vec![(
            "SSH_AUTH_SOCK".to_string(),
            self.socket.clone().into_os_string(),
        )]
    }

    /// Terminate the owned agent.  Best-effort: the agent may already have
    /// exited, and teardown must not fail because of it.
    pub async fn stop(mut self) {
        match self.child.start_kill() {
            Ok(()) => {
                if let Err(e) = self.child.wait().await {
                    warn!("failed to reap ssh-agent: {e}");
                }
            }
            Err(e) => debug!("ssh-agent already exited: {e}"),
        }
        if let Err(e) = tokio::fs::remove_file(&self.socket).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.socket.display(), "failed to remove agent socket: {e}");
        }
        debug!("ssh-agent stopped");
    }
}

/// Per-process agent socket path: `$TMPDIR/deploy_agent_<pid>.sock`.
fn agent_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("deploy_agent_{}.sock", std::process::id()))
}

/// Poll until the agent binds its socket, erroring out early if it dies.
async fn wait_for_socket(child: &mut Child, socket: &Path) -> Result<(), Error> {
    for _ in 0..SOCKET_POLL_ATTEMPTS {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::AgentStart(format!("failed to poll ssh-agent: {e}")))?
        {
            return Err(Error::AgentStart(format!(
                "ssh-agent exited during startup: {status}"
            )));
        }
        if socket.exists() {
            return Ok(());
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
    Err(Error::AgentSocket(socket.to_path_buf()))
}
