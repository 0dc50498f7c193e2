//! Deploy-key and SSH-agent session management for git deployments in CI.
//!
//! A deployment pipeline that pushes over SSH needs a private deploy key
//! available for exactly the duration of the run, and nothing left behind
//! afterwards.  This crate owns that lifecycle:
//!
//! 1. **Materialize** the key: either write caller-supplied key material to
//!    a private (0600) temp file, or validate and tighten the permissions of
//!    an existing key file.
//! 2. **Start an agent**: spawn a dedicated `ssh-agent` on a socket path we
//!    choose, register the key with it, and hand the socket back as an
//!    explicit env override for later git invocations.
//! 3. **Ensure a git identity**: `user.name` / `user.email`, preferring the
//!    caller's values, then whatever is already configured, then built-in
//!    defaults.
//! 4. **Tear down**: delete the temp key (loudly, a leaked key is a
//!    security problem) and kill the agent we started (quietly, it may
//!    already be gone).
//!
//! # Architecture
//!
//! ```text
//! Coordinator::setup ──► KeyFile::materialize ──► AgentSession::start ──► GitIdentity
//!        │                   (0600 staging)        (owned ssh-agent,        (user.name /
//!        │                                          SSH_AUTH_SOCK)           user.email)
//!        └─ teardown ──► KeyFile::remove ──► AgentSession::stop
//! ```
//!
//! The [`Coordinator`] is a small state machine; the outer pipeline calls
//! [`Coordinator::setup`] with a [`Context`] carrying the `"git-ci"` config
//! section and [`Coordinator::teardown`] when the run ends, and threads
//! [`Coordinator::env`] into every SSH-backed git subprocess in between.
//! The agent socket is never exported into the ambient process environment
//! and the agent is only ever killed through the child handle captured at
//! spawn time, so concurrent runs and unrelated agents on the same host are
//! left alone.

pub mod agent;
pub mod config;
pub mod error;
pub mod identity;
pub mod key;
pub mod lifecycle;

pub use agent::AgentSession;
pub use config::{Context, GitCiConfig, KeyMaterial};
pub use error::{Error, ErrorKind};
pub use identity::GitIdentity;
pub use key::{KeyFile, Provenance};
pub use lifecycle::{Coordinator, Phase};

/// Crate-wide mutex for tests that touch process-global state.
///
/// Config tests call `unsafe { env::set_var(...) }` on `CI` / `DEPLOY_KEY`,
/// and the key/agent/lifecycle tests use the pid-derived temp key and socket
/// paths; a single process-wide lock prevents races when those tests run in
/// parallel in the same test binary.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
