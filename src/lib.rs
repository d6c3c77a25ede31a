//! Aqua: a local coordination kernel for independent CLI processes working
//! against one shared embedded store — leader election, task scheduling,
//! file locks, and messaging, with no server process and no background
//! thread.
//!
//! [`Aqua`] is the facade a thin CLI harness (out of scope for this crate)
//! wires up per invocation: open the store, resolve "who am I", stamp a
//! heartbeat and opportunistically run recovery, then dispatch to whichever
//! operation the caller asked for — each of which commits its own
//! transaction and returns.

pub mod agents;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod ids;
pub mod leader;
pub mod locks;
pub mod messaging;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod tasks;

pub use error::{AquaError, Result};

use std::path::Path;

use config::AquaConfig;
use store::Store;

/// Install a compact `tracing-subscriber` formatter honoring `RUST_LOG`
/// (default `info`) for a CLI harness built on top of this crate. The
/// kernel itself only emits events; something with a `main` has to install
/// a subscriber to see them. Safe to call at most once per process —
/// ignores the error if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .try_init();
}

/// One project's open store plus its resolved configuration — the handle
/// every kernel operation is called against.
#[derive(Clone)]
pub struct Aqua {
    store: Store,
    config: AquaConfig,
}

impl Aqua {
    /// Create `.aqua/` if absent and open it. Used by the `init` operation;
    /// every other entry point should use [`Aqua::open`], which refuses to
    /// silently create state for a project that was never initialized.
    pub async fn init(project_root: &Path) -> Result<Self> {
        let store = Store::open(project_root).await?;
        let config = AquaConfig::load(project_root);
        Ok(Self { store, config })
    }

    /// Open an already-initialized project. Fails with `NotInitialized` if
    /// `<project_root>/.aqua` doesn't exist yet.
    pub async fn open(project_root: &Path) -> Result<Self> {
        if !project_root.join(".aqua").is_dir() {
            return Err(AquaError::NotInitialized {
                path: project_root.display().to_string(),
            });
        }
        Self::init(project_root).await
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &AquaConfig {
        &self.config
    }

    pub fn project_root(&self) -> &Path {
        self.store.project_root()
    }

    /// Resolve the calling agent, stamp its heartbeat, and opportunistically
    /// run the recovery sweep — steps (b) and (c) of the per-invocation
    /// control flow (overview §2). Every operation below is meant to be
    /// preceded by exactly one call to this.
    pub async fn resolve_and_heartbeat(&self) -> Result<agents::Agent> {
        let agent = agents::resolve(&self.store, &self.config).await?;
        agents::heartbeat(&self.store, &agent.id).await?;
        let _ = recovery::maybe_sweep(&self.store, &self.config, &agent.id).await?;
        agents::get(&self.store, &agent.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_without_init_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let err = Aqua::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, AquaError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn init_then_open_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        Aqua::init(dir.path()).await.unwrap();
        let aqua = Aqua::open(dir.path()).await.unwrap();
        assert_eq!(aqua.project_root(), dir.path());
    }

    #[tokio::test]
    async fn resolve_and_heartbeat_requires_join_first() {
        let dir = tempfile::tempdir().unwrap();
        let aqua = Aqua::init(dir.path()).await.unwrap();
        let err = aqua.resolve_and_heartbeat().await.unwrap_err();
        assert!(matches!(err, AquaError::NotJoined));

        agents::join(aqua.store(), aqua.config(), "alice", agents::JoinOptions::default())
            .await
            .unwrap();
        let agent = aqua.resolve_and_heartbeat().await.unwrap();
        assert_eq!(agent.name, "alice");
    }
}
