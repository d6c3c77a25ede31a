//! Session-bound agent identity.
//!
//! Each client invocation is a brand-new process with no memory of what ran
//! before it. `join` assigns a stable agent id and records it under a
//! deterministic **session key** derived from the calling environment; every
//! later invocation in the same terminal/parent-process/session rediscovers
//! that id without the caller having to pass it explicitly.
//!
//! Resolution precedence, per invocation:
//! 1. `AQUA_AGENT_ID` names a live agent → use it directly.
//! 2. Otherwise derive a session key (`AQUA_SESSION_ID` env var, else the
//!    controlling tty path, else the parent pid, else the literal
//!    `"default"`) and look up `.aqua/sessions/<sha256(key)>`.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::AquaConfig;
use crate::error::Result;
use crate::ids::sha256_hex;

/// Deterministic key identifying "this calling context" across invocations.
///
/// The `"default"` fallback exists because AI agents commonly run without a
/// TTY and without a stable parent pid contract; it keeps their identity
/// pinned to one project as long as nothing more specific is available.
pub fn session_key(config: &AquaConfig) -> String {
    if let Some(explicit) = &config.session_id_override {
        return explicit.clone();
    }
    if let Some(tty) = controlling_tty_path() {
        return tty;
    }
    if let Some(ppid) = parent_pid() {
        return format!("ppid:{ppid}");
    }
    "default".to_string()
}

/// Path of the per-session file under `<project>/.aqua/sessions/`.
pub fn session_file_path(project_root: &Path, key: &str) -> PathBuf {
    project_root
        .join(".aqua")
        .join("sessions")
        .join(sha256_hex(key))
}

/// Read the agent id last joined for this session, if the file exists.
pub async fn read_session_agent_id(project_root: &Path, key: &str) -> Option<String> {
    let path = session_file_path(project_root, key);
    let contents = tokio::fs::read_to_string(&path).await.ok()?;
    let id = contents.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Persist `agent_id` as the current owner of `key`'s session file.
pub async fn write_session_agent_id(project_root: &Path, key: &str, agent_id: &str) -> Result<()> {
    let path = session_file_path(project_root, key);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(map_io)?;
        set_restrictive_dir_perms(parent);
    }
    let mut file = tokio::fs::File::create(&path).await.map_err(map_io)?;
    file.write_all(agent_id.as_bytes()).await.map_err(map_io)?;
    debug!(key, agent_id, "session file written");
    Ok(())
}

/// Delete the session file for `key`, if present. Not an error if it's
/// already gone — `leave` is idempotent on the filesystem side.
pub async fn clear_session(project_root: &Path, key: &str) -> Result<()> {
    let path = session_file_path(project_root, key);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(map_io(e)),
    }
}

fn map_io(e: std::io::Error) -> crate::error::AquaError {
    crate::error::AquaError::Store(sqlx::Error::Io(e))
}

#[cfg(unix)]
fn set_restrictive_dir_perms(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o700);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_restrictive_dir_perms(_path: &Path) {}

/// Best-effort controlling terminal path; `None` off Unix or when stdin
/// isn't a tty (common for AI-agent sessions launched without one).
#[cfg(unix)]
fn controlling_tty_path() -> Option<String> {
    let link = std::fs::read_link("/proc/self/fd/0").ok()?;
    let as_str = link.to_string_lossy().to_string();
    as_str.starts_with("/dev/").then_some(as_str)
}

#[cfg(not(unix))]
fn controlling_tty_path() -> Option<String> {
    None
}

#[cfg(unix)]
fn parent_pid() -> Option<u32> {
    Some(unsafe { libc::getppid() } as u32)
}

#[cfg(not(unix))]
fn parent_pid() -> Option<u32> {
    None
}
