//! Agent registration, identity resolution, and heartbeat.
//!
//! An [`Agent`] row is the only thing every other module hangs off of: the
//! leader is an agent id, a task's `claimed_by` is an agent id, a file
//! lock's owner is an agent id. This module owns the row's lifecycle
//! (`join` creates it, `leave` removes it) and the per-invocation identity
//! resolution described in `identity`.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, Sqlite, Transaction};
use std::path::Path;
use tracing::info;

use crate::config::AquaConfig;
use crate::error::{AquaError, Result};
use crate::events;
use crate::identity;
use crate::ids::random_hex_id;
use crate::locks;
use crate::store::Store;
use crate::tasks;

/// `agents.kind` — which family of CLI tool this participant is.
pub const KNOWN_KINDS: &[&str] = &["claude", "codex", "gemini", "generic"];

/// `agents.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Dead,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub pid: Option<i64>,
    pub status: String,
    pub last_heartbeat_at: String,
    pub registered_at: String,
    pub current_task_id: Option<String>,
    pub capabilities_json: String,
    pub role: Option<String>,
    pub metadata_json: String,
    pub session_key: Option<String>,
}

impl Agent {
    pub fn capabilities(&self) -> Vec<String> {
        serde_json::from_str(&self.capabilities_json).unwrap_or_default()
    }

    pub fn metadata(&self) -> Value {
        serde_json::from_str(&self.metadata_json).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    pub fn is_idle(&self) -> bool {
        self.current_task_id.is_none()
    }
}

/// Options accepted by [`join`]; everything but `name` is optional.
#[derive(Debug, Default)]
pub struct JoinOptions {
    pub kind: Option<String>,
    pub pid: Option<i64>,
    pub capabilities: Vec<String>,
    pub role: Option<String>,
    pub metadata: Option<Value>,
}

/// Register a new agent and bind it to the caller's session.
pub async fn join(
    store: &Store,
    config: &AquaConfig,
    name: &str,
    opts: JoinOptions,
) -> Result<Agent> {
    let kind = opts.kind.unwrap_or_else(|| "generic".to_string());
    let now = Utc::now().to_rfc3339();
    let id = random_hex_id();
    let key = identity::session_key(config);

    let capabilities_json = serde_json::to_string(&opts.capabilities).unwrap_or_else(|_| "[]".to_string());
    let metadata_json = opts
        .metadata
        .map(|v| v.to_string())
        .unwrap_or_else(|| "{}".to_string());

    let mut tx = store.begin_immediate().await?;
    sqlx::query(
        "INSERT INTO agents (id, name, kind, pid, status, last_heartbeat_at, registered_at, \
         current_task_id, capabilities_json, role, metadata_json, session_key) \
         VALUES (?, ?, ?, ?, 'active', ?, ?, NULL, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(&kind)
    .bind(opts.pid)
    .bind(&now)
    .bind(&now)
    .bind(&capabilities_json)
    .bind(&opts.role)
    .bind(&metadata_json)
    .bind(&key)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AquaError::AlreadyHeld {
                what: "agent name",
                owner: name.to_string(),
            }
        } else {
            AquaError::Store(e)
        }
    })?;

    events::append_tx(
        &mut tx,
        "agent_joined",
        Some(&id),
        None,
        serde_json::json!({"name": name, "kind": kind}),
    )
    .await?;
    tx.commit().await?;

    identity::write_session_agent_id(store.project_root(), &key, &id).await?;

    info!(agent_id = %id, name, kind, "agent joined");
    get(store, &id).await
}

/// Remove the calling session's agent: release its locks, return its
/// claimed task to pending, delete the row, and forget the session file.
///
/// Idempotent-ish: if the session has no agent, this is a no-op.
pub async fn leave(store: &Store, config: &AquaConfig) -> Result<()> {
    let key = identity::session_key(config);
    let Some(agent_id) = identity::read_session_agent_id(store.project_root(), &key).await else {
        return Ok(());
    };

    let mut tx = store.begin_immediate().await?;
    release_agent_tx(&mut tx, &agent_id, "agent left").await?;
    sqlx::query("DELETE FROM agents WHERE id = ?")
        .bind(&agent_id)
        .execute(&mut *tx)
        .await?;
    events::append_tx(&mut tx, "agent_left", Some(&agent_id), None, serde_json::json!({})).await?;
    tx.commit().await?;

    identity::clear_session(store.project_root(), &key).await?;
    info!(agent_id = %agent_id, "agent left");
    Ok(())
}

/// Shared by `leave` and the recovery sweep's dead-agent handling: release
/// every file lock the agent holds and return its claimed task to pending
/// (bumping `retry_count`).
pub(crate) async fn release_agent_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: &str,
    reason: &str,
) -> Result<Option<String>> {
    locks::release_all_owned_by_tx(tx, agent_id).await?;
    tasks::abandon_current_task_tx(tx, agent_id, reason).await
}

/// Resolve "who is calling" per the precedence in `identity`: explicit
/// `AQUA_AGENT_ID` override (if it names a live agent), else the
/// session-bound agent, recorded the last time this session joined.
pub async fn resolve(store: &Store, config: &AquaConfig) -> Result<Agent> {
    if let Some(explicit) = &config.agent_id_override {
        if let Ok(agent) = get(store, explicit).await {
            if agent.status != AgentStatus::Dead.as_str() {
                return Ok(agent);
            }
        }
    }

    let key = identity::session_key(config);
    let Some(agent_id) = identity::read_session_agent_id(store.project_root(), &key).await else {
        return Err(AquaError::NotJoined);
    };
    get(store, &agent_id).await.map_err(|_| AquaError::NotJoined)
}

pub async fn get(store: &Store, id: &str) -> Result<Agent> {
    sqlx::query_as("SELECT * FROM agents WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| AquaError::NotFound {
            what: "agent",
            id: id.to_string(),
        })
}

pub async fn list(store: &Store) -> Result<Vec<Agent>> {
    Ok(sqlx::query_as("SELECT * FROM agents ORDER BY registered_at ASC")
        .fetch_all(store.pool())
        .await?)
}

/// Stamp `last_heartbeat_at = now`. Called at the entry of every kernel
/// operation (see `lib::Aqua::resolve_and_heartbeat`), not just explicitly.
pub async fn heartbeat(store: &Store, agent_id: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let affected = sqlx::query("UPDATE agents SET last_heartbeat_at = ? WHERE id = ?")
        .bind(&now)
        .bind(agent_id)
        .execute(store.pool())
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AquaError::NotFound {
            what: "agent",
            id: agent_id.to_string(),
        });
    }
    Ok(())
}

/// Best-effort liveness probe: true if a process with this pid appears to
/// exist. Never signals the process; a false positive from pid reuse is
/// acceptable because heartbeat age is the real arbiter (see `recovery`).
#[cfg(unix)]
pub fn pid_is_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checks; it never delivers a signal to the target process.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: i64) -> bool {
    // No portable no-signal probe off Unix; treat as unknown-but-alive and
    // let heartbeat age be the sole arbiter, per the spec's portability note.
    true
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}
