//! Append-only event log: every state transition the kernel makes is
//! recorded here, so `aqua events` can answer "what happened" without
//! reconstructing it from the current row state.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, Sqlite, Transaction};

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Event {
    pub id: i64,
    pub ts: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    pub detail_json: String,
}

/// Append an event within an already-open transaction, so it commits
/// atomically with whatever state change it describes.
pub async fn append_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: &str,
    agent_id: Option<&str>,
    task_id: Option<&str>,
    detail: Value,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let detail_json = detail.to_string();
    sqlx::query(
        "INSERT INTO events (ts, type, agent_id, task_id, detail_json) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&now)
    .bind(kind)
    .bind(agent_id)
    .bind(task_id)
    .bind(&detail_json)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Append an event directly against the pool, for call sites that don't
/// already hold an open transaction.
pub async fn append(
    store: &Store,
    kind: &str,
    agent_id: Option<&str>,
    task_id: Option<&str>,
    detail: Value,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let detail_json = detail.to_string();
    sqlx::query(
        "INSERT INTO events (ts, type, agent_id, task_id, detail_json) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&now)
    .bind(kind)
    .bind(agent_id)
    .bind(task_id)
    .bind(&detail_json)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Most recent `limit` events, newest first.
pub async fn tail(store: &Store, limit: i64) -> Result<Vec<Event>> {
    Ok(
        sqlx::query_as("SELECT * FROM events ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(store.pool())
            .await?,
    )
}
