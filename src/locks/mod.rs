//! Exclusive file locks.
//!
//! A lock is a row keyed by path; acquiring is an insert that either
//! succeeds or fails on the primary-key constraint, which is the whole
//! mutual-exclusion mechanism — no separate check-then-insert race window.

use chrono::Utc;
use serde::Serialize;
use sqlx::{FromRow, Sqlite, Transaction};
use tracing::debug;

use crate::error::{AquaError, Result};
use crate::events;
use crate::store::Store;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FileLock {
    pub path: String,
    pub owner_agent_id: String,
    pub acquired_at: String,
}

/// Acquire the exclusive lock on `path` for `agent_id`.
///
/// Returns `AlreadyHeld { owner }` if another agent already holds it.
pub async fn acquire(store: &Store, agent_id: &str, path: &str) -> Result<FileLock> {
    let now = Utc::now().to_rfc3339();
    let mut tx = store.begin_immediate().await?;

    let result = sqlx::query("INSERT INTO file_locks (path, owner_agent_id, acquired_at) VALUES (?, ?, ?)")
        .bind(path)
        .bind(agent_id)
        .bind(&now)
        .execute(&mut *tx)
        .await;

    if let Err(e) = result {
        if is_pk_violation(&e) {
            let owner: (String,) = sqlx::query_as("SELECT owner_agent_id FROM file_locks WHERE path = ?")
                .bind(path)
                .fetch_one(&mut *tx)
                .await?;
            return Err(AquaError::AlreadyHeld {
                what: "lock",
                owner: owner.0,
            });
        }
        return Err(AquaError::Store(e));
    }

    events::append_tx(
        &mut tx,
        "lock_acquired",
        Some(agent_id),
        None,
        serde_json::json!({"path": path}),
    )
    .await?;
    tx.commit().await?;

    debug!(agent_id, path, "lock acquired");
    Ok(FileLock {
        path: path.to_string(),
        owner_agent_id: agent_id.to_string(),
        acquired_at: now,
    })
}

/// Release `path`, but only on behalf of its current owner.
pub async fn release(store: &Store, agent_id: &str, path: &str) -> Result<()> {
    let mut tx = store.begin_immediate().await?;

    let owner: Option<(String,)> = sqlx::query_as("SELECT owner_agent_id FROM file_locks WHERE path = ?")
        .bind(path)
        .fetch_optional(&mut *tx)
        .await?;

    match owner {
        None => {
            return Err(AquaError::NotFound {
                what: "lock",
                id: path.to_string(),
            })
        }
        Some((owner_id,)) if owner_id != agent_id => {
            return Err(AquaError::PermissionDenied {
                reason: format!("lock on {path} is held by {owner_id}, not {agent_id}"),
            })
        }
        Some(_) => {}
    }

    sqlx::query("DELETE FROM file_locks WHERE path = ? AND owner_agent_id = ?")
        .bind(path)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

    events::append_tx(
        &mut tx,
        "lock_released",
        Some(agent_id),
        None,
        serde_json::json!({"path": path}),
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Release every lock `agent_id` holds, unconditionally. Used by `leave`
/// and by the recovery sweep's dead-agent handling — ownership has already
/// been decided by the caller, so this never checks it again.
pub async fn release_all_owned_by_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: &str,
) -> Result<u64> {
    let released: Vec<(String,)> = sqlx::query_as("SELECT path FROM file_locks WHERE owner_agent_id = ?")
        .bind(agent_id)
        .fetch_all(&mut **tx)
        .await?;

    let affected = sqlx::query("DELETE FROM file_locks WHERE owner_agent_id = ?")
        .bind(agent_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

    for (path,) in released {
        events::append_tx(
            tx,
            "lock_released",
            Some(agent_id),
            None,
            serde_json::json!({"path": path, "reason": "owner released"}),
        )
        .await?;
    }

    Ok(affected)
}

pub async fn list(store: &Store) -> Result<Vec<FileLock>> {
    Ok(sqlx::query_as("SELECT * FROM file_locks ORDER BY acquired_at ASC")
        .fetch_all(store.pool())
        .await?)
}

fn is_pk_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}
