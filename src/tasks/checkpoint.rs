//! Checkpoint serialization: thread the pending queue into one linear
//! chain so an external loop can observe an agent exiting between two
//! tasks and relaunch a fresh one with restored context.
//!
//! A no-op on an empty queue, and idempotent for a given stride: a
//! checkpoint is inserted between two work tasks only if one doesn't
//! already sit in that exact position.

use chrono::Utc;
use sqlx::{Sqlite, Transaction};

use crate::error::Result;
use crate::events;
use crate::ids::random_hex_id;
use crate::store::Store;

use super::{get, list, Task};

/// Insert checkpoint tasks between consecutive pending work tasks (or
/// every `stride`-th task) so the queue becomes a single dependency chain.
/// Returns the resulting chain, work tasks and checkpoints interleaved, in
/// chain order.
pub async fn serialize(store: &Store, created_by: &str, stride: usize) -> Result<Vec<Task>> {
    let stride = stride.max(1);
    let mut work: Vec<Task> = list(store, Some("pending")).await?
        .into_iter()
        .filter(|t| !t.is_checkpoint)
        .collect();
    // `list` already orders by priority desc, created_at asc — the same
    // order `claim` would hand tasks out in, which is what "linear chain"
    // means here.
    work.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });

    if work.is_empty() {
        return Ok(vec![]);
    }

    let mut tx = store.begin_immediate().await?;
    let mut boundary = stride;
    while boundary < work.len() {
        let prev = &work[boundary - 1];
        let next = &work[boundary];
        ensure_checkpoint_between_tx(&mut tx, created_by, &prev.id, &next.id).await?;
        boundary += stride;
    }
    tx.commit().await?;

    let mut chain = Vec::with_capacity(work.len());
    let mut boundary = stride;
    chain.push(work[0].clone());
    for (i, task) in work.iter().enumerate().skip(1) {
        if i == boundary {
            if let Some(checkpoint_id) = checkpoint_between(store, &work[i - 1].id, &task.id).await? {
                chain.push(get(store, &checkpoint_id).await?);
            }
            boundary += stride;
        }
        chain.push(task.clone());
    }

    Ok(chain)
}

/// If a checkpoint already depends on `prev_id` and is itself depended on
/// by `next_id`, do nothing. Otherwise insert one and wire both edges.
async fn ensure_checkpoint_between_tx(
    tx: &mut Transaction<'_, Sqlite>,
    created_by: &str,
    prev_id: &str,
    next_id: &str,
) -> Result<()> {
    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT c.id FROM tasks c \
         JOIN task_dependencies d1 ON d1.task_id = c.id AND d1.depends_on = ? \
         JOIN task_dependencies d2 ON d2.task_id = ? AND d2.depends_on = c.id \
         WHERE c.is_checkpoint = 1 LIMIT 1",
    )
    .bind(prev_id)
    .bind(next_id)
    .fetch_optional(&mut **tx)
    .await?;

    if existing.is_some() {
        return Ok(());
    }

    let now = Utc::now().to_rfc3339();
    let checkpoint_id = random_hex_id();

    sqlx::query(
        "INSERT INTO tasks (id, title, status, priority, created_by, created_at, updated_at, \
         retry_count, max_retries, tags_json, context_json, version, is_checkpoint) \
         VALUES (?, ?, 'pending', 5, ?, ?, ?, 0, 1, '[]', '{}', 1, 1)",
    )
    .bind(&checkpoint_id)
    .bind(format!("checkpoint after {prev_id}"))
    .bind(created_by)
    .bind(&now)
    .bind(&now)
    .execute(&mut **tx)
    .await?;

    sqlx::query("INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?)")
        .bind(&checkpoint_id)
        .bind(prev_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?)")
        .bind(next_id)
        .bind(&checkpoint_id)
        .execute(&mut **tx)
        .await?;

    events::append_tx(
        tx,
        "checkpoint_inserted",
        Some(created_by),
        Some(&checkpoint_id),
        serde_json::json!({"after": prev_id, "before": next_id}),
    )
    .await?;

    Ok(())
}

async fn checkpoint_between(store: &Store, prev_id: &str, next_id: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT c.id FROM tasks c \
         JOIN task_dependencies d1 ON d1.task_id = c.id AND d1.depends_on = ? \
         JOIN task_dependencies d2 ON d2.task_id = ? AND d2.depends_on = c.id \
         WHERE c.is_checkpoint = 1 LIMIT 1",
    )
    .bind(prev_id)
    .bind(next_id)
    .fetch_optional(store.pool())
    .await?;
    Ok(row.map(|(id,)| id))
}
