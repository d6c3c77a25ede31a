//! Task lifecycle: add, claim, progress, done, fail, and the dependency
//! graph that gates claimability.
//!
//! Dependency satisfaction is pushed into the claim query as an anti-join
//! (`NOT EXISTS ... parent.status != 'done'`) rather than checked in
//! application code after fetching candidates, so the cost stays
//! `O(log n)` per claim instead of `O(n)`.

pub mod checkpoint;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, Sqlite, Transaction};
use tracing::{debug, info};

use crate::agents;
use crate::config::AquaConfig;
use crate::error::{AquaError, Result};
use crate::events;
use crate::ids::random_hex_id;
use crate::leader;
use crate::store::Store;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: i64,
    pub created_by: Option<String>,
    pub claimed_by: Option<String>,
    pub claim_term: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub claimed_at: Option<String>,
    pub completed_at: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub tags_json: String,
    pub context_json: String,
    pub version: i64,
    pub is_checkpoint: bool,
}

impl Task {
    pub fn tags(&self) -> Vec<String> {
        serde_json::from_str(&self.tags_json).unwrap_or_default()
    }

    pub fn context(&self) -> Value {
        serde_json::from_str(&self.context_json).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Inputs to [`add`]; `parents` and `after_title` are both optional and may
/// be combined (explicit ids plus a fuzzy "most recent match" lookup).
#[derive(Debug, Default)]
pub struct AddOptions {
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub tags: Vec<String>,
    pub context: Option<Value>,
    pub parents: Vec<String>,
    pub after_title: Option<String>,
}

/// Create a pending task, optionally depending on zero or more existing
/// tasks. Rejects (with no rows written) if any declared edge would close
/// a cycle.
pub async fn add(store: &Store, config: &AquaConfig, created_by: &str, title: &str, opts: AddOptions) -> Result<Task> {
    let now = Utc::now().to_rfc3339();
    let id = random_hex_id();
    let priority = opts.priority.unwrap_or(config.default_priority).clamp(1, 10);
    let tags_json = serde_json::to_string(&opts.tags).unwrap_or_else(|_| "[]".to_string());
    let context_json = opts
        .context
        .map(|v| v.to_string())
        .unwrap_or_else(|| "{}".to_string());

    let mut tx = store.begin_immediate().await?;

    let mut parent_ids = opts.parents;
    if let Some(title_fragment) = &opts.after_title {
        if let Some(parent) = resolve_fuzzy_parent_tx(&mut tx, title_fragment).await? {
            parent_ids.push(parent);
        }
    }
    parent_ids.sort();
    parent_ids.dedup();

    sqlx::query(
        "INSERT INTO tasks (id, title, description, status, priority, created_by, created_at, \
         updated_at, retry_count, max_retries, tags_json, context_json, version, is_checkpoint) \
         VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, 0, ?, ?, ?, 1, 0)",
    )
    .bind(&id)
    .bind(title)
    .bind(&opts.description)
    .bind(priority)
    .bind(created_by)
    .bind(&now)
    .bind(&now)
    .bind(config.max_retries)
    .bind(&tags_json)
    .bind(&context_json)
    .execute(&mut *tx)
    .await?;

    for parent in &parent_ids {
        sqlx::query("INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?)")
            .bind(&id)
            .bind(parent)
            .execute(&mut *tx)
            .await?;
    }

    if !parent_ids.is_empty() && creates_cycle_tx(&mut tx, &id).await? {
        tx.rollback().await?;
        return Err(AquaError::CycleDetected {
            new_task: id,
            via: parent_ids.join(","),
        });
    }

    events::append_tx(
        &mut tx,
        "task_added",
        Some(created_by),
        Some(&id),
        serde_json::json!({"title": title, "priority": priority, "parents": parent_ids}),
    )
    .await?;
    tx.commit().await?;

    get(store, &id).await
}

/// Most-recently-created task whose title contains `fragment` (case
/// insensitive), used by `--after <title>` fuzzy parent resolution.
async fn resolve_fuzzy_parent_tx(tx: &mut Transaction<'_, Sqlite>, fragment: &str) -> Result<Option<String>> {
    let needle = format!("%{}%", fragment.to_lowercase());
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM tasks WHERE LOWER(title) LIKE ? ORDER BY created_at DESC LIMIT 1",
    )
    .bind(&needle)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|(id,)| id))
}

/// True if `task_id` is reachable from itself by following `depends_on`
/// edges — i.e. one of its (possibly transitive) parents already depends
/// on it, which the edges just inserted in this transaction would close
/// into a cycle.
async fn creates_cycle_tx(tx: &mut Transaction<'_, Sqlite>, task_id: &str) -> Result<bool> {
    let hit: Option<(i64,)> = sqlx::query_as(
        "WITH RECURSIVE ancestors(id) AS ( \
             SELECT depends_on FROM task_dependencies WHERE task_id = ? \
             UNION \
             SELECT td.depends_on FROM task_dependencies td JOIN ancestors a ON td.task_id = a.id \
         ) \
         SELECT 1 FROM ancestors WHERE id = ? LIMIT 1",
    )
    .bind(task_id)
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(hit.is_some())
}

/// Add a dependency edge to an already-created task. Same cycle guard as
/// `add`: the edge is inserted, the ancestor check runs, and the whole
/// transaction rolls back (edge included) if it would close a cycle.
pub async fn link_dependency(store: &Store, agent_id: &str, task_id: &str, depends_on: &str) -> Result<()> {
    get(store, task_id).await?;
    get(store, depends_on).await?;

    let mut tx = store.begin_immediate().await?;
    sqlx::query("INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?, ?)")
        .bind(task_id)
        .bind(depends_on)
        .execute(&mut *tx)
        .await?;

    if creates_cycle_tx(&mut tx, task_id).await? {
        tx.rollback().await?;
        return Err(AquaError::CycleDetected {
            new_task: task_id.to_string(),
            via: depends_on.to_string(),
        });
    }

    events::append_tx(
        &mut tx,
        "task_dependency_added",
        Some(agent_id),
        Some(task_id),
        serde_json::json!({"depends_on": depends_on}),
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Known role synonyms a tag may carry; role preference falls back to "any
/// claimable task" when no tagged match exists.
fn role_synonyms(role: &str) -> Vec<String> {
    let borrowed: &[&str] = match role {
        "reviewer" => &["reviewer", "review", "code-review"],
        "frontend" => &["frontend", "ui", "web"],
        "backend" => &["backend", "api", "server"],
        "testing" => &["testing", "test", "qa"],
        "devops" => &["devops", "ops", "infra"],
        _ => &[],
    };
    if borrowed.is_empty() {
        vec![role.to_string()]
    } else {
        borrowed.iter().map(|s| s.to_string()).collect()
    }
}

/// Atomically claim a task. Both the task row and the claiming agent's
/// `current_task_id` are written in one transaction — a crash between the
/// two would otherwise orphan the assignment.
pub async fn claim(store: &Store, agent: &agents::Agent, task_id: Option<&str>) -> Result<Task> {
    if agent.current_task_id.is_some() {
        return Err(AquaError::AlreadyHeld {
            what: "task",
            owner: agent.id.clone(),
        });
    }

    let term = leader::current(store).await?.map(|l| l.term).unwrap_or(0);
    let now = Utc::now().to_rfc3339();

    let mut tx = store.begin_immediate().await?;

    let candidate: Option<String> = match task_id {
        Some(id) => Some(id.to_string()),
        None => select_candidate_tx(&mut tx, agent.role.as_deref()).await?,
    };

    let Some(candidate_id) = candidate else {
        tx.rollback().await?;
        return Err(AquaError::NoTask);
    };

    let task_affected = sqlx::query(
        "UPDATE tasks SET status = 'claimed', claimed_by = ?, claimed_at = ?, claim_term = ?, \
         updated_at = ?, version = version + 1 WHERE id = ? AND status = 'pending'",
    )
    .bind(&agent.id)
    .bind(&now)
    .bind(term)
    .bind(&now)
    .bind(&candidate_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if task_affected == 0 {
        if task_id.is_some() {
            // A zero-row update on a caller-specified id is either a task
            // that never existed (NotFound) or one that exists but lost
            // the race / isn't pending anymore (RaceLost) — tell them apart
            // before the rollback discards the row we'd check against.
            let still_exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
                .bind(&candidate_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return if still_exists.is_some() {
                Err(AquaError::RaceLost)
            } else {
                Err(AquaError::NotFound {
                    what: "task",
                    id: candidate_id,
                })
            };
        }
        tx.rollback().await?;
        return Err(AquaError::NoTask);
    }

    sqlx::query("UPDATE agents SET current_task_id = ? WHERE id = ? AND current_task_id IS NULL")
        .bind(&candidate_id)
        .bind(&agent.id)
        .execute(&mut *tx)
        .await?;

    events::append_tx(
        &mut tx,
        "task_claimed",
        Some(&agent.id),
        Some(&candidate_id),
        serde_json::json!({"claim_term": term}),
    )
    .await?;
    tx.commit().await?;

    debug!(agent_id = %agent.id, task_id = %candidate_id, claim_term = term, "task claimed");
    get(store, &candidate_id).await
}

async fn select_candidate_tx(tx: &mut Transaction<'_, Sqlite>, role: Option<&str>) -> Result<Option<String>> {
    if let Some(role) = role.filter(|r| !r.is_empty()) {
        if let Some(id) = select_candidate_with_tags_tx(tx, &role_synonyms(role)).await? {
            return Ok(Some(id));
        }
    }
    select_candidate_with_tags_tx(tx, &[]).await
}

async fn select_candidate_with_tags_tx(
    tx: &mut Transaction<'_, Sqlite>,
    tags: &[String],
) -> Result<Option<String>> {
    let base = "SELECT t.id FROM tasks t \
         WHERE t.status = 'pending' \
           AND NOT EXISTS ( \
             SELECT 1 FROM task_dependencies td \
             JOIN tasks parent ON parent.id = td.depends_on \
             WHERE td.task_id = t.id AND parent.status != 'done' \
           )";

    let row: Option<(String,)> = if tags.is_empty() {
        sqlx::query_as(&format!("{base} ORDER BY t.priority DESC, t.created_at ASC LIMIT 1"))
            .fetch_optional(&mut **tx)
            .await?
    } else {
        let clause = tags
            .iter()
            .map(|_| "t.tags_json LIKE ?")
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!("{base} AND ({clause}) ORDER BY t.priority DESC, t.created_at ASC LIMIT 1");
        let mut q = sqlx::query_as(&sql);
        for tag in tags {
            q = q.bind(format!("%\"{tag}\"%"));
        }
        q.fetch_optional(&mut **tx).await?
    };

    Ok(row.map(|(id,)| id))
}

/// Update context and bump `version` (optimistic concurrency). Rejects if
/// the caller isn't the current claimer or `expected_version` is stale.
pub async fn progress(store: &Store, agent_id: &str, task_id: &str, context: Value, expected_version: i64) -> Result<Task> {
    let task = get(store, task_id).await?;
    if task.claimed_by.as_deref() != Some(agent_id) {
        return Err(AquaError::PermissionDenied {
            reason: format!("task {task_id} is not claimed by {agent_id}"),
        });
    }
    if task.version != expected_version {
        return Err(AquaError::StaleVersion {
            task_id: task_id.to_string(),
            expected: expected_version,
            actual: task.version,
        });
    }

    let now = Utc::now().to_rfc3339();
    let affected = sqlx::query(
        "UPDATE tasks SET context_json = ?, updated_at = ?, version = version + 1 \
         WHERE id = ? AND claimed_by = ? AND version = ?",
    )
    .bind(context.to_string())
    .bind(&now)
    .bind(task_id)
    .bind(agent_id)
    .bind(expected_version)
    .execute(store.pool())
    .await?
    .rows_affected();

    if affected == 0 {
        // Another `progress` call for the same expected_version committed
        // first between our read-check above and this write — the read
        // alone can't see that race, only the write's affected-row count can.
        let current = get(store, task_id).await?;
        return Err(AquaError::StaleVersion {
            task_id: task_id.to_string(),
            expected: expected_version,
            actual: current.version,
        });
    }

    get(store, task_id).await
}

/// Mark a claimed task done, clearing the claimer's `current_task_id`.
pub async fn done(store: &Store, agent_id: &str, task_id: &str, result: Option<String>) -> Result<Task> {
    let now = Utc::now().to_rfc3339();
    let mut tx = store.begin_immediate().await?;

    let affected = sqlx::query(
        "UPDATE tasks SET status = 'done', completed_at = ?, result = ?, updated_at = ?, \
         version = version + 1 WHERE id = ? AND claimed_by = ? AND status = 'claimed'",
    )
    .bind(&now)
    .bind(&result)
    .bind(&now)
    .bind(task_id)
    .bind(agent_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if affected == 0 {
        tx.rollback().await?;
        return Err(AquaError::PermissionDenied {
            reason: format!("task {task_id} is not claimed by {agent_id}"),
        });
    }

    sqlx::query("UPDATE agents SET current_task_id = NULL WHERE id = ? AND current_task_id = ?")
        .bind(agent_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

    events::append_tx(&mut tx, "task_done", Some(agent_id), Some(task_id), serde_json::json!({})).await?;
    tx.commit().await?;

    info!(agent_id, task_id, "task done");
    get(store, task_id).await
}

/// Mark a claimed task failed. If its retry budget isn't exhausted, the
/// recovery sweep later moves it back to pending (see `recovery::sweep`).
pub async fn fail(store: &Store, agent_id: &str, task_id: &str, error: &str) -> Result<Task> {
    let now = Utc::now().to_rfc3339();
    let mut tx = store.begin_immediate().await?;

    let affected = sqlx::query(
        "UPDATE tasks SET status = 'failed', error = ?, completed_at = ?, updated_at = ?, \
         retry_count = retry_count + 1, version = version + 1 \
         WHERE id = ? AND claimed_by = ? AND status = 'claimed'",
    )
    .bind(error)
    .bind(&now)
    .bind(&now)
    .bind(task_id)
    .bind(agent_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if affected == 0 {
        tx.rollback().await?;
        return Err(AquaError::PermissionDenied {
            reason: format!("task {task_id} is not claimed by {agent_id}"),
        });
    }

    sqlx::query("UPDATE agents SET current_task_id = NULL WHERE id = ? AND current_task_id = ?")
        .bind(agent_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

    events::append_tx(
        &mut tx,
        "task_failed",
        Some(agent_id),
        Some(task_id),
        serde_json::json!({"error": error}),
    )
    .await?;
    tx.commit().await?;

    tracing::warn!(agent_id, task_id, error, "task failed");
    get(store, task_id).await
}

/// Used by `agents::leave` and the recovery sweep: whatever task
/// `agent_id` currently has claimed goes back to abandoned with a bumped
/// retry count and a recorded reason. No-op if it has nothing claimed.
pub(crate) async fn abandon_current_task_tx(
    tx: &mut Transaction<'_, Sqlite>,
    agent_id: &str,
    reason: &str,
) -> Result<Option<String>> {
    let now = Utc::now().to_rfc3339();
    let claimed: Option<(String,)> =
        sqlx::query_as("SELECT id FROM tasks WHERE claimed_by = ? AND status = 'claimed'")
            .bind(agent_id)
            .fetch_optional(&mut **tx)
            .await?;

    let Some((task_id,)) = claimed else {
        return Ok(None);
    };

    sqlx::query(
        "UPDATE tasks SET status = 'abandoned', claimed_by = NULL, retry_count = retry_count + 1, \
         error = ?, updated_at = ?, version = version + 1 WHERE id = ?",
    )
    .bind(reason)
    .bind(&now)
    .bind(&task_id)
    .execute(&mut **tx)
    .await?;

    events::append_tx(
        tx,
        "task_abandoned",
        Some(agent_id),
        Some(&task_id),
        serde_json::json!({"reason": reason}),
    )
    .await?;

    Ok(Some(task_id))
}

pub async fn get(store: &Store, id: &str) -> Result<Task> {
    sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| AquaError::NotFound {
            what: "task",
            id: id.to_string(),
        })
}

pub async fn list(store: &Store, status: Option<&str>) -> Result<Vec<Task>> {
    Ok(match status {
        Some(s) => {
            sqlx::query_as("SELECT * FROM tasks WHERE status = ? ORDER BY priority DESC, created_at ASC")
                .bind(s)
                .fetch_all(store.pool())
                .await?
        }
        None => {
            sqlx::query_as("SELECT * FROM tasks ORDER BY priority DESC, created_at ASC")
                .fetch_all(store.pool())
                .await?
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{self, JoinOptions};

    async fn setup(dir: &std::path::Path) -> (Store, AquaConfig, agents::Agent) {
        let store = Store::open(dir).await.unwrap();
        let config = AquaConfig::load(dir);
        let agent = agents::join(&store, &config, "worker", JoinOptions::default())
            .await
            .unwrap();
        (store, config, agent)
    }

    #[tokio::test]
    async fn add_then_claim_atomically_assigns_current_task() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;

        let t = add(&store, &config, &agent.id, "do the thing", AddOptions::default())
            .await
            .unwrap();

        let claimed = claim(&store, &agent, None).await.unwrap();
        assert_eq!(claimed.id, t.id);
        assert_eq!(claimed.status, "claimed");

        let refreshed_agent = agents::get(&store, &agent.id).await.unwrap();
        assert_eq!(refreshed_agent.current_task_id.as_deref(), Some(t.id.as_str()));
    }

    #[tokio::test]
    async fn claim_picks_highest_priority_then_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;

        add(&store, &config, &agent.id, "low", AddOptions { priority: Some(3), ..Default::default() })
            .await
            .unwrap();
        let high = add(&store, &config, &agent.id, "high", AddOptions { priority: Some(9), ..Default::default() })
            .await
            .unwrap();

        let claimed = claim(&store, &agent, None).await.unwrap();
        assert_eq!(claimed.id, high.id);
    }

    #[tokio::test]
    async fn claim_with_no_pending_tasks_is_no_task() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _config, agent) = setup(dir.path()).await;
        let err = claim(&store, &agent, None).await.unwrap_err();
        assert!(matches!(err, AquaError::NoTask));
    }

    #[tokio::test]
    async fn agent_with_a_current_task_cannot_claim_another() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;
        add(&store, &config, &agent.id, "a", AddOptions::default()).await.unwrap();
        add(&store, &config, &agent.id, "b", AddOptions::default()).await.unwrap();

        let claimed_agent_state = {
            claim(&store, &agent, None).await.unwrap();
            agents::get(&store, &agent.id).await.unwrap()
        };
        let err = claim(&store, &claimed_agent_state, None).await.unwrap_err();
        assert!(matches!(err, AquaError::AlreadyHeld { .. }));
    }

    #[tokio::test]
    async fn dependent_task_is_not_claimable_until_parent_done() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;

        let parent = add(&store, &config, &agent.id, "parent", AddOptions::default()).await.unwrap();
        let child = add(
            &store,
            &config,
            &agent.id,
            "child",
            AddOptions { parents: vec![parent.id.clone()], priority: Some(10), ..Default::default() },
        )
        .await
        .unwrap();

        // Only the parent should be claimable even though the child has higher priority.
        let claimed = claim(&store, &agent, None).await.unwrap();
        assert_eq!(claimed.id, parent.id);

        done(&store, &agent.id, &parent.id, None).await.unwrap();
        let agent = agents::get(&store, &agent.id).await.unwrap();
        let claimed_child = claim(&store, &agent, None).await.unwrap();
        assert_eq!(claimed_child.id, child.id);
    }

    #[tokio::test]
    async fn cyclic_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;

        let a = add(&store, &config, &agent.id, "A", AddOptions::default()).await.unwrap();
        let b = add(
            &store,
            &config,
            &agent.id,
            "B",
            AddOptions { parents: vec![a.id.clone()], ..Default::default() },
        )
        .await
        .unwrap();

        // B already depends on A; closing A -> B would form a cycle.
        let err = link_dependency(&store, &agent.id, &a.id, &b.id).await.unwrap_err();
        assert!(matches!(err, AquaError::CycleDetected { .. }));

        let deps: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_dependencies WHERE task_id = ?")
            .bind(&a.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(deps.0, 0, "no edge should have been persisted");
    }

    #[tokio::test]
    async fn progress_rejects_stale_version() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;
        add(&store, &config, &agent.id, "t", AddOptions::default()).await.unwrap();
        let claimed = claim(&store, &agent, None).await.unwrap();

        let err = progress(&store, &agent.id, &claimed.id, serde_json::json!({"k": "v"}), 999)
            .await
            .unwrap_err();
        assert!(matches!(err, AquaError::StaleVersion { .. }));

        let updated = progress(&store, &agent.id, &claimed.id, serde_json::json!({"k": "v"}), claimed.version)
            .await
            .unwrap();
        assert_eq!(updated.context()["k"], "v");
    }

    #[tokio::test]
    async fn progress_second_writer_at_the_same_expected_version_loses_the_race() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;
        add(&store, &config, &agent.id, "t", AddOptions::default()).await.unwrap();
        let claimed = claim(&store, &agent, None).await.unwrap();

        // Both writers read the same version before either commits; the
        // first write wins and bumps the version, so the second's
        // conditional UPDATE must affect zero rows and surface StaleVersion
        // rather than silently reporting success.
        progress(&store, &agent.id, &claimed.id, serde_json::json!({"k": "first"}), claimed.version)
            .await
            .unwrap();

        let err = progress(&store, &agent.id, &claimed.id, serde_json::json!({"k": "second"}), claimed.version)
            .await
            .unwrap_err();
        assert!(matches!(err, AquaError::StaleVersion { .. }));

        let task = get(&store, &claimed.id).await.unwrap();
        assert_eq!(task.context()["k"], "first");
    }

    #[tokio::test]
    async fn claim_of_nonexistent_task_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _config, agent) = setup(dir.path()).await;
        let err = claim(&store, &agent, Some("deadbeef")).await.unwrap_err();
        assert!(matches!(err, AquaError::NotFound { .. }));
    }

    #[tokio::test]
    async fn claim_of_an_already_claimed_specific_task_id_is_race_lost() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;
        let t = add(&store, &config, &agent.id, "t", AddOptions::default()).await.unwrap();

        sqlx::query("UPDATE tasks SET status = 'claimed', claimed_by = 'someone-else' WHERE id = ?")
            .bind(&t.id)
            .execute(store.pool())
            .await
            .unwrap();

        let err = claim(&store, &agent, Some(&t.id)).await.unwrap_err();
        assert!(matches!(err, AquaError::RaceLost));
    }

    #[tokio::test]
    async fn fail_bumps_retry_count_and_clears_current_task() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;
        add(&store, &config, &agent.id, "t", AddOptions::default()).await.unwrap();
        let claimed = claim(&store, &agent, None).await.unwrap();

        let failed = fail(&store, &agent.id, &claimed.id, "boom").await.unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.retry_count, 1);

        let refreshed = agents::get(&store, &agent.id).await.unwrap();
        assert!(refreshed.current_task_id.is_none());
    }

    #[tokio::test]
    async fn done_is_rejected_for_non_claimer() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, agent) = setup(dir.path()).await;
        add(&store, &config, &agent.id, "t", AddOptions::default()).await.unwrap();
        let claimed = claim(&store, &agent, None).await.unwrap();

        let err = done(&store, "someone-else", &claimed.id, None).await.unwrap_err();
        assert!(matches!(err, AquaError::PermissionDenied { .. }));
    }
}
