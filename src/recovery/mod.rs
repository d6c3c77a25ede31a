//! Dead-agent detection, stuck-claim reclaim, and the wall-clock gating
//! that decides who runs the sweep and when.
//!
//! There is no background thread: every kernel operation calls
//! [`maybe_sweep`] at entry, which runs the sweep only if the caller is
//! leader (at most once per heartbeat interval) or if, opportunistically,
//! more than `2 * agent_dead_threshold_seconds` has elapsed since the last
//! recorded sweep — so a quorum with no leader still eventually recovers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::agents::{self, release_agent_tx};
use crate::config::AquaConfig;
use crate::error::Result;
use crate::events;
use crate::leader;
use crate::store::Store;

const LAST_SWEEP_SETTING_KEY: &str = "last_sweep_at";

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub agents_marked_dead: u32,
    pub agents_unresponsive_but_alive: u32,
    pub tasks_abandoned_for_dead_agents: u32,
    pub stuck_claims_reclaimed: u32,
    pub abandoned_tasks_reopened: u32,
}

/// Run the sweep if the caller is leader, or if it's been long enough that
/// any agent should pick up the slack. No-op (and cheap: one settings
/// read) otherwise.
pub async fn maybe_sweep(store: &Store, config: &AquaConfig, caller_agent_id: &str) -> Result<Option<SweepReport>> {
    let caller_is_leader = leader::is_leader(store, caller_agent_id).await?;

    if caller_is_leader {
        if due_since_last_sweep(store, config.heartbeat_interval_seconds).await? {
            return Ok(Some(sweep(store, config).await?));
        }
        return Ok(None);
    }

    if due_since_last_sweep(store, config.agent_dead_threshold_seconds * 2).await? {
        return Ok(Some(sweep(store, config).await?));
    }

    Ok(None)
}

async fn due_since_last_sweep(store: &Store, min_interval_seconds: u64) -> Result<bool> {
    let last: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(LAST_SWEEP_SETTING_KEY)
        .fetch_optional(store.pool())
        .await?;

    let Some((raw,)) = last else {
        return Ok(true);
    };
    let last_at: DateTime<Utc> = raw.parse().unwrap_or_else(|_| Utc::now() - ChronoDuration::days(1));
    Ok(Utc::now() - last_at >= ChronoDuration::seconds(min_interval_seconds as i64))
}

async fn record_sweep_ran(store: &Store) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
        .bind(LAST_SWEEP_SETTING_KEY)
        .bind(&now)
        .execute(store.pool())
        .await?;
    Ok(())
}

/// The full recovery algorithm (spec §4.7): dead-agent detection, lock and
/// claim release for the dead, and reclaim of abandoned/failed tasks and
/// stuck claims.
pub async fn sweep(store: &Store, config: &AquaConfig) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let dead_cutoff = (Utc::now() - ChronoDuration::seconds(config.agent_dead_threshold_seconds as i64)).to_rfc3339();

    let candidates: Vec<(String, Option<i64>)> = sqlx::query_as(
        "SELECT id, pid FROM agents WHERE status = 'active' AND last_heartbeat_at < ?",
    )
    .bind(&dead_cutoff)
    .fetch_all(store.pool())
    .await?;

    for (agent_id, pid) in candidates {
        let process_alive = pid.map(agents::pid_is_alive).unwrap_or(false);
        if process_alive {
            events::append(
                store,
                "agent_unresponsive",
                Some(&agent_id),
                None,
                serde_json::json!({"reason": "heartbeat stale but process still running"}),
            )
            .await?;
            warn!(agent_id, "heartbeat stale but process still alive");
            report.agents_unresponsive_but_alive += 1;
            continue;
        }

        let mut tx = store.begin_immediate().await?;
        sqlx::query("UPDATE agents SET status = 'dead' WHERE id = ?")
            .bind(&agent_id)
            .execute(&mut *tx)
            .await?;
        if release_agent_tx(&mut tx, &agent_id, "agent died").await?.is_some() {
            report.tasks_abandoned_for_dead_agents += 1;
        }
        events::append_tx(&mut tx, "agent_died", Some(&agent_id), None, serde_json::json!({})).await?;
        tx.commit().await?;
        warn!(agent_id, "agent marked dead by recovery sweep");
        report.agents_marked_dead += 1;
    }

    report.abandoned_tasks_reopened += reopen_retriable_tasks(store).await?;
    report.stuck_claims_reclaimed += reclaim_stuck_claims(store, config).await?;
    // A second pass: claims just reclaimed above become 'abandoned', then
    // immediately eligible for the same retry-budget reopen as step 3's.
    report.abandoned_tasks_reopened += reopen_retriable_tasks(store).await?;

    record_sweep_ran(store).await?;
    info!(
        agents_marked_dead = report.agents_marked_dead,
        tasks_abandoned_for_dead_agents = report.tasks_abandoned_for_dead_agents,
        stuck_claims_reclaimed = report.stuck_claims_reclaimed,
        abandoned_tasks_reopened = report.abandoned_tasks_reopened,
        "recovery sweep complete"
    );
    Ok(report)
}

/// `abandoned` and `failed` tasks under their retry budget go back to
/// `pending`. Fail's own documented contract says a retriable failure is
/// picked up by "the recovery sweep later" — this is that pickup.
async fn reopen_retriable_tasks(store: &Store) -> Result<u32> {
    let now = Utc::now().to_rfc3339();
    let affected = sqlx::query(
        "UPDATE tasks SET status = 'pending', updated_at = ?, version = version + 1 \
         WHERE status IN ('abandoned', 'failed') AND retry_count < max_retries",
    )
    .bind(&now)
    .execute(store.pool())
    .await?
    .rows_affected();
    Ok(affected as u32)
}

/// Claims whose `claimed_at` is older than `task_claim_timeout_seconds`
/// are stuck regardless of whether their owning agent is alive — treat
/// them the same way step 3 treats a dead agent's claims, without
/// touching the agent row.
async fn reclaim_stuck_claims(store: &Store, config: &AquaConfig) -> Result<u32> {
    let cutoff = (Utc::now() - ChronoDuration::seconds(config.task_claim_timeout_seconds as i64)).to_rfc3339();
    let now = Utc::now().to_rfc3339();

    let stuck: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT id, claimed_by FROM tasks WHERE status = 'claimed' AND claimed_at < ?",
    )
    .bind(&cutoff)
    .fetch_all(store.pool())
    .await?;

    for (task_id, claimed_by) in &stuck {
        sqlx::query(
            "UPDATE tasks SET status = 'abandoned', claimed_by = NULL, retry_count = retry_count + 1, \
             error = 'stuck claim reclaimed', updated_at = ?, version = version + 1 WHERE id = ?",
        )
        .bind(&now)
        .bind(task_id)
        .execute(store.pool())
        .await?;

        if let Some(agent_id) = claimed_by {
            sqlx::query("UPDATE agents SET current_task_id = NULL WHERE id = ? AND current_task_id = ?")
                .bind(agent_id)
                .bind(task_id)
                .execute(store.pool())
                .await?;
        }

        events::append(
            store,
            "task_stuck_claim_reclaimed",
            claimed_by.as_deref(),
            Some(task_id),
            serde_json::json!({}),
        )
        .await?;
    }

    Ok(stuck.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{self as agents_mod, JoinOptions};
    use crate::tasks::{self, AddOptions};

    #[tokio::test]
    async fn sweep_marks_stale_agent_dead_and_reclaims_its_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let config = AquaConfig::load(dir.path());

        let dead_agent = agents_mod::join(
            &store,
            &config,
            "victim",
            JoinOptions { pid: Some(999_999_999), ..Default::default() },
        )
        .await
        .unwrap();
        let rescuer = agents_mod::join(&store, &config, "rescuer", JoinOptions::default())
            .await
            .unwrap();

        tasks::add(&store, &config, &dead_agent.id, "doomed", AddOptions::default())
            .await
            .unwrap();
        let claimed = tasks::claim(&store, &dead_agent, None).await.unwrap();

        let stale = (Utc::now() - ChronoDuration::seconds(config.agent_dead_threshold_seconds as i64 + 1)).to_rfc3339();
        sqlx::query("UPDATE agents SET last_heartbeat_at = ? WHERE id = ?")
            .bind(&stale)
            .bind(&dead_agent.id)
            .execute(store.pool())
            .await
            .unwrap();

        let report = sweep(&store, &config).await.unwrap();
        assert_eq!(report.agents_marked_dead, 1);
        assert_eq!(report.tasks_abandoned_for_dead_agents, 1);

        let refreshed_agent = agents_mod::get(&store, &dead_agent.id).await.unwrap();
        assert_eq!(refreshed_agent.status, "dead");

        // retry_count(1) < max_retries(3) -> reopened to pending by the same sweep.
        let task = tasks::get(&store, &claimed.id).await.unwrap();
        assert_eq!(task.status, "pending");
        assert_eq!(task.retry_count, 1);

        let reclaimed = tasks::claim(&store, &rescuer, None).await.unwrap();
        assert_eq!(reclaimed.id, claimed.id);
    }

    #[tokio::test]
    async fn stale_heartbeat_with_live_pid_is_unresponsive_not_dead() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let config = AquaConfig::load(dir.path());

        let agent = agents_mod::join(
            &store,
            &config,
            "slow",
            JoinOptions { pid: Some(std::process::id() as i64), ..Default::default() },
        )
        .await
        .unwrap();

        let stale = (Utc::now() - ChronoDuration::seconds(config.agent_dead_threshold_seconds as i64 + 1)).to_rfc3339();
        sqlx::query("UPDATE agents SET last_heartbeat_at = ? WHERE id = ?")
            .bind(&stale)
            .bind(&agent.id)
            .execute(store.pool())
            .await
            .unwrap();

        let report = sweep(&store, &config).await.unwrap();
        assert_eq!(report.agents_marked_dead, 0);
        assert_eq!(report.agents_unresponsive_but_alive, 1);

        let refreshed = agents_mod::get(&store, &agent.id).await.unwrap();
        assert_eq!(refreshed.status, "active");
    }

    #[tokio::test]
    async fn stuck_claim_is_reclaimed_without_touching_a_live_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let config = AquaConfig::load(dir.path());

        let agent = agents_mod::join(&store, &config, "holder", JoinOptions::default())
            .await
            .unwrap();
        tasks::add(&store, &config, &agent.id, "stuck", AddOptions::default())
            .await
            .unwrap();
        let claimed = tasks::claim(&store, &agent, None).await.unwrap();

        let old = (Utc::now() - ChronoDuration::seconds(config.task_claim_timeout_seconds as i64 + 1)).to_rfc3339();
        sqlx::query("UPDATE tasks SET claimed_at = ? WHERE id = ?")
            .bind(&old)
            .bind(&claimed.id)
            .execute(store.pool())
            .await
            .unwrap();

        let report = sweep(&store, &config).await.unwrap();
        assert_eq!(report.stuck_claims_reclaimed, 1);

        let refreshed_agent = agents_mod::get(&store, &agent.id).await.unwrap();
        assert_eq!(refreshed_agent.status, "active");
        assert!(refreshed_agent.current_task_id.is_none());
    }

    #[tokio::test]
    async fn maybe_sweep_runs_immediately_the_first_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let config = AquaConfig::load(dir.path());
        let agent = agents_mod::join(&store, &config, "a", JoinOptions::default())
            .await
            .unwrap();

        let ran = maybe_sweep(&store, &config, &agent.id).await.unwrap();
        assert!(ran.is_some());
    }
}
