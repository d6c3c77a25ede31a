//! Lease-based leader election with a monotonic fencing term.
//!
//! The leader row is a singleton (`id` is constrained to `1`). Election,
//! renewal, and take-over are each a single transaction so the read of the
//! current term and the conditional write that depends on it never race
//! against another caller's.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::FromRow;
use tracing::info;

use crate::config::AquaConfig;
use crate::error::Result;
use crate::events;
use crate::store::Store;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Leader {
    pub agent_id: String,
    pub term: i64,
    pub lease_expires_at: String,
    pub elected_at: String,
}

/// Outcome of [`try_become_leader`]: whether the caller holds (or now
/// holds) the lease, and the term it holds it at — `0` when it lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionResult {
    pub acquired: bool,
    pub term: i64,
}

/// Try to become (or remain) leader. See spec §4.6 for the four-way branch
/// this implements: first election, renewal, contention, and take-over
/// after lease expiry — each resolved inside one transaction.
pub async fn try_become_leader(
    store: &Store,
    config: &AquaConfig,
    agent_id: &str,
) -> Result<ElectionResult> {
    let now = Utc::now();
    let lease_until = (now + ChronoDuration::seconds(config.leader_lease_seconds as i64)).to_rfc3339();
    let now_str = now.to_rfc3339();

    let mut tx = store.begin_immediate().await?;

    let existing: Option<Leader> = sqlx::query_as("SELECT * FROM leader WHERE id = 1")
        .fetch_optional(&mut *tx)
        .await?;

    let result = match existing {
        None => {
            sqlx::query(
                "INSERT INTO leader (id, agent_id, term, lease_expires_at, elected_at) \
                 VALUES (1, ?, 1, ?, ?)",
            )
            .bind(agent_id)
            .bind(&lease_until)
            .bind(&now_str)
            .execute(&mut *tx)
            .await?;

            events::append_tx(
                &mut tx,
                "leader_elected",
                Some(agent_id),
                None,
                serde_json::json!({"term": 1}),
            )
            .await?;

            ElectionResult {
                acquired: true,
                term: 1,
            }
        }
        Some(leader) => {
            let expires: DateTime<Utc> = leader
                .lease_expires_at
                .parse()
                .unwrap_or_else(|_| now - ChronoDuration::seconds(1));

            if expires > now && leader.agent_id == agent_id {
                sqlx::query("UPDATE leader SET lease_expires_at = ? WHERE id = 1 AND term = ?")
                    .bind(&lease_until)
                    .bind(leader.term)
                    .execute(&mut *tx)
                    .await?;
                ElectionResult {
                    acquired: true,
                    term: leader.term,
                }
            } else if expires > now {
                ElectionResult {
                    acquired: false,
                    term: 0,
                }
            } else {
                let new_term = leader.term + 1;
                let affected = sqlx::query(
                    "UPDATE leader SET agent_id = ?, term = ?, lease_expires_at = ?, elected_at = ? \
                     WHERE id = 1 AND term = ?",
                )
                .bind(agent_id)
                .bind(new_term)
                .bind(&lease_until)
                .bind(&now_str)
                .bind(leader.term)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if affected == 1 {
                    events::append_tx(
                        &mut tx,
                        "leader_elected",
                        Some(agent_id),
                        None,
                        serde_json::json!({"term": new_term, "took_over_from": leader.agent_id}),
                    )
                    .await?;
                    info!(agent_id, term = new_term, took_over_from = %leader.agent_id, "leader take-over after lease expiry");
                    ElectionResult {
                        acquired: true,
                        term: new_term,
                    }
                } else {
                    // Another caller's take-over committed first — the
                    // fencing guard (`WHERE term = T`) did its job.
                    ElectionResult {
                        acquired: false,
                        term: 0,
                    }
                }
            }
        }
    };

    tx.commit().await?;
    Ok(result)
}

/// Current leader row, if any has ever been elected.
pub async fn current(store: &Store) -> Result<Option<Leader>> {
    Ok(sqlx::query_as("SELECT * FROM leader WHERE id = 1")
        .fetch_optional(store.pool())
        .await?)
}

/// True if `agent_id` currently holds an unexpired lease.
pub async fn is_leader(store: &Store, agent_id: &str) -> Result<bool> {
    match current(store).await? {
        Some(leader) => {
            let expires: DateTime<Utc> = leader
                .lease_expires_at
                .parse()
                .unwrap_or_else(|_| Utc::now() - ChronoDuration::seconds(1));
            Ok(leader.agent_id == agent_id && expires > Utc::now())
        }
        None => Ok(false),
    }
}

/// Voluntary step-down, called from `leave`. Only removes the row if
/// `agent_id` is still the recorded leader at `term` — a deposed former
/// leader calling this after a take-over is a no-op, not an error.
pub async fn step_down(store: &Store, agent_id: &str) -> Result<()> {
    let mut tx = store.begin_immediate().await?;
    let existing: Option<Leader> = sqlx::query_as("SELECT * FROM leader WHERE id = 1")
        .fetch_optional(&mut *tx)
        .await?;

    if let Some(leader) = existing {
        if leader.agent_id == agent_id {
            sqlx::query("DELETE FROM leader WHERE id = 1 AND agent_id = ? AND term = ?")
                .bind(agent_id)
                .bind(leader.term)
                .execute(&mut *tx)
                .await?;
            events::append_tx(
                &mut tx,
                "leader_stepped_down",
                Some(agent_id),
                None,
                serde_json::json!({"term": leader.term}),
            )
            .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{self, JoinOptions};

    async fn setup(dir: &std::path::Path) -> (Store, AquaConfig) {
        let store = Store::open(dir).await.unwrap();
        (store, AquaConfig::load(dir))
    }

    #[tokio::test]
    async fn first_caller_becomes_leader_at_term_1() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path()).await;
        let a = agents::join(&store, &config, "a", JoinOptions::default()).await.unwrap();

        let result = try_become_leader(&store, &config, &a.id).await.unwrap();
        assert_eq!(result, ElectionResult { acquired: true, term: 1 });
    }

    #[tokio::test]
    async fn second_caller_is_rejected_while_lease_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path()).await;
        let a = agents::join(&store, &config, "a", JoinOptions::default()).await.unwrap();
        let b = agents::join(&store, &config, "b", JoinOptions::default()).await.unwrap();

        try_become_leader(&store, &config, &a.id).await.unwrap();
        let result = try_become_leader(&store, &config, &b.id).await.unwrap();
        assert_eq!(result, ElectionResult { acquired: false, term: 0 });

        let current_leader = current(&store).await.unwrap().unwrap();
        assert_eq!(current_leader.agent_id, a.id);
    }

    #[tokio::test]
    async fn renewal_keeps_same_term() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path()).await;
        let a = agents::join(&store, &config, "a", JoinOptions::default()).await.unwrap();

        try_become_leader(&store, &config, &a.id).await.unwrap();
        let renewed = try_become_leader(&store, &config, &a.id).await.unwrap();
        assert_eq!(renewed, ElectionResult { acquired: true, term: 1 });
    }

    #[tokio::test]
    async fn takeover_after_expiry_increments_term() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path()).await;
        let a = agents::join(&store, &config, "a", JoinOptions::default()).await.unwrap();
        let b = agents::join(&store, &config, "b", JoinOptions::default()).await.unwrap();

        try_become_leader(&store, &config, &a.id).await.unwrap();
        sqlx::query("UPDATE leader SET lease_expires_at = '2000-01-01T00:00:00+00:00' WHERE id = 1")
            .execute(store.pool())
            .await
            .unwrap();

        let result = try_become_leader(&store, &config, &b.id).await.unwrap();
        assert_eq!(result, ElectionResult { acquired: true, term: 2 });
    }

    #[tokio::test]
    async fn step_down_removes_row_for_current_leader_only() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path()).await;
        let a = agents::join(&store, &config, "a", JoinOptions::default()).await.unwrap();

        try_become_leader(&store, &config, &a.id).await.unwrap();
        step_down(&store, "someone-else").await.unwrap();
        assert!(current(&store).await.unwrap().is_some());

        step_down(&store, &a.id).await.unwrap();
        assert!(current(&store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn is_leader_reflects_lease_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(dir.path()).await;
        let a = agents::join(&store, &config, "a", JoinOptions::default()).await.unwrap();

        try_become_leader(&store, &config, &a.id).await.unwrap();
        assert!(is_leader(&store, &a.id).await.unwrap());

        sqlx::query("UPDATE leader SET lease_expires_at = '2000-01-01T00:00:00+00:00' WHERE id = 1")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(!is_leader(&store, &a.id).await.unwrap());
    }
}
