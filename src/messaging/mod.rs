//! Inter-agent messaging: broadcast/direct/addressed sends and a blocking
//! ask/reply built on top of polling — there is no cross-process
//! condition-variable notification, so `ask` simply sleeps between reads.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::FromRow;

use crate::agents;
use crate::error::{AquaError, Result};
use crate::events;
use crate::store::Store;

/// Special `to_agent` addresses recognized at read time, not stored
/// specially — the row always holds exactly what the sender wrote.
pub const ADDR_LEADER: &str = "@leader";
pub const ADDR_IDLE: &str = "@idle";

/// Default interval between polls in `ask`; bounded per spec to 0.5–2s.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Request,
    Response,
    System,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::System => "system",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub id: i64,
    pub from_agent: String,
    pub to_agent: Option<String>,
    pub content: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub created_at: String,
    pub read_at: Option<String>,
    pub reply_to: Option<i64>,
}

/// Insert a message. `to` is `None` for broadcast, or an agent id /
/// `@leader` / `@idle` otherwise — resolution happens at read time.
pub async fn send(store: &Store, from: &str, to: Option<&str>, content: &str, kind: MessageType) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO messages (from_agent, to_agent, content, type, created_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(from)
    .bind(to)
    .bind(content)
    .bind(kind.as_str())
    .bind(&now)
    .fetch_one(store.pool())
    .await?;

    events::append(
        store,
        "message_sent",
        Some(from),
        None,
        serde_json::json!({"to": to, "type": kind.as_str(), "message_id": id}),
    )
    .await?;

    Ok(id)
}

/// Messages addressed to `agent`: directly, broadcast, or via `@leader`/
/// `@idle` if it currently qualifies. `unread_only` filters to
/// `read_at IS NULL`; matched rows are stamped read exactly once.
pub async fn inbox(store: &Store, agent: &agents::Agent, unread_only: bool) -> Result<Vec<Message>> {
    let is_leader = crate::leader::is_leader(store, &agent.id).await?;
    let is_idle = agent.is_idle();

    let mut clauses = vec!["to_agent = ?".to_string(), "to_agent IS NULL".to_string()];
    if is_leader {
        clauses.push(format!("to_agent = '{ADDR_LEADER}'"));
    }
    if is_idle {
        clauses.push(format!("to_agent = '{ADDR_IDLE}'"));
    }
    let where_clause = clauses.join(" OR ");

    let sql = if unread_only {
        format!("SELECT * FROM messages WHERE ({where_clause}) AND read_at IS NULL ORDER BY id ASC")
    } else {
        format!("SELECT * FROM messages WHERE ({where_clause}) ORDER BY id ASC")
    };

    let messages: Vec<Message> = sqlx::query_as(&sql).bind(&agent.id).fetch_all(store.pool()).await?;

    let now = Utc::now().to_rfc3339();
    let unread_ids: Vec<i64> = messages.iter().filter(|m| m.read_at.is_none()).map(|m| m.id).collect();
    for id in &unread_ids {
        sqlx::query("UPDATE messages SET read_at = ? WHERE id = ? AND read_at IS NULL")
            .bind(&now)
            .bind(id)
            .execute(store.pool())
            .await?;
    }

    Ok(messages)
}

/// Send a request and return its message id — the handle `ask` polls on.
pub async fn ask_send(store: &Store, from: &str, to: Option<&str>, content: &str) -> Result<i64> {
    send(store, from, to, content, MessageType::Request).await
}

/// Block (by polling) until a response to `request_id` appears or
/// `timeout` elapses.
pub async fn ask_wait(store: &Store, request_id: i64, timeout: Duration) -> Result<Message> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(reply) = find_reply(store, request_id).await? {
            return Ok(reply);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(AquaError::Timeout { request_id });
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL.min(deadline - tokio::time::Instant::now())).await;
    }
}

/// Convenience wrapper combining [`ask_send`] and [`ask_wait`].
pub async fn ask(store: &Store, from: &str, to: Option<&str>, content: &str, timeout: Duration) -> Result<Message> {
    let request_id = ask_send(store, from, to, content).await?;
    ask_wait(store, request_id, timeout).await
}

async fn find_reply(store: &Store, request_id: i64) -> Result<Option<Message>> {
    Ok(sqlx::query_as("SELECT * FROM messages WHERE reply_to = ? ORDER BY id ASC LIMIT 1")
        .bind(request_id)
        .fetch_optional(store.pool())
        .await?)
}

/// Answer a request. Fails if `request_id` doesn't reference an existing
/// message.
pub async fn reply(store: &Store, from: &str, request_id: i64, content: &str) -> Result<i64> {
    let request: Option<(String,)> = sqlx::query_as("SELECT from_agent FROM messages WHERE id = ?")
        .bind(request_id)
        .fetch_optional(store.pool())
        .await?;
    let Some((requester,)) = request else {
        return Err(AquaError::NotFound {
            what: "message",
            id: request_id.to_string(),
        });
    };

    let now = Utc::now().to_rfc3339();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO messages (from_agent, to_agent, content, type, created_at, reply_to) \
         VALUES (?, ?, ?, 'response', ?, ?) RETURNING id",
    )
    .bind(from)
    .bind(&requester)
    .bind(content)
    .bind(&now)
    .bind(request_id)
    .fetch_one(store.pool())
    .await?;

    events::append(
        store,
        "message_replied",
        Some(from),
        None,
        serde_json::json!({"request_id": request_id, "message_id": id}),
    )
    .await?;

    Ok(id)
}
