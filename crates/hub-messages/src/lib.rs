// SPDX-License-Identifier: MIT OR Apache-2.0
//! Point-to-point and broadcast messaging.
//!
//! A message with `to_agent = None` is a broadcast visible to every agent;
//! read marks live in a separate per-`(message, agent)` table so broadcasts
//! can be read by many recipients independently.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use hub_core::{Message, MessageCursor};
use hub_error::{ErrorCode, HubError, HubResult};
use hub_store::{now_str, parse_ts, Store};
use serde_json::Value;
use sqlx::Row;

/// A message row annotated with whether `agent_id` has read it.
#[derive(Debug, Clone)]
pub struct MessageView {
    /// The underlying message.
    pub message: Message,
    /// Whether the requesting agent has a read mark for this message.
    pub read: bool,
}

/// Read-query parameters for [`MessageBus::read`].
#[derive(Debug, Clone)]
pub struct ReadQuery {
    /// Restrict to messages sent by this agent.
    pub from: Option<String>,
    /// Restrict to messages with no read mark for the requesting agent.
    pub unread_only: bool,
    /// Delta filter: only messages strictly after this timestamp.
    pub since_ts: Option<DateTime<Utc>>,
    /// Delta filter: only messages strictly after this cursor.
    pub cursor: Option<MessageCursor>,
    /// Max rows to return.
    pub limit: i64,
    /// Row offset (only meaningful without `since_ts`/`cursor`).
    pub offset: i64,
}

impl Default for ReadQuery {
    fn default() -> Self {
        ReadQuery { from: None, unread_only: false, since_ts: None, cursor: None, limit: 100, offset: 0 }
    }
}

/// Point-to-point / broadcast message bus with per-recipient read marks.
#[derive(Clone)]
pub struct MessageBus {
    store: Store,
    max_content_chars: usize,
}

impl MessageBus {
    /// Wraps an already-open [`Store`], rejecting sends whose `content`
    /// exceeds `max_content_chars`.
    pub fn new(store: Store, max_content_chars: usize) -> MessageBus {
        MessageBus { store, max_content_chars }
    }

    /// Sends a message. `to` of `None` marks a broadcast.
    pub async fn send(
        &self,
        from: &str,
        to: Option<&str>,
        content: &str,
        metadata: Value,
        trace_id: Option<&str>,
        span_id: Option<&str>,
    ) -> HubResult<Message> {
        if content.chars().count() > self.max_content_chars {
            return Err(HubError::new(
                ErrorCode::ContentTooLong,
                format!("message content exceeds {} characters", self.max_content_chars),
            ));
        }
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| HubError::new(ErrorCode::SerializationError, "metadata serialization failed").with_source(e))?;
        let now = now_str();
        let inserted = sqlx::query(
            "INSERT INTO messages (from_agent, to_agent, content, metadata, trace_id, span_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(from)
        .bind(to)
        .bind(content)
        .bind(&metadata_json)
        .bind(trace_id)
        .bind(span_id)
        .bind(&now)
        .execute(self.store.pool())
        .await?;
        let id = inserted.last_insert_rowid();
        self.fetch_message(id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "message vanished immediately after insert"))
    }

    /// Reads messages visible to `agent_id` (`to_agent = agent_id OR
    /// to_agent IS NULL`). Delta mode (`since_ts` or `cursor` set) orders
    /// ascending by `(created_at, id)`; default mode orders descending.
    /// Marks every returned row read for `agent_id` as a side effect.
    pub async fn read(&self, agent_id: &str, query: ReadQuery) -> HubResult<Vec<MessageView>> {
        let delta_mode = query.since_ts.is_some() || query.cursor.is_some();

        let mut sql = String::from(
            "SELECT m.id, m.from_agent, m.to_agent, m.content, m.metadata, m.trace_id, m.span_id, m.created_at,
                    EXISTS(SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.agent_id = ?) as is_read
             FROM messages m WHERE (m.to_agent = ? OR m.to_agent IS NULL)",
        );
        if query.from.is_some() {
            sql.push_str(" AND m.from_agent = ?");
        }
        if query.unread_only {
            sql.push_str(" AND NOT EXISTS (SELECT 1 FROM message_reads r2 WHERE r2.message_id = m.id AND r2.agent_id = ?)");
        }
        if let Some(cursor) = &query.cursor {
            sql.push_str(" AND (m.created_at > ? OR (m.created_at = ? AND m.id > ?))");
        } else if query.since_ts.is_some() {
            sql.push_str(" AND m.created_at > ?");
        }
        if delta_mode {
            sql.push_str(" ORDER BY m.created_at ASC, m.id ASC");
        } else {
            sql.push_str(" ORDER BY m.created_at DESC, m.id DESC");
        }
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql).bind(agent_id).bind(agent_id);
        if let Some(from) = &query.from {
            q = q.bind(from);
        }
        if query.unread_only {
            q = q.bind(agent_id);
        }
        if let Some(cursor) = &query.cursor {
            let ts = cursor.created_at().to_rfc3339();
            q = q.bind(ts.clone()).bind(ts).bind(cursor.id);
        } else if let Some(since) = query.since_ts {
            q = q.bind(since.to_rfc3339());
        }
        q = q.bind(query.limit).bind(query.offset);

        let rows = q.fetch_all(self.store.pool()).await?;
        let mut out = Vec::with_capacity(rows.len());
        let now = now_str();
        for row in rows {
            let message = row_to_message(&row)?;
            let was_read: bool = row.get("is_read");
            if !was_read {
                sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, agent_id, read_at) VALUES (?, ?, ?)")
                    .bind(message.id)
                    .bind(agent_id)
                    .bind(&now)
                    .execute(self.store.pool())
                    .await?;
            }
            out.push(MessageView { message, read: true });
        }
        Ok(out)
    }

    /// Returns a single message iff visible to `agent_id`, marking it read.
    pub async fn get_for_agent(&self, agent_id: &str, message_id: i64) -> HubResult<Option<MessageView>> {
        let row = sqlx::query(
            "SELECT id, from_agent, to_agent, content, metadata, trace_id, span_id, created_at FROM messages
             WHERE id = ? AND (to_agent = ? OR to_agent IS NULL)",
        )
        .bind(message_id)
        .bind(agent_id)
        .fetch_optional(self.store.pool())
        .await?;
        let Some(row) = row else { return Ok(None) };
        let message = row_to_message(&row)?;
        let now = now_str();
        sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, agent_id, read_at) VALUES (?, ?, ?)")
            .bind(message_id)
            .bind(agent_id)
            .bind(&now)
            .execute(self.store.pool())
            .await?;
        Ok(Some(MessageView { message, read: true }))
    }

    async fn fetch_message(&self, id: i64) -> HubResult<Option<Message>> {
        let row = sqlx::query("SELECT id, from_agent, to_agent, content, metadata, trace_id, span_id, created_at FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> HubResult<Message> {
    let metadata_raw: String = row.get("metadata");
    let metadata: Value = serde_json::from_str(&metadata_raw)
        .map_err(|e| HubError::new(ErrorCode::SerializationError, "stored message metadata is corrupt").with_source(e))?;
    Ok(Message {
        id: row.get("id"),
        from_agent: row.get("from_agent"),
        to_agent: row.get("to_agent"),
        content: row.get("content"),
        metadata,
        trace_id: row.get("trace_id"),
        span_id: row.get("span_id"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_rejects_content_over_limit() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let bus = MessageBus::new(store, 8);
        let err = bus.send("a", Some("b"), "way too long", json!({}), None, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ContentTooLong);
    }

    #[tokio::test]
    async fn broadcast_visible_to_any_agent() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let bus = MessageBus::new(store, 1000);
        bus.send("a", None, "hello all", json!({}), None, None).await.unwrap();
        let for_b = bus.read("b", ReadQuery::default()).await.unwrap();
        assert_eq!(for_b.len(), 1);
    }

    #[tokio::test]
    async fn read_marks_are_per_recipient() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let bus = MessageBus::new(store, 1000);
        bus.send("a", None, "hello all", json!({}), None, None).await.unwrap();
        bus.read("b", ReadQuery::default()).await.unwrap();
        let unread_for_b = bus.read("b", ReadQuery { unread_only: true, ..Default::default() }).await.unwrap();
        assert!(unread_for_b.is_empty());
        let unread_for_c = bus.read("c", ReadQuery { unread_only: true, ..Default::default() }).await.unwrap();
        assert_eq!(unread_for_c.len(), 1);
    }

    #[tokio::test]
    async fn targeted_message_not_visible_to_other_agent() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let bus = MessageBus::new(store, 1000);
        bus.send("a", Some("b"), "just for b", json!({}), None, None).await.unwrap();
        let for_c = bus.read("c", ReadQuery::default()).await.unwrap();
        assert!(for_c.is_empty());
        let for_b = bus.read("b", ReadQuery::default()).await.unwrap();
        assert_eq!(for_b.len(), 1);
    }

    #[tokio::test]
    async fn delta_read_orders_ascending_by_cursor() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let bus = MessageBus::new(store, 1000);
        let m1 = bus.send("a", None, "first", json!({}), None, None).await.unwrap();
        let m2 = bus.send("a", None, "second", json!({}), None, None).await.unwrap();
        let cursor = MessageCursor { created_at_ms: m1.created_at.timestamp_millis() - 1, id: 0 };
        let results = bus.read("b", ReadQuery { cursor: Some(cursor), limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message.id, m1.id);
        assert_eq!(results[1].message.id, m2.id);
    }
}
