// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-agent key/value context store.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use hub_core::Context;
use hub_error::{ErrorCode, HubError, HubResult};
use hub_store::{now_str, parse_ts, Store};
use sqlx::Row;

/// Read-query parameters for [`ContextStore::read`].
#[derive(Debug, Clone)]
pub struct ContextQuery {
    /// Restrict to one owning agent.
    pub agent_id: Option<String>,
    /// Restrict to one key.
    pub key: Option<String>,
    /// Restrict to one namespace.
    pub namespace: Option<String>,
    /// Delta filter: only rows strictly after this timestamp.
    pub updated_after: Option<DateTime<Utc>>,
    /// Max rows to return.
    pub limit: i64,
    /// Row offset.
    pub offset: i64,
}

impl Default for ContextQuery {
    fn default() -> Self {
        ContextQuery { agent_id: None, key: None, namespace: None, updated_after: None, limit: 100, offset: 0 }
    }
}

/// Per-agent key/value context store, upserted by `(agent_id, key)`.
#[derive(Clone)]
pub struct ContextStore {
    store: Store,
    max_value_chars: usize,
}

impl ContextStore {
    /// Wraps an already-open [`Store`], rejecting writes whose `value`
    /// exceeds `max_value_chars`.
    pub fn new(store: Store, max_value_chars: usize) -> ContextStore {
        ContextStore { store, max_value_chars }
    }

    /// Upserts `(agent_id, key)`, replacing `value`, `namespace`, `trace_id`,
    /// `span_id`, and `updated_at` wholesale.
    pub async fn upsert(
        &self,
        agent_id: &str,
        key: &str,
        value: &str,
        namespace: Option<&str>,
        trace_id: Option<&str>,
        span_id: Option<&str>,
    ) -> HubResult<Context> {
        if value.chars().count() > self.max_value_chars {
            return Err(HubError::new(
                ErrorCode::ValueTooLong,
                format!("context value exceeds {} characters", self.max_value_chars),
            ));
        }
        let namespace = match namespace {
            Some(ns) if !ns.is_empty() => ns,
            _ => "default",
        };
        let now = now_str();
        sqlx::query(
            "INSERT INTO context (agent_id, key, value, namespace, trace_id, span_id, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(agent_id, key) DO UPDATE SET
               value = excluded.value, namespace = excluded.namespace,
               trace_id = excluded.trace_id, span_id = excluded.span_id, updated_at = excluded.updated_at",
        )
        .bind(agent_id)
        .bind(key)
        .bind(value)
        .bind(namespace)
        .bind(trace_id)
        .bind(span_id)
        .bind(&now)
        .execute(self.store.pool())
        .await?;

        self.get(agent_id, key).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "context row vanished immediately after upsert"))
    }

    /// Fetches a single row by its primary key.
    pub async fn get(&self, agent_id: &str, key: &str) -> HubResult<Option<Context>> {
        let row = sqlx::query("SELECT agent_id, key, value, namespace, trace_id, span_id, updated_at FROM context WHERE agent_id = ? AND key = ?")
            .bind(agent_id)
            .bind(key)
            .fetch_optional(self.store.pool())
            .await?;
        row.map(row_to_context).transpose()
    }

    /// Reads rows matching `query`, ordered `updated_at DESC` by default.
    pub async fn read(&self, query: ContextQuery) -> HubResult<Vec<Context>> {
        let mut sql = String::from("SELECT agent_id, key, value, namespace, trace_id, span_id, updated_at FROM context WHERE 1=1");
        if query.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if query.key.is_some() {
            sql.push_str(" AND key = ?");
        }
        if query.namespace.is_some() {
            sql.push_str(" AND namespace = ?");
        }
        if query.updated_after.is_some() {
            sql.push_str(" AND updated_at > ?");
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(a) = &query.agent_id {
            q = q.bind(a);
        }
        if let Some(k) = &query.key {
            q = q.bind(k);
        }
        if let Some(ns) = &query.namespace {
            q = q.bind(ns);
        }
        if let Some(after) = query.updated_after {
            q = q.bind(after.to_rfc3339());
        }
        q = q.bind(query.limit).bind(query.offset);

        let rows = q.fetch_all(self.store.pool()).await?;
        rows.into_iter().map(row_to_context).collect()
    }
}

fn row_to_context(row: sqlx::sqlite::SqliteRow) -> HubResult<Context> {
    Ok(Context {
        agent_id: row.get("agent_id"),
        key: row.get("key"),
        value: row.get("value"),
        namespace: row.get("namespace"),
        trace_id: row.get("trace_id"),
        span_id: row.get("span_id"),
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_replaces_value_wholesale() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let ctx = ContextStore::new(store, 1000);
        ctx.upsert("a", "k", "v1", None, None, None).await.unwrap();
        let updated = ctx.upsert("a", "k", "v2", Some("ns1"), None, None).await.unwrap();
        assert_eq!(updated.value, "v2");
        assert_eq!(updated.namespace, "ns1");
    }

    #[tokio::test]
    async fn upsert_rejects_value_over_limit() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let ctx = ContextStore::new(store, 4);
        let err = ctx.upsert("a", "k", "toolong", None, None, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValueTooLong);
    }

    #[tokio::test]
    async fn empty_namespace_normalizes_to_default() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let ctx = ContextStore::new(store, 1000);
        let row = ctx.upsert("a", "k", "v", Some(""), None, None).await.unwrap();
        assert_eq!(row.namespace, "default");
    }

    #[tokio::test]
    async fn read_filters_by_namespace() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let ctx = ContextStore::new(store, 1000);
        ctx.upsert("a", "k1", "v1", Some("ns1"), None, None).await.unwrap();
        ctx.upsert("a", "k2", "v2", Some("ns2"), None, None).await.unwrap();
        let rows = ctx
            .read(ContextQuery { namespace: Some("ns1".into()), limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "k1");
    }
}
