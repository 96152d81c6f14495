// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-stream monotonic watermark oracle.
//!
//! Four scalar watermarks drive every long-poll / delta-read call: the
//! latest `messages` timestamp visible to a given agent, and three
//! shared watermarks (`tasks`, `context`, `activity`) visible to every
//! agent identically. The three shared watermarks are cached with a
//! bounded freshness window; the per-agent message watermark is cached
//! in a bounded map since it cannot be shared across agents.
//!
//! Mutating components call [`ClockWatermarks::invalidate`] immediately
//! after their commit so the freshness guarantee ("visible no later than
//! `WATERMARK_CACHE_MS` after the mutating commit") holds
//! even when the cache was refreshed moments before the mutation, not
//! just on average.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use hub_core::Cursor;
use hub_error::HubResult;
use hub_store::{parse_ts, Store};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Which of the four watermark streams a caller is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Per-agent visible-message timestamps.
    Messages,
    /// Shared task `updated_at` watermark.
    Tasks,
    /// Shared context `updated_at` watermark.
    Context,
    /// Shared activity-log `created_at` watermark.
    Activity,
}

impl Stream {
    /// All four streams, the default selector for `wait_for_updates`.
    pub const ALL: [Stream; 4] = [Stream::Messages, Stream::Tasks, Stream::Context, Stream::Activity];

    /// Parses a stream name as accepted by the `streams` query parameter.
    pub fn parse(name: &str) -> Option<Stream> {
        match name {
            "messages" => Some(Stream::Messages),
            "tasks" => Some(Stream::Tasks),
            "context" => Some(Stream::Context),
            "activity" => Some(Stream::Activity),
            _ => None,
        }
    }

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Messages => "messages",
            Stream::Tasks => "tasks",
            Stream::Context => "context",
            Stream::Activity => "activity",
        }
    }
}

/// Caller-supplied substitutes for streams the caller does not want
/// recomputed (e.g. because it just performed the mutation and already
/// knows the resulting value).
#[derive(Debug, Clone, Copy, Default)]
pub struct WatermarkFallback {
    /// Override for the `tasks` watermark (epoch-millis).
    pub tasks: Option<i64>,
    /// Override for the `context` watermark (epoch-millis).
    pub context: Option<i64>,
    /// Override for the `activity` watermark (epoch-millis).
    pub activity: Option<i64>,
}

struct CachedValue {
    value: i64,
    at: Instant,
}

struct SharedCache {
    tasks: Option<CachedValue>,
    context: Option<CachedValue>,
    activity: Option<CachedValue>,
}

impl SharedCache {
    fn empty() -> Self {
        SharedCache { tasks: None, context: None, activity: None }
    }
}

/// Bounded map of per-agent message watermarks.
///
/// Eviction prefers entries whose cached value is already stale (past
/// the freshness window) over arbitrary ones: this is deliberately not
/// a strict LRU.
struct AgentMessageCache {
    entries: HashMap<String, CachedValue>,
    order: VecDeque<String>,
    max_entries: usize,
}

impl AgentMessageCache {
    fn new(max_entries: usize) -> Self {
        AgentMessageCache { entries: HashMap::new(), order: VecDeque::new(), max_entries }
    }

    fn get_fresh(&self, agent_id: &str, ttl: Duration) -> Option<i64> {
        self.entries.get(agent_id).filter(|c| c.at.elapsed() < ttl).map(|c| c.value)
    }

    fn insert(&mut self, agent_id: &str, value: i64, ttl: Duration) {
        if !self.entries.contains_key(agent_id) {
            if self.entries.len() >= self.max_entries {
                self.evict_one(ttl);
            }
            self.order.push_back(agent_id.to_string());
        }
        self.entries.insert(agent_id.to_string(), CachedValue { value, at: Instant::now() });
    }

    fn evict_one(&mut self, ttl: Duration) {
        if let Some(stale_key) = self.entries.iter().find(|(_, c)| c.at.elapsed() >= ttl).map(|(k, _)| k.clone()) {
            self.entries.remove(&stale_key);
            self.order.retain(|k| k != &stale_key);
            return;
        }
        if let Some(oldest) = self.order.pop_front() {
            self.entries.remove(&oldest);
        }
    }

    fn invalidate_all(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Per-stream monotonic watermark oracle with bounded freshness cache.
pub struct ClockWatermarks {
    store: Store,
    ttl: Duration,
    shared: Mutex<SharedCache>,
    per_agent: Mutex<AgentMessageCache>,
}

impl ClockWatermarks {
    /// Builds a new oracle over `store`, caching shared watermarks for
    /// `ttl` (default `75ms`) and bounding the per-agent message
    /// cache at `agent_cache_max` entries (default `5000`).
    pub fn new(store: Store, ttl: Duration, agent_cache_max: usize) -> ClockWatermarks {
        ClockWatermarks {
            store,
            ttl,
            shared: Mutex::new(SharedCache::empty()),
            per_agent: Mutex::new(AgentMessageCache::new(agent_cache_max)),
        }
    }

    /// Resolves the full four-part cursor for `agent_id`, honoring
    /// `fallback` overrides and the freshness cache for anything not
    /// overridden.
    pub async fn cursor_for(&self, agent_id: &str, fallback: WatermarkFallback) -> HubResult<Cursor> {
        let messages = self.messages_watermark(agent_id).await?;
        let tasks = match fallback.tasks {
            Some(v) => v,
            None => self.shared_watermark(Stream::Tasks).await?,
        };
        let context = match fallback.context {
            Some(v) => v,
            None => self.shared_watermark(Stream::Context).await?,
        };
        let activity = match fallback.activity {
            Some(v) => v,
            None => self.shared_watermark(Stream::Activity).await?,
        };
        Ok(Cursor { messages, tasks, context, activity })
    }

    /// Resolves just the value for one `stream`, for callers that only
    /// watch a subset (`wait_for_updates` with a restricted `streams` set).
    pub async fn value_for(&self, stream: Stream, agent_id: &str) -> HubResult<i64> {
        match stream {
            Stream::Messages => self.messages_watermark(agent_id).await,
            other => self.shared_watermark(other).await,
        }
    }

    async fn messages_watermark(&self, agent_id: &str) -> HubResult<i64> {
        if let Some(v) = self.per_agent.lock().unwrap().get_fresh(agent_id, self.ttl) {
            return Ok(v);
        }
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT max(created_at) FROM messages WHERE to_agent = ? OR to_agent IS NULL")
                .bind(agent_id)
                .fetch_optional(self.store.pool())
                .await?;
        let value = millis_of(row.and_then(|r| r.0))?;
        self.per_agent.lock().unwrap().insert(agent_id, value, self.ttl);
        Ok(value)
    }

    async fn shared_watermark(&self, stream: Stream) -> HubResult<i64> {
        {
            let guard = self.shared.lock().unwrap();
            let cached = match stream {
                Stream::Tasks => &guard.tasks,
                Stream::Context => &guard.context,
                Stream::Activity => &guard.activity,
                Stream::Messages => unreachable!("messages is per-agent, not shared"),
            };
            if let Some(c) = cached {
                if c.at.elapsed() < self.ttl {
                    return Ok(c.value);
                }
            }
        }
        let sql = match stream {
            Stream::Tasks => "SELECT max(updated_at) FROM tasks",
            Stream::Context => "SELECT max(updated_at) FROM context",
            Stream::Activity => "SELECT max(created_at) FROM activity_log",
            Stream::Messages => unreachable!("messages is per-agent, not shared"),
        };
        let row: Option<(Option<String>,)> = sqlx::query_as(sql).fetch_optional(self.store.pool()).await?;
        let value = millis_of(row.and_then(|r| r.0))?;
        let mut guard = self.shared.lock().unwrap();
        let slot = match stream {
            Stream::Tasks => &mut guard.tasks,
            Stream::Context => &mut guard.context,
            Stream::Activity => &mut guard.activity,
            Stream::Messages => unreachable!("messages is per-agent, not shared"),
        };
        *slot = Some(CachedValue { value, at: Instant::now() });
        Ok(value)
    }

    /// Forces the next read of `stream` to hit the store rather than the
    /// cache, regardless of remaining TTL. Call this immediately after any
    /// commit that advances that stream.
    pub fn invalidate(&self, stream: Stream) {
        match stream {
            Stream::Messages => self.per_agent.lock().unwrap().invalidate_all(),
            Stream::Tasks => self.shared.lock().unwrap().tasks = None,
            Stream::Context => self.shared.lock().unwrap().context = None,
            Stream::Activity => self.shared.lock().unwrap().activity = None,
        }
    }
}

fn millis_of(raw: Option<String>) -> HubResult<i64> {
    match raw {
        Some(s) => Ok(parse_ts(&s)?.timestamp_millis()),
        None => Ok(0),
    }
}

/// Helper for callers that already hold a `DateTime<Utc>` and want the
/// same epoch-millis representation the cursor uses.
pub fn to_watermark_value(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_watermark_reflects_task_mutation_after_invalidate() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let wm = ClockWatermarks::new(store.clone(), Duration::from_millis(75), 5000);
        let before = wm.value_for(Stream::Tasks, "agent-1").await.unwrap();
        assert_eq!(before, 0);

        let now = hub_store::now_str();
        sqlx::query(
            "INSERT INTO tasks (title, namespace, priority, execution_mode, consistency_mode, status, creator, created_at, updated_at)
             VALUES ('t', 'default', 'medium', 'any', 'cheap', 'pending', 'tester', ?, ?)",
        )
        .bind(&now)
        .bind(&now)
        .execute(store.pool())
        .await
        .unwrap();
        wm.invalidate(Stream::Tasks);
        let after = wm.value_for(Stream::Tasks, "agent-1").await.unwrap();
        assert!(after > 0);
    }

    #[tokio::test]
    async fn messages_watermark_is_per_agent() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let wm = ClockWatermarks::new(store.clone(), Duration::from_millis(75), 5000);
        let now = hub_store::now_str();
        sqlx::query("INSERT INTO messages (from_agent, to_agent, content, metadata, created_at) VALUES ('a', 'b', 'hi', '{}', ?)")
            .bind(&now)
            .execute(store.pool())
            .await
            .unwrap();
        wm.invalidate(Stream::Messages);
        let for_b = wm.value_for(Stream::Messages, "b").await.unwrap();
        let for_c = wm.value_for(Stream::Messages, "c").await.unwrap();
        assert!(for_b > 0);
        assert_eq!(for_c, 0);
    }

    #[test]
    fn cursor_round_trip_via_advanced_over() {
        let a = Cursor { messages: 5, tasks: 1, context: 1, activity: 1 };
        let b = Cursor { messages: 6, tasks: 1, context: 1, activity: 1 };
        assert!(b.advanced_over(&a));
        assert!(!a.advanced_over(&b));
    }
}
