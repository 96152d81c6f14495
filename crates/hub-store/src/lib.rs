// SPDX-License-Identifier: MIT OR Apache-2.0
//! Embedded relational persistence for the coordination hub.
//!
//! [`Store`] owns the single [`sqlx::SqlitePool`] shared by every other
//! component crate. All writers go through the pool's own serialization
//! (SQLite's single-writer discipline); there is no additional
//! application-level locking layered on top. Conflicting concurrent writers
//! are expected to observe "rows changed = 0" on a conditional `UPDATE` and
//! treat that as the race signal — see the claim engine for the canonical
//! example.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use hub_error::{ErrorCode, HubError, HubResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Converts a store-layer failure into the hub's unified error taxonomy.
///
/// `sqlx::Error::RowNotFound` is deliberately *not* mapped here to a single
/// generic code: callers know which entity they were looking for and
/// should raise the specific `*_NOT_FOUND` code themselves. Every other
/// variant is treated as an unexpected system fault.
impl From<sqlx::Error> for HubError {
    fn from(err: sqlx::Error) -> Self {
        HubError::new(ErrorCode::Internal, format!("store error: {err}")).with_source(err)
    }
}

/// The embedded relational store: connection pool plus one-time schema
/// migration.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the SQLite database at `path` and runs the
    /// idempotent schema migration. `:memory:` is accepted for tests.
    pub async fn connect(path: &str) -> HubResult<Store> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| HubError::new(ErrorCode::IoError, format!("invalid store path {path}")).with_source(e))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Borrows the underlying pool for component crates that issue their
    /// own queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Starts a new transaction. Every multi-statement operation in the hub
    /// (claim, renew, release, consensus resolution, maintenance sweeps)
    /// runs inside one of these rather than as loose autocommit statements.
    pub async fn begin(&self) -> HubResult<sqlx::Transaction<'_, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Creates every table and index in the schema if it does not already
    /// exist. Safe to call on every boot; column additions for future
    /// versions should be appended here as `ALTER TABLE ... ADD COLUMN`
    /// guarded by a `PRAGMA table_info` check, failing `SCHEMA_MISMATCH`
    /// only if the existing shape cannot be reconciled.
    async fn migrate(&self) -> HubResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await.map_err(|e| {
            HubError::new(ErrorCode::SchemaMismatch, "failed to apply schema migration").with_source(e)
        })?;
        Ok(())
    }
}

/// Current wall-clock time as an RFC3339 string, the canonical timestamp
/// representation used across every table.
pub fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parses a stored RFC3339 timestamp column back into a `DateTime<Utc>`.
pub fn parse_ts(raw: &str) -> HubResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HubError::new(ErrorCode::Internal, "stored timestamp is not valid RFC3339").with_source(e))
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    type_tag        TEXT NOT NULL,
    capabilities    TEXT NOT NULL DEFAULT '',
    lifecycle       TEXT NOT NULL,
    workspace_mode  TEXT NOT NULL DEFAULT 'unknown',
    runtime_profile TEXT,
    status          TEXT NOT NULL DEFAULT 'online',
    last_seen       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_tokens (
    agent_id  TEXT PRIMARY KEY REFERENCES agents(id) ON DELETE CASCADE,
    token     TEXT NOT NULL UNIQUE,
    issued_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_quality (
    agent_id        TEXT PRIMARY KEY REFERENCES agents(id) ON DELETE CASCADE,
    completed_count INTEGER NOT NULL DEFAULT 0,
    rollback_count  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    from_agent TEXT NOT NULL,
    to_agent   TEXT,
    content    TEXT NOT NULL,
    metadata   TEXT NOT NULL DEFAULT '{}',
    trace_id   TEXT,
    span_id    TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_to_created ON messages(to_agent, created_at, id);

CREATE TABLE IF NOT EXISTS message_reads (
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    agent_id   TEXT NOT NULL,
    read_at    TEXT NOT NULL,
    PRIMARY KEY (message_id, agent_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    title            TEXT NOT NULL,
    description      TEXT,
    namespace        TEXT NOT NULL DEFAULT 'default',
    priority         TEXT NOT NULL DEFAULT 'medium',
    execution_mode   TEXT NOT NULL DEFAULT 'any',
    consistency_mode TEXT NOT NULL DEFAULT 'cheap',
    status           TEXT NOT NULL DEFAULT 'pending',
    assigned_to      TEXT,
    creator          TEXT NOT NULL,
    trace_id         TEXT,
    span_id          TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_ns ON tasks(status, namespace);
CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated_at, id);

CREATE TABLE IF NOT EXISTS tasks_archive (
    id               INTEGER PRIMARY KEY,
    title            TEXT NOT NULL,
    description      TEXT,
    namespace        TEXT NOT NULL,
    priority         TEXT NOT NULL,
    execution_mode   TEXT NOT NULL,
    consistency_mode TEXT NOT NULL,
    status           TEXT NOT NULL,
    assigned_to      TEXT,
    creator          TEXT NOT NULL,
    trace_id         TEXT,
    span_id          TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    archived_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id            INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    depends_on_task_id INTEGER NOT NULL,
    PRIMARY KEY (task_id, depends_on_task_id)
);

CREATE TABLE IF NOT EXISTS task_evidence (
    task_id      INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    evidence_ref TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (task_id, evidence_ref)
);

CREATE TABLE IF NOT EXISTS task_status_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    changed_by  TEXT NOT NULL,
    source      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_claims (
    task_id          INTEGER PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
    agent_id         TEXT NOT NULL,
    claim_id         TEXT NOT NULL UNIQUE,
    claimed_at       TEXT NOT NULL,
    lease_expires_at TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS context (
    agent_id   TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    namespace  TEXT NOT NULL DEFAULT 'default',
    trace_id   TEXT,
    span_id    TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, key)
);
CREATE INDEX IF NOT EXISTS idx_context_updated ON context(updated_at, agent_id, key);

CREATE TABLE IF NOT EXISTS activity_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    kind       TEXT NOT NULL,
    agent_id   TEXT,
    detail     TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_kind_created ON activity_log(kind, created_at);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    agent_id   TEXT NOT NULL,
    tool       TEXT NOT NULL,
    key        TEXT NOT NULL,
    response   TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, tool, key)
);

CREATE TABLE IF NOT EXISTS protocol_blobs (
    hash         TEXT PRIMARY KEY,
    value        TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS consensus_decisions (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    proposal_id       TEXT NOT NULL,
    requesting_agent  TEXT NOT NULL,
    outcome           TEXT NOT NULL,
    stats             TEXT NOT NULL,
    reasons           TEXT NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS slo_alerts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    code        TEXT NOT NULL,
    severity    TEXT NOT NULL,
    message     TEXT NOT NULL,
    details     TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL,
    resolved_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_slo_alerts_open_code
    ON slo_alerts(code) WHERE resolved_at IS NULL;

CREATE TABLE IF NOT EXISTS auth_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id   TEXT,
    kind       TEXT NOT NULL,
    detail     TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
    id             TEXT PRIMARY KEY,
    created_by     TEXT NOT NULL,
    name           TEXT NOT NULL,
    mime_type      TEXT,
    size_bytes     INTEGER,
    sha256         TEXT,
    storage_path   TEXT,
    namespace      TEXT NOT NULL DEFAULT 'default',
    summary        TEXT,
    access_count   INTEGER NOT NULL DEFAULT 0,
    ttl_expires_at TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifact_shares (
    artifact_id TEXT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
    agent_id    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (artifact_id, agent_id)
);

CREATE TABLE IF NOT EXISTS task_artifacts (
    task_id     INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    artifact_id TEXT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (task_id, artifact_id)
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM tasks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn slo_alerts_enforce_one_open_row_per_code() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let ts = now_str();
        sqlx::query("INSERT INTO slo_alerts (code, severity, message, created_at) VALUES (?, 'high', 'x', ?)")
            .bind("high_pending_age")
            .bind(&ts)
            .execute(store.pool())
            .await
            .unwrap();
        let second = sqlx::query("INSERT INTO slo_alerts (code, severity, message, created_at) VALUES (?, 'high', 'y', ?)")
            .bind("high_pending_age")
            .bind(&ts)
            .execute(store.pool())
            .await;
        assert!(second.is_err());
    }
}
