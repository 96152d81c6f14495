// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent lifecycle, runtime-profile inference, and quality counters.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use hub_core::{Agent, AgentLifecycle, AgentQuality, AgentStatus, AgentToken, RuntimeProfile, WorkspaceMode};
use hub_error::{ErrorCode, HubError, HubResult};
use hub_store::{now_str, parse_ts, Store};
use sqlx::Row;
use uuid::Uuid;

/// Fields a caller supplies to register or re-register an agent.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Stable caller-chosen id.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Free-form type tag.
    pub type_tag: String,
    /// Free-form capability description.
    pub capabilities: String,
    /// Persistent vs. ephemeral lifecycle class.
    pub lifecycle: AgentLifecycle,
}

/// Agent lifecycle registry: registration, heartbeat, runtime-profile
/// inference, and completion/rollback quality counters.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Store,
}

impl AgentRegistry {
    /// Wraps an already-open [`Store`].
    pub fn new(store: Store) -> AgentRegistry {
        AgentRegistry { store }
    }

    /// Upserts an agent. Initial `status` is always `online`. A fresh
    /// [`AgentToken`] is issued only the first time an id is seen; every
    /// subsequent re-registration of the same id reuses it.
    pub async fn register(&self, req: RegisterRequest) -> HubResult<(Agent, AgentToken)> {
        let now = now_str();
        let lifecycle = lifecycle_str(req.lifecycle);

        sqlx::query(
            "INSERT INTO agents (id, name, type_tag, capabilities, lifecycle, workspace_mode, status, last_seen)
             VALUES (?, ?, ?, ?, ?, 'unknown', 'online', ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               type_tag = excluded.type_tag,
               capabilities = excluded.capabilities,
               lifecycle = excluded.lifecycle,
               status = 'online',
               last_seen = excluded.last_seen",
        )
        .bind(&req.id)
        .bind(&req.name)
        .bind(&req.type_tag)
        .bind(&req.capabilities)
        .bind(lifecycle)
        .bind(&now)
        .execute(self.store.pool())
        .await?;

        sqlx::query("INSERT OR IGNORE INTO agent_quality (agent_id, completed_count, rollback_count) VALUES (?, 0, 0)")
            .bind(&req.id)
            .execute(self.store.pool())
            .await?;

        let existing_token: Option<(String, String)> =
            sqlx::query_as("SELECT token, issued_at FROM agent_tokens WHERE agent_id = ?")
                .bind(&req.id)
                .fetch_optional(self.store.pool())
                .await?;
        let token = match existing_token {
            Some((token, issued_at)) => AgentToken {
                agent_id: req.id.clone(),
                token: Uuid::parse_str(&token)
                    .map_err(|e| HubError::new(ErrorCode::Internal, "stored token is not a valid UUID").with_source(e))?,
                issued_at: parse_ts(&issued_at)?,
            },
            None => {
                let token = Uuid::new_v4();
                sqlx::query("INSERT INTO agent_tokens (agent_id, token, issued_at) VALUES (?, ?, ?)")
                    .bind(&req.id)
                    .bind(token.to_string())
                    .bind(&now)
                    .execute(self.store.pool())
                    .await?;
                AgentToken { agent_id: req.id.clone(), token, issued_at: parse_ts(&now)? }
            }
        };

        let agent = self.get(&req.id).await?.ok_or_else(|| {
            HubError::new(ErrorCode::Internal, "agent vanished immediately after upsert")
        })?;
        Ok((agent, token))
    }

    /// Marks `agent_id` online and bumps `last_seen` to now.
    pub async fn heartbeat(&self, agent_id: &str) -> HubResult<Agent> {
        let now = now_str();
        let result = sqlx::query("UPDATE agents SET status = 'online', last_seen = ? WHERE id = ?")
            .bind(&now)
            .bind(agent_id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(HubError::new(ErrorCode::AgentNotFound, format!("no agent with id {agent_id}")));
        }
        self.get(agent_id).await?.ok_or_else(|| HubError::new(ErrorCode::AgentNotFound, agent_id.to_string()))
    }

    /// Normalizes and persists a self-reported [`RuntimeProfile`], and
    /// re-derives `workspace_mode` from it:
    ///
    /// - `has_git` ⇒ [`WorkspaceMode::Repo`]
    /// - `empty_dir` ⇒ [`WorkspaceMode::Isolated`]
    /// - `file_count == 0 && !has_git` ⇒ [`WorkspaceMode::Isolated`]
    /// - otherwise ⇒ [`WorkspaceMode::Unknown`]
    pub async fn update_runtime_profile(&self, agent_id: &str, profile: RuntimeProfile) -> HubResult<Agent> {
        let mode = infer_workspace_mode(&profile);
        let profile_json = serde_json::to_string(&profile)
            .map_err(|e| HubError::new(ErrorCode::SerializationError, "runtime profile serialization failed").with_source(e))?;

        let result = sqlx::query("UPDATE agents SET runtime_profile = ?, workspace_mode = ?, last_seen = ? WHERE id = ?")
            .bind(&profile_json)
            .bind(mode_str(mode))
            .bind(now_str())
            .bind(agent_id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(HubError::new(ErrorCode::AgentNotFound, format!("no agent with id {agent_id}")));
        }
        self.get(agent_id).await?.ok_or_else(|| HubError::new(ErrorCode::AgentNotFound, agent_id.to_string()))
    }

    /// Atomically increments `completed_count`.
    pub async fn record_completion(&self, agent_id: &str) -> HubResult<()> {
        self.bump_quality(agent_id, "completed_count").await
    }

    /// Atomically increments `rollback_count`.
    pub async fn record_rollback(&self, agent_id: &str) -> HubResult<()> {
        self.bump_quality(agent_id, "rollback_count").await
    }

    async fn bump_quality(&self, agent_id: &str, column: &'static str) -> HubResult<()> {
        debug_assert!(column == "completed_count" || column == "rollback_count");
        let (init_completed, init_rollback) = if column == "completed_count" { (1, 0) } else { (0, 1) };
        let sql = format!(
            "INSERT INTO agent_quality (agent_id, completed_count, rollback_count) VALUES (?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET {column} = {column} + 1"
        );
        sqlx::query(&sql).bind(agent_id).bind(init_completed).bind(init_rollback).execute(self.store.pool()).await?;
        Ok(())
    }

    /// Fetches a single agent by id.
    pub async fn get(&self, agent_id: &str) -> HubResult<Option<Agent>> {
        let row = sqlx::query(
            "SELECT a.id, a.name, a.type_tag, a.capabilities, a.lifecycle, a.workspace_mode,
                    a.runtime_profile, a.status, a.last_seen,
                    coalesce(q.completed_count, 0) as completed_count,
                    coalesce(q.rollback_count, 0) as rollback_count
             FROM agents a LEFT JOIN agent_quality q ON q.agent_id = a.id
             WHERE a.id = ?",
        )
        .bind(agent_id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(row_to_agent).transpose()
    }

    /// Lists agents, most recently seen first, optionally filtered by
    /// lifecycle and/or status.
    pub async fn list(&self, lifecycle: Option<AgentLifecycle>, status: Option<AgentStatus>, limit: i64, offset: i64) -> HubResult<Vec<Agent>> {
        let mut sql = String::from(
            "SELECT a.id, a.name, a.type_tag, a.capabilities, a.lifecycle, a.workspace_mode,
                    a.runtime_profile, a.status, a.last_seen,
                    coalesce(q.completed_count, 0) as completed_count,
                    coalesce(q.rollback_count, 0) as rollback_count
             FROM agents a LEFT JOIN agent_quality q ON q.agent_id = a.id WHERE 1=1",
        );
        if lifecycle.is_some() {
            sql.push_str(" AND a.lifecycle = ?");
        }
        if status.is_some() {
            sql.push_str(" AND a.status = ?");
        }
        sql.push_str(" ORDER BY a.last_seen DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(l) = lifecycle {
            query = query.bind(lifecycle_str(l));
        }
        if let Some(s) = status {
            query = query.bind(status_str(s));
        }
        query = query.bind(limit).bind(offset);

        let rows = query.fetch_all(self.store.pool()).await?;
        rows.into_iter().map(row_to_agent).collect()
    }

    /// Marks every agent whose `last_seen` is older than its class-specific
    /// cutoff as `offline`. Returns the ids transitioned.
    pub async fn mark_inactive(&self, persistent_cutoff: DateTime<Utc>, ephemeral_cutoff: DateTime<Utc>) -> HubResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM agents WHERE status = 'online' AND (
                (lifecycle = 'persistent' AND last_seen < ?) OR
                (lifecycle = 'ephemeral' AND last_seen < ?)
             )",
        )
        .bind(persistent_cutoff.to_rfc3339())
        .bind(ephemeral_cutoff.to_rfc3339())
        .fetch_all(self.store.pool())
        .await?;
        let ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        if !ids.is_empty() {
            sqlx::query(
                "UPDATE agents SET status = 'offline' WHERE status = 'online' AND (
                    (lifecycle = 'persistent' AND last_seen < ?) OR
                    (lifecycle = 'ephemeral' AND last_seen < ?)
                 )",
            )
            .bind(persistent_cutoff.to_rfc3339())
            .bind(ephemeral_cutoff.to_rfc3339())
            .execute(self.store.pool())
            .await?;
        }
        Ok(ids)
    }

    /// Deletes agents offline past their class-specific TTL, cascading to
    /// their token row. Returns the deleted ids; callers are responsible
    /// for reverting any tasks still assigned to them first.
    pub async fn delete_stale_offline(&self, persistent_ttl_cutoff: DateTime<Utc>, ephemeral_ttl_cutoff: DateTime<Utc>) -> HubResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM agents WHERE status = 'offline' AND (
                (lifecycle = 'persistent' AND last_seen < ?) OR
                (lifecycle = 'ephemeral' AND last_seen < ?)
             )",
        )
        .bind(persistent_ttl_cutoff.to_rfc3339())
        .bind(ephemeral_ttl_cutoff.to_rfc3339())
        .fetch_all(self.store.pool())
        .await?;
        let ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        for id in &ids {
            sqlx::query("DELETE FROM agents WHERE id = ?").bind(id).execute(self.store.pool()).await?;
        }
        Ok(ids)
    }
}

fn infer_workspace_mode(profile: &RuntimeProfile) -> WorkspaceMode {
    if profile.has_git {
        WorkspaceMode::Repo
    } else if profile.empty_dir {
        WorkspaceMode::Isolated
    } else if profile.file_count == 0 {
        WorkspaceMode::Isolated
    } else {
        WorkspaceMode::Unknown
    }
}

fn lifecycle_str(l: AgentLifecycle) -> &'static str {
    match l {
        AgentLifecycle::Persistent => "persistent",
        AgentLifecycle::Ephemeral => "ephemeral",
    }
}

fn parse_lifecycle(raw: &str) -> HubResult<AgentLifecycle> {
    match raw {
        "persistent" => Ok(AgentLifecycle::Persistent),
        "ephemeral" => Ok(AgentLifecycle::Ephemeral),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown lifecycle column value {other}"))),
    }
}

fn status_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Online => "online",
        AgentStatus::Offline => "offline",
    }
}

fn parse_status(raw: &str) -> HubResult<AgentStatus> {
    match raw {
        "online" => Ok(AgentStatus::Online),
        "offline" => Ok(AgentStatus::Offline),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown status column value {other}"))),
    }
}

fn mode_str(m: WorkspaceMode) -> &'static str {
    match m {
        WorkspaceMode::Repo => "repo",
        WorkspaceMode::Isolated => "isolated",
        WorkspaceMode::Unknown => "unknown",
    }
}

fn parse_mode(raw: &str) -> HubResult<WorkspaceMode> {
    match raw {
        "repo" => Ok(WorkspaceMode::Repo),
        "isolated" => Ok(WorkspaceMode::Isolated),
        "unknown" => Ok(WorkspaceMode::Unknown),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown workspace_mode column value {other}"))),
    }
}

fn row_to_agent(row: sqlx::sqlite::SqliteRow) -> HubResult<Agent> {
    let runtime_profile: Option<String> = row.get("runtime_profile");
    let runtime_profile = runtime_profile
        .map(|raw| serde_json::from_str::<RuntimeProfile>(&raw))
        .transpose()
        .map_err(|e| HubError::new(ErrorCode::SerializationError, "stored runtime profile is corrupt").with_source(e))?;

    Ok(Agent {
        id: row.get("id"),
        name: row.get("name"),
        type_tag: row.get("type_tag"),
        capabilities: row.get("capabilities"),
        lifecycle: parse_lifecycle(&row.get::<String, _>("lifecycle"))?,
        workspace_mode: parse_mode(&row.get::<String, _>("workspace_mode"))?,
        runtime_profile,
        status: parse_status(&row.get::<String, _>("status"))?,
        last_seen: parse_ts(&row.get::<String, _>("last_seen"))?,
        quality: AgentQuality {
            completed_count: row.get::<i64, _>("completed_count") as u64,
            rollback_count: row.get::<i64, _>("rollback_count") as u64,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_request(id: &str) -> RegisterRequest {
        RegisterRequest {
            id: id.to_string(),
            name: "Worker".to_string(),
            type_tag: "claude-sdk".to_string(),
            capabilities: "rust,python".to_string(),
            lifecycle: AgentLifecycle::Persistent,
        }
    }

    #[tokio::test]
    async fn register_issues_token_once_and_reuses_on_reregister() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store);
        let (agent1, token1) = registry.register(sample_request("w1")).await.unwrap();
        assert_eq!(agent1.status, AgentStatus::Online);
        let (_agent2, token2) = registry.register(sample_request("w1")).await.unwrap();
        assert_eq!(token1.token, token2.token);
    }

    #[tokio::test]
    async fn update_runtime_profile_infers_repo_mode() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store);
        registry.register(sample_request("w1")).await.unwrap();
        let profile = RuntimeProfile {
            cwd: "/work".into(),
            has_git: true,
            file_count: 12,
            empty_dir: false,
            source: "sidecar".into(),
            detected_at: Utc::now(),
        };
        let agent = registry.update_runtime_profile("w1", profile).await.unwrap();
        assert_eq!(agent.workspace_mode, WorkspaceMode::Repo);
    }

    #[tokio::test]
    async fn update_runtime_profile_infers_isolated_from_empty_dir() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store);
        registry.register(sample_request("w1")).await.unwrap();
        let profile = RuntimeProfile {
            cwd: "/tmp/x".into(),
            has_git: false,
            file_count: 0,
            empty_dir: true,
            source: "sidecar".into(),
            detected_at: Utc::now(),
        };
        let agent = registry.update_runtime_profile("w1", profile).await.unwrap();
        assert_eq!(agent.workspace_mode, WorkspaceMode::Isolated);
    }

    #[tokio::test]
    async fn update_runtime_profile_unknown_agent_fails() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store);
        let profile = RuntimeProfile {
            cwd: "/".into(),
            has_git: false,
            file_count: 3,
            empty_dir: false,
            source: "x".into(),
            detected_at: Utc::now(),
        };
        let err = registry.update_runtime_profile("ghost", profile).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AgentNotFound);
    }

    #[tokio::test]
    async fn quality_counters_increment_independently() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store);
        registry.register(sample_request("w1")).await.unwrap();
        registry.record_completion("w1").await.unwrap();
        registry.record_completion("w1").await.unwrap();
        registry.record_rollback("w1").await.unwrap();
        let agent = registry.get("w1").await.unwrap().unwrap();
        assert_eq!(agent.quality.completed_count, 2);
        assert_eq!(agent.quality.rollback_count, 1);
    }

    #[tokio::test]
    async fn mark_inactive_respects_lifecycle_cutoffs() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store);
        registry.register(sample_request("persistent-1")).await.unwrap();
        let now = Utc::now();
        let ids = registry.mark_inactive(now - ChronoDuration::seconds(1), now + ChronoDuration::hours(1)).await.unwrap();
        assert!(ids.is_empty(), "agent just registered should not be stale yet");
    }
}
