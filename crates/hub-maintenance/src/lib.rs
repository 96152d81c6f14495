// SPDX-License-Identifier: MIT OR Apache-2.0
//! Periodic background maintenance sweep.
//!
//! One [`MaintenanceRunner::run_once`] call performs, in order: expired-claim
//! reclamation, offline-agent marking, ephemeral-claim reaping, stale-agent
//! deletion with manual cascade (SQLite foreign keys are declared but not
//! enforced here, so the cascade is explicit), orphan-assignment requeue,
//! TTL eviction across every time-boxed table, done-task archival, and the
//! SLO evaluator. Every step that mutates a watermark source invalidates the
//! corresponding [`hub_watermark::ClockWatermarks`] cache before returning.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hub_artifacts::ArtifactStore;
use hub_blob::BlobStore;
use hub_board::TaskBoard;
use hub_claim::ClaimEngine;
use hub_config::HubConfig;
use hub_core::{SloAlert, SloSeverity};
use hub_error::HubResult;
use hub_registry::AgentRegistry;
use hub_store::{now_str, parse_ts, Store};
use hub_watermark::{ClockWatermarks, Stream};
use sqlx::Row;

/// Counts from one completed maintenance pass, for logging and the KPI
/// snapshot.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    /// Expired task claims reverted to pending.
    pub expired_claims_cleared: u64,
    /// Agents transitioned online -> offline.
    pub agents_marked_offline: u64,
    /// Claims reaped from offline ephemeral agents.
    pub ephemeral_claims_reaped: u64,
    /// Agents deleted for being stale-offline past TTL.
    pub agents_deleted: u64,
    /// In-progress tasks requeued because their owner no longer exists or is
    /// offline-ephemeral.
    pub orphaned_tasks_requeued: u64,
    /// Idempotency key rows evicted.
    pub idempotency_keys_evicted: u64,
    /// Message rows evicted.
    pub messages_evicted: u64,
    /// Activity log rows evicted.
    pub activity_log_evicted: u64,
    /// Unreferenced protocol blob rows evicted.
    pub protocol_blobs_evicted: u64,
    /// Artifact rows evicted (TTL or default cutoff).
    pub artifacts_evicted: u64,
    /// Auth event rows evicted.
    pub auth_events_evicted: u64,
    /// Resolved SLO alert rows evicted.
    pub resolved_slo_alerts_evicted: u64,
    /// Done tasks moved to the archive table.
    pub tasks_archived: u64,
    /// SLO alerts newly raised or re-raised this pass.
    pub slo_alerts_raised: Vec<String>,
    /// SLO alerts resolved this pass.
    pub slo_alerts_resolved: Vec<String>,
}

/// Wires together every component crate the maintenance sweep touches.
pub struct MaintenanceRunner {
    store: Store,
    registry: AgentRegistry,
    board: TaskBoard,
    claims: ClaimEngine,
    blobs: BlobStore,
    artifacts: ArtifactStore,
    watermarks: ClockWatermarks,
    config: HubConfig,
}

impl MaintenanceRunner {
    /// Builds a runner over the already-constructed component instances the
    /// server wires up at boot.
    pub fn new(
        store: Store,
        registry: AgentRegistry,
        board: TaskBoard,
        claims: ClaimEngine,
        blobs: BlobStore,
        artifacts: ArtifactStore,
        watermarks: ClockWatermarks,
        config: HubConfig,
    ) -> MaintenanceRunner {
        MaintenanceRunner { store, registry, board, claims, blobs, artifacts, watermarks, config }
    }

    /// Runs one full maintenance pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> HubResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        report.expired_claims_cleared = self.claims.cleanup_expired_claims(now).await?;
        if report.expired_claims_cleared > 0 {
            self.watermarks.invalidate(Stream::Tasks);
        }

        let persistent_offline_cutoff = now - self.config.persistent_offline_after;
        let ephemeral_offline_cutoff = now - self.config.ephemeral_offline_after;
        let newly_offline = self.registry.mark_inactive(persistent_offline_cutoff, ephemeral_offline_cutoff).await?;
        report.agents_marked_offline = newly_offline.len() as u64;

        let ephemeral_reap_cutoff = now - self.config.ephemeral_claim_reap_after;
        report.ephemeral_claims_reaped = self.reap_offline_ephemeral_claims(ephemeral_reap_cutoff).await?;

        let persistent_ttl_cutoff = now - self.config.persistent_agent_ttl;
        let ephemeral_ttl_cutoff = now - self.config.ephemeral_agent_ttl;
        let deleted_agents = self.registry.delete_stale_offline(persistent_ttl_cutoff, ephemeral_ttl_cutoff).await?;
        if !deleted_agents.is_empty() {
            report.agents_deleted = deleted_agents.len() as u64;
            report.orphaned_tasks_requeued += self.cascade_delete_agents(&deleted_agents).await?;
        }

        report.orphaned_tasks_requeued += self.requeue_orphaned_assignments().await?;
        if report.agents_deleted > 0 || report.orphaned_tasks_requeued > 0 {
            self.watermarks.invalidate(Stream::Tasks);
        }

        report.idempotency_keys_evicted = self.evict_idempotency_keys(now - self.config.idempotency_ttl).await?;
        report.messages_evicted = self.evict_messages(now - self.config.message_ttl).await?;
        if report.messages_evicted > 0 {
            self.watermarks.invalidate(Stream::Messages);
        }
        report.activity_log_evicted = self.evict_activity_log(now - self.config.activity_log_ttl).await?;
        if report.activity_log_evicted > 0 {
            self.watermarks.invalidate(Stream::Activity);
        }
        report.protocol_blobs_evicted = self.blobs.gc_unreferenced(now - self.config.protocol_blob_ttl).await?;
        report.artifacts_evicted = self.evict_artifacts(now).await?;
        report.auth_events_evicted = self.evict_auth_events(now - self.config.auth_event_ttl).await?;
        report.resolved_slo_alerts_evicted = self.evict_resolved_slo_alerts(now - self.config.resolved_slo_alert_ttl).await?;

        report.tasks_archived =
            self.board.archive_done(now, ChronoDuration::from_std(self.config.archive_done_after).unwrap_or(ChronoDuration::days(7)), self.config.archive_batch_limit as i64).await?;
        if report.tasks_archived > 0 {
            self.watermarks.invalidate(Stream::Tasks);
        }

        let (raised, resolved) = self.evaluate_slo(now).await?;
        report.slo_alerts_raised = raised;
        report.slo_alerts_resolved = resolved;

        Ok(report)
    }

    async fn reap_offline_ephemeral_claims(&self, cutoff: DateTime<Utc>) -> HubResult<u64> {
        let rows = sqlx::query(
            "SELECT task_claims.task_id FROM task_claims
             JOIN agents ON agents.id = task_claims.agent_id
             WHERE agents.lifecycle = 'ephemeral' AND agents.status = 'offline' AND agents.last_seen < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(self.store.pool())
        .await?;
        let task_ids: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("task_id")).collect();
        if task_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.store.begin().await?;
        let now = now_str();
        let mut cleared = 0u64;
        for task_id in task_ids {
            let result = sqlx::query("DELETE FROM task_claims WHERE task_id = ?").bind(task_id).execute(&mut *tx).await?;
            if result.rows_affected() > 0 {
                sqlx::query("UPDATE tasks SET status = 'pending', assigned_to = NULL, updated_at = ? WHERE id = ?")
                    .bind(&now)
                    .bind(task_id)
                    .execute(&mut *tx)
                    .await?;
                cleared += 1;
            }
        }
        tx.commit().await?;
        Ok(cleared)
    }

    /// Manual FK cascade for agents the registry just deleted: their claims,
    /// in-progress task assignments, and tokens do not disappear on their
    /// own since the schema declares `ON DELETE CASCADE` but SQLite's
    /// foreign-key enforcement is left off to keep the single-writer pool
    /// simple.
    async fn cascade_delete_agents(&self, agent_ids: &[String]) -> HubResult<u64> {
        let mut requeued = 0u64;
        let now = now_str();
        for agent_id in agent_ids {
            let claimed_tasks: Vec<(i64,)> =
                sqlx::query_as("SELECT task_id FROM task_claims WHERE agent_id = ?").bind(agent_id).fetch_all(self.store.pool()).await?;
            sqlx::query("DELETE FROM task_claims WHERE agent_id = ?").bind(agent_id).execute(self.store.pool()).await?;
            for (task_id,) in claimed_tasks {
                sqlx::query("UPDATE tasks SET status = 'pending', assigned_to = NULL, updated_at = ? WHERE id = ? AND status = 'in_progress'")
                    .bind(&now)
                    .bind(task_id)
                    .execute(self.store.pool())
                    .await?;
                requeued += 1;
            }
            sqlx::query("DELETE FROM agent_tokens WHERE agent_id = ?").bind(agent_id).execute(self.store.pool()).await?;
            sqlx::query("DELETE FROM agent_quality WHERE agent_id = ?").bind(agent_id).execute(self.store.pool()).await?;
        }
        Ok(requeued)
    }

    /// Tasks whose `assigned_to` points at an agent row that no longer
    /// exists, with no covering claim left (the claim would have already
    /// been cleared by a prior step if the owner went stale through the
    /// normal path; this covers any lingering drift).
    async fn requeue_orphaned_assignments(&self) -> HubResult<u64> {
        let now = now_str();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', assigned_to = NULL, updated_at = ?
             WHERE status = 'in_progress'
               AND assigned_to IS NOT NULL
               AND assigned_to NOT IN (SELECT id FROM agents)
               AND id NOT IN (SELECT task_id FROM task_claims)",
        )
        .bind(&now)
        .execute(self.store.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn evict_idempotency_keys(&self, cutoff: DateTime<Utc>) -> HubResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < ?").bind(cutoff.to_rfc3339()).execute(self.store.pool()).await?;
        Ok(result.rows_affected())
    }

    async fn evict_messages(&self, cutoff: DateTime<Utc>) -> HubResult<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE created_at < ?").bind(cutoff.to_rfc3339()).execute(self.store.pool()).await?;
        Ok(result.rows_affected())
    }

    async fn evict_activity_log(&self, cutoff: DateTime<Utc>) -> HubResult<u64> {
        let result = sqlx::query("DELETE FROM activity_log WHERE created_at < ?").bind(cutoff.to_rfc3339()).execute(self.store.pool()).await?;
        Ok(result.rows_affected())
    }

    async fn evict_artifacts(&self, now: DateTime<Utc>) -> HubResult<u64> {
        let default_cutoff = now - self.config.artifact_ttl;
        let expired = self.artifacts.sweep_expired(now, default_cutoff).await?;
        for artifact in &expired {
            if let Some(path) = &artifact.storage_path {
                if let Err(err) = tokio::fs::remove_file(path).await {
                    tracing::warn!(artifact_id = %artifact.id, path, error = %err, "best-effort artifact file unlink failed");
                }
            }
        }
        Ok(expired.len() as u64)
    }

    async fn evict_auth_events(&self, cutoff: DateTime<Utc>) -> HubResult<u64> {
        let result = sqlx::query("DELETE FROM auth_events WHERE created_at < ?").bind(cutoff.to_rfc3339()).execute(self.store.pool()).await?;
        Ok(result.rows_affected())
    }

    async fn evict_resolved_slo_alerts(&self, cutoff: DateTime<Utc>) -> HubResult<u64> {
        let result = sqlx::query("DELETE FROM slo_alerts WHERE resolved_at IS NOT NULL AND resolved_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn evaluate_slo(&self, now: DateTime<Utc>) -> HubResult<(Vec<String>, Vec<String>)> {
        let mut raised = Vec::new();
        let mut resolved = Vec::new();

        let oldest_pending: Option<(String,)> =
            sqlx::query_as("SELECT min(created_at) FROM tasks WHERE status = 'pending'").fetch_optional(self.store.pool()).await?.flatten_opt();
        let pending_breach = match &oldest_pending {
            Some((ts,)) => now.signed_duration_since(parse_ts(ts)?) > ChronoDuration::from_std(self.config.slo_pending_age).unwrap_or_default(),
            None => false,
        };
        self.upsert_or_resolve(
            "high_pending_age",
            SloSeverity::High,
            pending_breach,
            || format!("oldest pending task has been waiting longer than {:?}", self.config.slo_pending_age),
            serde_json::json!({ "slo_pending_age_ms": self.config.slo_pending_age.as_millis() }),
            now,
            &mut raised,
            &mut resolved,
        )
        .await?;

        let stale_cutoff = now - ChronoDuration::from_std(self.config.slo_stale_in_progress).unwrap_or_default();
        let stale_in_progress: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM tasks
             WHERE status = 'in_progress' AND updated_at < ?
               AND id NOT IN (SELECT task_id FROM task_claims)",
        )
        .bind(stale_cutoff.to_rfc3339())
        .fetch_one(self.store.pool())
        .await?;
        self.upsert_or_resolve(
            "stale_in_progress",
            SloSeverity::Critical,
            stale_in_progress.0 > 0,
            || format!("{} in-progress task(s) with no covering claim have gone stale", stale_in_progress.0),
            serde_json::json!({ "count": stale_in_progress.0 }),
            now,
            &mut raised,
            &mut resolved,
        )
        .await?;

        let churn_window_start = now - ChronoDuration::from_std(self.config.slo_claim_churn_window).unwrap_or_default();
        let churn: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM activity_log
             WHERE kind IN ('claim_task', 'renew_task_claim', 'release_task_claim', 'poll_and_claim') AND created_at >= ?",
        )
        .bind(churn_window_start.to_rfc3339())
        .fetch_one(self.store.pool())
        .await?;
        self.upsert_or_resolve(
            "claim_churn",
            SloSeverity::Medium,
            churn.0 as u64 >= self.config.slo_claim_churn_threshold,
            || format!("{} claim-lifecycle events in the last {:?}", churn.0, self.config.slo_claim_churn_window),
            serde_json::json!({ "count": churn.0, "threshold": self.config.slo_claim_churn_threshold }),
            now,
            &mut raised,
            &mut resolved,
        )
        .await?;

        Ok((raised, resolved))
    }

    async fn upsert_or_resolve(
        &self,
        code: &str,
        severity: SloSeverity,
        condition: bool,
        message: impl FnOnce() -> String,
        details: serde_json::Value,
        now: DateTime<Utc>,
        raised: &mut Vec<String>,
        resolved: &mut Vec<String>,
    ) -> HubResult<()> {
        let open: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM slo_alerts WHERE code = ? AND resolved_at IS NULL").bind(code).fetch_optional(self.store.pool()).await?;
        match (condition, open) {
            (true, Some(_)) => {}
            (true, None) => {
                sqlx::query(
                    "INSERT INTO slo_alerts (code, severity, message, details, created_at, resolved_at) VALUES (?, ?, ?, ?, ?, NULL)",
                )
                .bind(code)
                .bind(severity_str(severity))
                .bind(message())
                .bind(details.to_string())
                .bind(now.to_rfc3339())
                .execute(self.store.pool())
                .await?;
                raised.push(code.to_string());
            }
            (false, Some((id,))) => {
                sqlx::query("UPDATE slo_alerts SET resolved_at = ? WHERE id = ?").bind(now.to_rfc3339()).bind(id).execute(self.store.pool()).await?;
                resolved.push(code.to_string());
            }
            (false, None) => {}
        }
        Ok(())
    }

    /// Lists every currently-open (and, with `include_resolved`, recently
    /// resolved) SLO alert for `list_slo_alerts`.
    pub async fn list_alerts(&self, include_resolved: bool, limit: i64) -> HubResult<Vec<SloAlert>> {
        let sql = if include_resolved {
            "SELECT id, code, severity, message, details, created_at, resolved_at FROM slo_alerts ORDER BY created_at DESC LIMIT ?"
        } else {
            "SELECT id, code, severity, message, details, created_at, resolved_at FROM slo_alerts WHERE resolved_at IS NULL ORDER BY created_at DESC LIMIT ?"
        };
        let rows = sqlx::query(sql).bind(limit).fetch_all(self.store.pool()).await?;
        rows.into_iter().map(row_to_alert).collect()
    }
}

trait FlattenOptTuple {
    fn flatten_opt(self) -> Option<(String,)>;
}

impl FlattenOptTuple for Option<(Option<String>,)> {
    fn flatten_opt(self) -> Option<(String,)> {
        self.and_then(|(v,)| v).map(|v| (v,))
    }
}

fn severity_str(s: SloSeverity) -> &'static str {
    match s {
        SloSeverity::Medium => "medium",
        SloSeverity::High => "high",
        SloSeverity::Critical => "critical",
    }
}

fn parse_severity(raw: &str) -> hub_error::HubResult<SloSeverity> {
    match raw {
        "medium" => Ok(SloSeverity::Medium),
        "high" => Ok(SloSeverity::High),
        "critical" => Ok(SloSeverity::Critical),
        other => Err(hub_error::HubError::new(hub_error::ErrorCode::Internal, format!("unknown slo severity column value {other}"))),
    }
}

fn row_to_alert(row: sqlx::sqlite::SqliteRow) -> HubResult<SloAlert> {
    let details: String = row.get("details");
    let resolved_at: Option<String> = row.get("resolved_at");
    Ok(SloAlert {
        id: row.get("id"),
        code: row.get("code"),
        severity: parse_severity(&row.get::<String, _>("severity"))?,
        message: row.get("message"),
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        resolved_at: resolved_at.map(|s| parse_ts(&s)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_gate::DoneGate;
    use hub_registry::RegisterRequest;
    use std::time::Duration as StdDuration;

    async fn runner() -> MaintenanceRunner {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store.clone());
        let board = TaskBoard::new(store.clone(), registry.clone());
        let gate = DoneGate::new(store.clone(), registry.clone(), HubConfig::default());
        let claims = ClaimEngine::new(store.clone(), registry.clone(), gate);
        let blobs = BlobStore::new(store.clone());
        let artifacts = ArtifactStore::new(store.clone());
        let watermarks = ClockWatermarks::new(store.clone(), StdDuration::from_millis(75), 5000);
        MaintenanceRunner::new(store, registry, board, claims, blobs, artifacts, watermarks, HubConfig::default())
    }

    #[tokio::test]
    async fn run_once_is_a_no_op_on_an_empty_store() {
        let runner = runner().await;
        let report = runner.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.expired_claims_cleared, 0);
        assert_eq!(report.agents_deleted, 0);
        assert_eq!(report.tasks_archived, 0);
    }

    #[tokio::test]
    async fn stale_offline_agent_is_deleted_and_its_claim_requeued() {
        let runner = runner().await;
        runner
            .registry
            .register(RegisterRequest { id: "w1".into(), name: "w1".into(), type_tag: "worker".into(), capabilities: String::new(), lifecycle: hub_core::AgentLifecycle::Ephemeral })
            .await
            .unwrap();
        let task = runner
            .board
            .create(hub_board::CreateTaskRequest { title: "t".into(), creator: "w1".into(), ..Default::default() })
            .await
            .unwrap();
        runner.claims.claim_task(task.id, "w1", None, None).await.unwrap();

        let far_future = Utc::now() + ChronoDuration::days(400);
        let report = runner.run_once(far_future).await.unwrap();
        assert_eq!(report.agents_deleted, 1);
        assert_eq!(report.orphaned_tasks_requeued, 1);

        let refetched = runner.board.get(task.id).await.unwrap().unwrap();
        assert_eq!(refetched.status, hub_core::TaskStatus::Pending);
        assert!(refetched.assigned_to.is_none());
    }

    #[tokio::test]
    async fn slo_alert_raises_then_resolves() {
        let mut config = HubConfig::default();
        config.slo_pending_age = StdDuration::from_millis(1);
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store.clone());
        let board = TaskBoard::new(store.clone(), registry.clone());
        let gate = DoneGate::new(store.clone(), registry.clone(), config.clone());
        let claims = ClaimEngine::new(store.clone(), registry.clone(), gate);
        let blobs = BlobStore::new(store.clone());
        let artifacts = ArtifactStore::new(store.clone());
        let watermarks = ClockWatermarks::new(store.clone(), StdDuration::from_millis(75), 5000);
        let runner = MaintenanceRunner::new(store, registry, board, claims, blobs, artifacts, watermarks, config);

        runner.board.create(hub_board::CreateTaskRequest { title: "t".into(), creator: "w1".into(), ..Default::default() }).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        let report = runner.run_once(Utc::now()).await.unwrap();
        assert!(report.slo_alerts_raised.contains(&"high_pending_age".to_string()));

        let open = runner.list_alerts(false, 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].code, "high_pending_age");

        sqlx::query("UPDATE tasks SET status = 'done'").execute(runner.store.pool()).await.unwrap();
        let report2 = runner.run_once(Utc::now()).await.unwrap();
        assert!(report2.slo_alerts_resolved.contains(&"high_pending_age".to_string()));
    }
}
