// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lease-based task-claim scheduler.
//!
//! Leases are caller-supplied seconds clamped to `[30, 86400]`, defaulting
//! to `300`. `poll_and_claim` picks the single best-ranked pending task
//! (execution-mode compatible, dependency-ready, ordered by priority then
//! unblock count then age) and claims it with a conditional `UPDATE`; a
//! zero-rows-affected result means another agent won the race and the
//! caller gets "no task" rather than an error. `claim_task`, `renew`, and
//! `release` use the same conditional-`UPDATE`-as-race-signal pattern to
//! report `CLAIM_STOLEN` instead of silently overwriting another agent's
//! claim.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hub_core::{Claim, ExecutionMode, Task, TaskStatus, WorkspaceMode};
use hub_error::{ErrorCode, HubError, HubResult};
use hub_gate::{DoneGate, DoneGateInput};
use hub_registry::AgentRegistry;
use hub_store::{now_str, parse_ts, Store};
use sqlx::Row;
use uuid::Uuid;

const MIN_LEASE_SECS: u64 = 30;
const MAX_LEASE_SECS: u64 = 86_400;
const DEFAULT_LEASE_SECS: u64 = 300;

/// Clamps a caller-supplied lease duration to `[30s, 86400s]`, substituting
/// the `300s` default when the caller supplies none.
pub fn normalize_lease_secs(requested: Option<u64>) -> u64 {
    requested.unwrap_or(DEFAULT_LEASE_SECS).clamp(MIN_LEASE_SECS, MAX_LEASE_SECS)
}

/// A claimed task and the lease that was just issued or refreshed on it.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    /// The task, already updated to `in_progress` / `assigned_to`.
    pub task: Task,
    /// The claim row backing the lease.
    pub claim: Claim,
}

/// Advisory backoff hint returned on an empty poll, from the adaptive
/// polling table keyed by 5-minute active-agent count.
#[derive(Debug, Clone, Copy)]
pub struct PollBackoff {
    /// Suggested delay before the next poll, in milliseconds.
    pub retry_after_ms: u64,
}

fn backoff_tier(active_agents_5m: i64) -> (u64, f64, u64, f64) {
    if active_agents_5m <= 5 {
        (800, 1.30, 3_000, 0.30)
    } else if active_agents_5m <= 10 {
        (1_200, 1.45, 5_000, 0.40)
    } else if active_agents_5m <= 20 {
        (2_000, 1.60, 8_000, 0.55)
    } else {
        (2_600, 1.70, 12_000, 0.60)
    }
}

/// Computes the advisory `retry_after_ms` for an agent's `miss_streak`-th
/// consecutive empty poll, given how many agents have been active in the
/// last 5 minutes. `rng` supplies the jitter draw in `[-1, 1]`.
pub fn compute_poll_backoff(active_agents_5m: i64, miss_streak: u32, other_claims_active: bool, rng: impl FnOnce() -> f64) -> PollBackoff {
    let (base, factor, cap, jitter) = backoff_tier(active_agents_5m);
    let exponent = (miss_streak.saturating_sub(1)).min(6);
    let raw = base as f64 * factor.powi(exponent as i32);
    let capped = raw.min(cap as f64);
    let capped = if other_claims_active { capped.min(5_000.0) } else { capped };
    let jitter_draw = rng().clamp(-1.0, 1.0) * jitter;
    let with_jitter = (capped * (1.0 + jitter_draw)).max(0.0);
    PollBackoff { retry_after_ms: with_jitter.round() as u64 }
}

/// Lease-based task-claim scheduler.
#[derive(Clone)]
pub struct ClaimEngine {
    store: Store,
    registry: AgentRegistry,
    gate: DoneGate,
}

impl ClaimEngine {
    /// Wraps an already-open [`Store`], [`AgentRegistry`], and [`DoneGate`].
    pub fn new(store: Store, registry: AgentRegistry, gate: DoneGate) -> ClaimEngine {
        ClaimEngine { store, registry, gate }
    }

    /// Expires every claim whose lease has passed, reverting the backing
    /// task to `pending` and clearing `assigned_to`. Returns the number of
    /// claims expired. Shared with the maintenance loop; `poll_and_claim`
    /// calls this unconditionally under a "≥5s throttled unless
    /// forced" rule, which the caller (the server layer) is responsible
    /// for rate-limiting.
    pub async fn cleanup_expired_claims(&self, now: DateTime<Utc>) -> HubResult<u64> {
        let mut tx = self.store.begin().await?;
        let expired: Vec<(i64, String)> = sqlx::query_as(
            "SELECT task_id, agent_id FROM task_claims WHERE lease_expires_at < ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&mut *tx)
        .await?;

        for (task_id, agent_id) in &expired {
            sqlx::query(
                "UPDATE tasks SET status = 'pending', assigned_to = NULL, updated_at = ? WHERE id = ? AND assigned_to = ?",
            )
            .bind(now_str())
            .bind(task_id)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM task_claims WHERE task_id = ?").bind(task_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(expired.len() as u64)
    }

    /// Selects and claims the single best-ranked ready task for `agent_id`.
    /// Returns `Ok(None)` when nothing is ready or the race was lost to
    /// another caller — both are "no task", not an error.
    pub async fn poll_and_claim(&self, agent_id: &str, lease_secs: Option<u64>, namespace: Option<&str>) -> HubResult<Option<ClaimedTask>> {
        let lease_secs = normalize_lease_secs(lease_secs);
        let agent = self.registry.get(agent_id).await?.ok_or_else(|| HubError::new(ErrorCode::AgentNotFound, agent_id.to_string()))?;

        let mut tx = self.store.begin().await?;

        let modes = compatible_execution_modes(agent.workspace_mode);
        let placeholders = modes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT t.id FROM tasks t WHERE t.status = 'pending' AND t.assigned_to IS NULL
               AND t.execution_mode IN ({placeholders})
               AND (? IS NULL OR t.namespace = ?)
               AND NOT EXISTS (
                 SELECT 1 FROM task_dependencies d JOIN tasks dt ON dt.id = d.depends_on_task_id
                 WHERE d.task_id = t.id AND dt.status != 'done'
               )
             ORDER BY
               CASE t.priority WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3 END ASC,
               (SELECT count(*) FROM task_dependencies d2 JOIN tasks dt2 ON dt2.id = d2.task_id
                  WHERE d2.depends_on_task_id = t.id AND dt2.status != 'done') DESC,
               t.created_at ASC
             LIMIT 1"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for m in &modes {
            query = query.bind(*m);
        }
        query = query.bind(namespace).bind(namespace);
        let candidate: Option<i64> = query.fetch_optional(&mut *tx).await?;

        let Some(task_id) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        let now = now_str();
        let updated = sqlx::query(
            "UPDATE tasks SET assigned_to = ?, status = 'in_progress', updated_at = ? WHERE id = ? AND status = 'pending' AND assigned_to IS NULL",
        )
        .bind(agent_id)
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let claim_id = Uuid::new_v4();
        let lease_expires_at = (Utc::now() + ChronoDuration::seconds(lease_secs as i64)).to_rfc3339();
        let insert_result = sqlx::query(
            "INSERT INTO task_claims (task_id, agent_id, claim_id, claimed_at, lease_expires_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(agent_id)
        .bind(claim_id.to_string())
        .bind(&now)
        .bind(&lease_expires_at)
        .bind(&now)
        .execute(&mut *tx)
        .await;

        if insert_result.is_err() {
            tx.rollback().await?;
            return Ok(None);
        }

        log_activity(&mut tx, "poll_and_claim", Some(agent_id), &now).await?;

        tx.commit().await?;

        let task = self.fetch_task(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "claimed task vanished"))?;
        let claim = self.fetch_claim(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "claim row vanished"))?;
        Ok(Some(ClaimedTask { task, claim }))
    }

    /// Claims a specific task by id. Re-claiming a task the caller already
    /// owns refreshes the lease and issues a fresh `claim_id`
    /// (re-claim idempotency); if that refresh loses a race to another
    /// claimant, reports `CLAIM_STOLEN`.
    pub async fn claim_task(&self, task_id: i64, agent_id: &str, lease_secs: Option<u64>, namespace: Option<&str>) -> HubResult<ClaimedTask> {
        let lease_secs = normalize_lease_secs(lease_secs);
        let agent = self.registry.get(agent_id).await?.ok_or_else(|| HubError::new(ErrorCode::AgentNotFound, agent_id.to_string()))?;

        let task = self.fetch_task(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::TaskNotFound, format!("no task with id {task_id}")))?;
        if task.status == TaskStatus::Done {
            return Err(HubError::new(ErrorCode::TaskAlreadyDone, format!("task {task_id} is already done")));
        }
        if let Some(ns) = namespace {
            if task.namespace != ns {
                return Err(HubError::new(ErrorCode::NamespaceMismatch, format!("task namespace {} != requested {ns}", task.namespace)));
            }
        }
        if !compatible_execution_modes(agent.workspace_mode).contains(&execution_mode_str(task.execution_mode)) {
            return Err(HubError::new(ErrorCode::ProfileMismatch, format!("agent workspace_mode {:?} incompatible with task execution_mode {:?}", agent.workspace_mode, task.execution_mode)));
        }

        let unmet = self.unmet_dependencies(task_id).await?;
        if !unmet.is_empty() {
            return Err(HubError::new(ErrorCode::DependenciesNotMet, "task has unmet dependencies").with_context("unmet_dependencies", &unmet));
        }

        let existing_claim = self.fetch_claim(task_id).await?;
        if let Some(claim) = existing_claim {
            if claim.agent_id == agent_id {
                let now = now_str();
                let new_claim_id = Uuid::new_v4();
                let lease_expires_at = (Utc::now() + ChronoDuration::seconds(lease_secs as i64)).to_rfc3339();
                let updated = sqlx::query(
                    "UPDATE task_claims SET claim_id = ?, lease_expires_at = ?, updated_at = ? WHERE task_id = ? AND claim_id = ?",
                )
                .bind(new_claim_id.to_string())
                .bind(&lease_expires_at)
                .bind(&now)
                .bind(task_id)
                .bind(claim.claim_id.to_string())
                .execute(self.store.pool())
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(HubError::new(ErrorCode::ClaimStolen, "claim was stolen during re-claim"));
                }
                let task = self.fetch_task(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "task vanished"))?;
                let claim = self.fetch_claim(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "claim vanished"))?;
                return Ok(ClaimedTask { task, claim });
            }
            return Err(HubError::new(ErrorCode::AlreadyClaimed, format!("task {task_id} already claimed")).with_context("current_claim", ClaimDto::from(&claim)));
        }

        let mut tx = self.store.begin().await?;
        let now = now_str();
        let updated = sqlx::query(
            "UPDATE tasks SET assigned_to = ?, status = 'in_progress', updated_at = ? WHERE id = ? AND status = 'pending' AND assigned_to IS NULL",
        )
        .bind(agent_id)
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            if let Some(claim) = self.fetch_claim(task_id).await? {
                return Err(HubError::new(ErrorCode::AlreadyClaimed, format!("task {task_id} already claimed")).with_context("current_claim", ClaimDto::from(&claim)));
            }
            return Err(HubError::new(ErrorCode::TaskNotFound, format!("task {task_id} is no longer claimable")));
        }
        let claim_id = Uuid::new_v4();
        let lease_expires_at = (Utc::now() + ChronoDuration::seconds(lease_secs as i64)).to_rfc3339();
        sqlx::query(
            "INSERT INTO task_claims (task_id, agent_id, claim_id, claimed_at, lease_expires_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(agent_id)
        .bind(claim_id.to_string())
        .bind(&now)
        .bind(&lease_expires_at)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        log_activity(&mut tx, "claim_task", Some(agent_id), &now).await?;
        tx.commit().await?;

        let task = self.fetch_task(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "task vanished"))?;
        let claim = self.fetch_claim(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "claim vanished"))?;
        Ok(ClaimedTask { task, claim })
    }

    /// Renews the lease on a claim the caller owns, failing `CLAIM_EXPIRED`
    /// if no claim row exists, `NOT_CLAIM_OWNER` if another agent holds
    /// it, `CLAIM_ID_MISMATCH` if `expected_claim_id` is given and
    /// differs, or `CLAIM_STOLEN` if the update races and loses.
    pub async fn renew_task_claim(&self, task_id: i64, agent_id: &str, lease_secs: Option<u64>, expected_claim_id: Option<Uuid>) -> HubResult<Claim> {
        let lease_secs = normalize_lease_secs(lease_secs);
        let claim = self.fetch_claim(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::ClaimExpired, format!("no active claim on task {task_id}")))?;
        if claim.agent_id != agent_id {
            return Err(HubError::new(ErrorCode::NotClaimOwner, format!("task {task_id} is claimed by a different agent")));
        }
        if let Some(expected) = expected_claim_id {
            if expected != claim.claim_id {
                return Err(HubError::new(ErrorCode::ClaimIdMismatch, "expected_claim_id does not match current claim"));
            }
        }

        let now = now_str();
        let lease_expires_at = (Utc::now() + ChronoDuration::seconds(lease_secs as i64)).to_rfc3339();
        let updated = sqlx::query(
            "UPDATE task_claims SET lease_expires_at = ?, updated_at = ? WHERE task_id = ? AND claim_id = ?",
        )
        .bind(&lease_expires_at)
        .bind(&now)
        .bind(task_id)
        .bind(claim.claim_id.to_string())
        .execute(self.store.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(HubError::new(ErrorCode::ClaimStolen, "claim was stolen during renewal"));
        }
        log_activity_pool(&self.store, "renew_task_claim", Some(agent_id), &now).await?;

        self.fetch_claim(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "claim vanished after renewal"))
    }

    /// Releases a claim the caller owns. `next_status` defaults to
    /// `pending`; `done` routes through the done-gate and sets
    /// `assigned_to = agent_id` on success, other terminal statuses clear
    /// the assignment. Same ownership checks as [`Self::renew_task_claim`].
    pub async fn release_task_claim(
        &self,
        task_id: i64,
        agent_id: &str,
        next_status: Option<TaskStatus>,
        expected_claim_id: Option<Uuid>,
        done_gate_input: Option<DoneGateInput>,
    ) -> HubResult<Task> {
        let claim = self.fetch_claim(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::ClaimExpired, format!("no active claim on task {task_id}")))?;
        if claim.agent_id != agent_id {
            return Err(HubError::new(ErrorCode::NotClaimOwner, format!("task {task_id} is claimed by a different agent")));
        }
        if let Some(expected) = expected_claim_id {
            if expected != claim.claim_id {
                return Err(HubError::new(ErrorCode::ClaimIdMismatch, "expected_claim_id does not match current claim"));
            }
        }

        let next_status = next_status.unwrap_or(TaskStatus::Pending);
        if next_status == TaskStatus::Done {
            let input = done_gate_input.ok_or_else(|| HubError::new(ErrorCode::DoneGateFailed, "done-gate input required when next_status=done"))?;
            self.gate.evaluate(input).await?;
        }

        let now = now_str();
        let deleted = sqlx::query("DELETE FROM task_claims WHERE task_id = ? AND claim_id = ?")
            .bind(task_id)
            .bind(claim.claim_id.to_string())
            .execute(self.store.pool())
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(HubError::new(ErrorCode::ClaimStolen, "claim was stolen during release"));
        }

        let assigned_to: Option<&str> = if next_status == TaskStatus::Done { Some(agent_id) } else { None };
        sqlx::query("UPDATE tasks SET status = ?, assigned_to = ?, updated_at = ? WHERE id = ?")
            .bind(status_str(next_status))
            .bind(assigned_to)
            .bind(&now)
            .bind(task_id)
            .execute(self.store.pool())
            .await?;
        sqlx::query(
            "INSERT INTO task_status_history (task_id, from_status, to_status, changed_by, source, created_at) VALUES (?, 'in_progress', ?, ?, 'release_task_claim', ?)",
        )
        .bind(task_id)
        .bind(status_str(next_status))
        .bind(agent_id)
        .bind(&now)
        .execute(self.store.pool())
        .await?;

        if next_status == TaskStatus::Done {
            self.registry.record_completion(agent_id).await?;
        }
        log_activity_pool(&self.store, "release_task_claim", Some(agent_id), &now).await?;

        self.fetch_task(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "task vanished after release"))
    }

    /// Lists active claims, optionally filtered to one agent.
    pub async fn list_claims(&self, agent_id: Option<&str>, limit: i64, offset: i64) -> HubResult<Vec<Claim>> {
        let sql = if agent_id.is_some() {
            "SELECT task_id, agent_id, claim_id, claimed_at, lease_expires_at, updated_at FROM task_claims WHERE agent_id = ? ORDER BY claimed_at DESC LIMIT ? OFFSET ?"
        } else {
            "SELECT task_id, agent_id, claim_id, claimed_at, lease_expires_at, updated_at FROM task_claims ORDER BY claimed_at DESC LIMIT ? OFFSET ?"
        };
        let mut query = sqlx::query(sql);
        if let Some(a) = agent_id {
            query = query.bind(a);
        }
        query = query.bind(limit).bind(offset);
        let rows = query.fetch_all(self.store.pool()).await?;
        rows.into_iter().map(row_to_claim).collect()
    }

    async fn unmet_dependencies(&self, task_id: i64) -> HubResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT d.depends_on_task_id FROM task_dependencies d JOIN tasks t ON t.id = d.depends_on_task_id
             WHERE d.task_id = ? AND t.status != 'done' ORDER BY d.depends_on_task_id",
        )
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn fetch_task(&self, task_id: i64) -> HubResult<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at
             FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(row_to_task).transpose()
    }

    async fn fetch_claim(&self, task_id: i64) -> HubResult<Option<Claim>> {
        let row = sqlx::query("SELECT task_id, agent_id, claim_id, claimed_at, lease_expires_at, updated_at FROM task_claims WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.map(row_to_claim).transpose()
    }
}

struct ClaimDto {
    claim_id: String,
    agent_id: String,
}
impl From<&Claim> for ClaimDto {
    fn from(c: &Claim) -> Self {
        ClaimDto { claim_id: c.claim_id.to_string(), agent_id: c.agent_id.clone() }
    }
}
impl serde::Serialize for ClaimDto {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("ClaimDto", 2)?;
        st.serialize_field("claim_id", &self.claim_id)?;
        st.serialize_field("agent_id", &self.agent_id)?;
        st.end()
    }
}

async fn log_activity(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, kind: &str, agent_id: Option<&str>, now: &str) -> HubResult<()> {
    sqlx::query("INSERT INTO activity_log (kind, agent_id, detail, created_at) VALUES (?, ?, '{}', ?)")
        .bind(kind)
        .bind(agent_id)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn log_activity_pool(store: &Store, kind: &str, agent_id: Option<&str>, now: &str) -> HubResult<()> {
    sqlx::query("INSERT INTO activity_log (kind, agent_id, detail, created_at) VALUES (?, ?, '{}', ?)")
        .bind(kind)
        .bind(agent_id)
        .bind(now)
        .execute(store.pool())
        .await?;
    Ok(())
}

fn compatible_execution_modes(mode: WorkspaceMode) -> Vec<&'static str> {
    match mode {
        WorkspaceMode::Repo => vec!["any", "repo"],
        WorkspaceMode::Isolated => vec!["any", "isolated"],
        WorkspaceMode::Unknown => vec!["any"],
    }
}

fn execution_mode_str(m: ExecutionMode) -> &'static str {
    match m {
        ExecutionMode::Any => "any",
        ExecutionMode::Repo => "repo",
        ExecutionMode::Isolated => "isolated",
    }
}

fn parse_execution_mode(raw: &str) -> HubResult<ExecutionMode> {
    match raw {
        "any" => Ok(ExecutionMode::Any),
        "repo" => Ok(ExecutionMode::Repo),
        "isolated" => Ok(ExecutionMode::Isolated),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown execution_mode column value {other}"))),
    }
}

fn parse_priority(raw: &str) -> HubResult<hub_core::TaskPriority> {
    use hub_core::TaskPriority::*;
    match raw {
        "critical" => Ok(Critical),
        "high" => Ok(High),
        "medium" => Ok(Medium),
        "low" => Ok(Low),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown priority column value {other}"))),
    }
}

fn parse_consistency_mode(raw: &str) -> HubResult<hub_core::ConsistencyMode> {
    use hub_core::ConsistencyMode::*;
    match raw {
        "cheap" => Ok(Cheap),
        "strict" => Ok(Strict),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown consistency_mode column value {other}"))),
    }
}

fn status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Done => "done",
        TaskStatus::Blocked => "blocked",
    }
}

fn parse_task_status(raw: &str) -> HubResult<TaskStatus> {
    match raw {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" => Ok(TaskStatus::InProgress),
        "done" => Ok(TaskStatus::Done),
        "blocked" => Ok(TaskStatus::Blocked),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown status column value {other}"))),
    }
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> HubResult<Task> {
    Ok(Task {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        namespace: row.get("namespace"),
        priority: parse_priority(&row.get::<String, _>("priority"))?,
        execution_mode: parse_execution_mode(&row.get::<String, _>("execution_mode"))?,
        consistency_mode: parse_consistency_mode(&row.get::<String, _>("consistency_mode"))?,
        status: parse_task_status(&row.get::<String, _>("status"))?,
        assigned_to: row.get("assigned_to"),
        creator: row.get("creator"),
        trace_id: row.get("trace_id"),
        span_id: row.get("span_id"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_claim(row: sqlx::sqlite::SqliteRow) -> HubResult<Claim> {
    Ok(Claim {
        task_id: row.get("task_id"),
        agent_id: row.get("agent_id"),
        claim_id: Uuid::parse_str(&row.get::<String, _>("claim_id"))
            .map_err(|e| HubError::new(ErrorCode::Internal, "stored claim_id is not a valid UUID").with_source(e))?,
        claimed_at: parse_ts(&row.get::<String, _>("claimed_at"))?,
        lease_expires_at: parse_ts(&row.get::<String, _>("lease_expires_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_board::{CreateTaskRequest, TaskBoard};
    use hub_config::HubConfig;
    use hub_core::{AgentLifecycle, ExecutionMode, RuntimeProfile, TaskPriority};
    use hub_registry::RegisterRequest;

    async fn engine() -> (ClaimEngine, TaskBoard, AgentRegistry, Store) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store.clone());
        let board = TaskBoard::new(store.clone(), registry.clone());
        let gate = DoneGate::new(store.clone(), registry.clone(), HubConfig::default());
        let claim = ClaimEngine::new(store.clone(), registry.clone(), gate);
        (claim, board, registry, store)
    }

    async fn register_repo_agent(registry: &AgentRegistry, id: &str) {
        registry
            .register(RegisterRequest { id: id.into(), name: "W".into(), type_tag: "t".into(), capabilities: "".into(), lifecycle: AgentLifecycle::Persistent })
            .await
            .unwrap();
        registry
            .update_runtime_profile(id, RuntimeProfile { cwd: "/w".into(), has_git: true, file_count: 5, empty_dir: false, source: "sidecar".into(), detected_at: Utc::now() })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn poll_and_claim_basic() {
        let (claim, board, registry, _store) = engine().await;
        register_repo_agent(&registry, "w1").await;
        let t = board
            .create(hub_board::CreateTaskRequest { title: "x".into(), creator: "tester".into(), priority: Some(TaskPriority::High), ..Default::default() })
            .await
            .unwrap();

        let claimed = claim.poll_and_claim("w1", Some(300), None).await.unwrap().unwrap();
        assert_eq!(claimed.task.id, t.id);
        assert_eq!(claimed.task.status, TaskStatus::InProgress);
        assert_eq!(claimed.task.assigned_to.as_deref(), Some("w1"));

        register_repo_agent(&registry, "w2").await;
        let second = claim.poll_and_claim("w2", Some(300), None).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn dependency_gating_blocks_until_dependency_done() {
        let (claim, board, registry, _store) = engine().await;
        register_repo_agent(&registry, "w1").await;
        let t1 = board.create(CreateTaskRequest { title: "t1".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        let t2 = board.create(CreateTaskRequest { title: "t2".into(), creator: "t".into(), depends_on: vec![t1.id], ..Default::default() }).await.unwrap();

        // t1 gets claimed, leaving only t2 pending but not ready.
        let claimed_t1 = claim.poll_and_claim("w1", Some(300), None).await.unwrap().unwrap();
        assert_eq!(claimed_t1.task.id, t1.id);
        assert!(claim.poll_and_claim("w1", Some(300), None).await.unwrap().is_none());

        board
            .update(t1.id, hub_board::UpdateTaskPatch { status: Some(TaskStatus::Done), changed_by: "w1".into(), source: "test".into(), ..Default::default() })
            .await
            .unwrap();

        let claimed_t2 = claim.poll_and_claim("w1", Some(300), None).await.unwrap().unwrap();
        assert_eq!(claimed_t2.task.id, t2.id);
    }

    #[tokio::test]
    async fn unblock_count_breaks_ties_over_fifo() {
        let (claim, board, registry, _store) = engine().await;
        register_repo_agent(&registry, "w1").await;
        let a = board.create(CreateTaskRequest { title: "a".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        let _b = board.create(CreateTaskRequest { title: "b".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        for i in 0..3 {
            board
                .create(CreateTaskRequest { title: format!("dep{i}"), creator: "t".into(), depends_on: vec![a.id], ..Default::default() })
                .await
                .unwrap();
        }
        let claimed = claim.poll_and_claim("w1", Some(300), None).await.unwrap().unwrap();
        assert_eq!(claimed.task.id, a.id, "task with more not-yet-done dependents should be claimed first");
    }

    #[tokio::test]
    async fn isolated_agent_cannot_claim_repo_only_task() {
        let (claim, board, registry, _store) = engine().await;
        registry
            .register(RegisterRequest { id: "iso1".into(), name: "W".into(), type_tag: "t".into(), capabilities: "".into(), lifecycle: AgentLifecycle::Ephemeral })
            .await
            .unwrap();
        registry
            .update_runtime_profile("iso1", RuntimeProfile { cwd: "/tmp".into(), has_git: false, file_count: 0, empty_dir: true, source: "sidecar".into(), detected_at: Utc::now() })
            .await
            .unwrap();
        board
            .create(CreateTaskRequest { title: "repo-only".into(), creator: "t".into(), execution_mode: Some(ExecutionMode::Repo), ..Default::default() })
            .await
            .unwrap();
        assert!(claim.poll_and_claim("iso1", Some(300), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn renew_fails_for_non_owner_and_succeeds_for_owner() {
        let (claim, board, registry, _store) = engine().await;
        register_repo_agent(&registry, "w1").await;
        register_repo_agent(&registry, "w2").await;
        let t = board.create(CreateTaskRequest { title: "x".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        claim.poll_and_claim("w1", Some(300), None).await.unwrap().unwrap();

        let err = claim.renew_task_claim(t.id, "w2", Some(300), None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotClaimOwner);

        let renewed = claim.renew_task_claim(t.id, "w1", Some(600), None).await.unwrap();
        assert_eq!(renewed.agent_id, "w1");
    }

    #[tokio::test]
    async fn release_to_done_runs_done_gate_and_clears_claim() {
        let (claim, board, registry, _store) = engine().await;
        register_repo_agent(&registry, "w1").await;
        let t = board.create(CreateTaskRequest { title: "x".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        claim.poll_and_claim("w1", Some(300), None).await.unwrap().unwrap();

        let input = DoneGateInput {
            task_id: t.id,
            agent_id: "w1".into(),
            consistency_mode: hub_core::ConsistencyMode::Cheap,
            confidence: 0.96,
            verification_passed: true,
            verified_by: Some("w1".into()),
            evidence_refs: vec!["e1".into()],
        };
        let task = claim.release_task_claim(t.id, "w1", Some(TaskStatus::Done), None, Some(input)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.assigned_to.as_deref(), Some("w1"));
        assert!(claim.list_claims(Some("w1"), 10, 0).await.unwrap().is_empty());

        let agent = registry.get("w1").await.unwrap().unwrap();
        assert_eq!(agent.quality.completed_count, 1);
    }

    #[tokio::test]
    async fn release_to_pending_clears_assignment() {
        let (claim, board, registry, _store) = engine().await;
        register_repo_agent(&registry, "w1").await;
        let t = board.create(CreateTaskRequest { title: "x".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        claim.poll_and_claim("w1", Some(300), None).await.unwrap().unwrap();

        let task = claim.release_task_claim(t.id, "w1", None, None, None).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_to, None);
    }

    #[tokio::test]
    async fn stale_lease_recovered_by_cleanup() {
        let (claim, board, registry, store) = engine().await;
        register_repo_agent(&registry, "w1").await;
        let t = board.create(CreateTaskRequest { title: "x".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        claim.poll_and_claim("w1", Some(30), None).await.unwrap().unwrap();

        // Force the lease into the past directly (simulating elapsed wall-clock time).
        let past = (Utc::now() - ChronoDuration::seconds(1)).to_rfc3339();
        sqlx::query("UPDATE task_claims SET lease_expires_at = ? WHERE task_id = ?").bind(&past).bind(t.id).execute(store.pool()).await.unwrap();

        let expired = claim.cleanup_expired_claims(Utc::now()).await.unwrap();
        assert_eq!(expired, 1);
        let task = claim.fetch_task(t.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_to, None);
    }

    #[test]
    fn lease_normalization_clamps_bounds() {
        assert_eq!(normalize_lease_secs(None), 300);
        assert_eq!(normalize_lease_secs(Some(1)), 30);
        assert_eq!(normalize_lease_secs(Some(999_999)), 86_400);
        assert_eq!(normalize_lease_secs(Some(600)), 600);
    }

    #[test]
    fn poll_backoff_caps_and_resets_on_streak() {
        let low_streak = compute_poll_backoff(3, 1, false, || 0.0);
        let high_streak = compute_poll_backoff(3, 7, false, || 0.0);
        assert!(high_streak.retry_after_ms >= low_streak.retry_after_ms);
        assert!(high_streak.retry_after_ms <= 3_000);
    }
}
