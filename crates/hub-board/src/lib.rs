// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task CRUD, dependency graph, status history, and archival.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use hub_core::{ConsistencyMode, ExecutionMode, Task, TaskPriority, TaskStatus};
use hub_error::{ErrorCode, HubError, HubResult};
use hub_registry::AgentRegistry;
use hub_store::{now_str, parse_ts, Store};
use sqlx::Row;

/// Fields a caller supplies to create a task.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    /// Short human-readable title.
    pub title: String,
    /// Longer free-form description.
    pub description: Option<String>,
    /// Isolation tag; empty normalizes to `"default"`.
    pub namespace: Option<String>,
    /// Scheduling priority; defaults to `medium`.
    pub priority: Option<TaskPriority>,
    /// Capability requirement; defaults to `any`.
    pub execution_mode: Option<ExecutionMode>,
    /// Done-gate strictness; if omitted, derived from `priority`
    /// (`critical` upgrades to `strict`) unless the caller pins one.
    pub consistency_mode: Option<ConsistencyMode>,
    /// Ids of tasks that must reach `done` before this one is ready.
    /// Duplicates and self-references are filtered silently.
    pub depends_on: Vec<i64>,
    /// Agent id or system actor creating this task.
    pub creator: String,
    /// Distributed-tracing trace id.
    pub trace_id: Option<String>,
    /// Distributed-tracing span id.
    pub span_id: Option<String>,
}

/// Partial update applied by `update_task`. `None` fields are left
/// unchanged; `depends_on: Some(_)` fully replaces the dependency set.
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New description.
    pub description: Option<Option<String>>,
    /// New priority.
    pub priority: Option<TaskPriority>,
    /// New execution mode.
    pub execution_mode: Option<ExecutionMode>,
    /// New consistency mode.
    pub consistency_mode: Option<ConsistencyMode>,
    /// New status (triggers history + quality-counter side effects).
    pub status: Option<TaskStatus>,
    /// Full replacement of the dependency set.
    pub depends_on: Option<Vec<i64>>,
    /// Actor responsible for this update, used for status history.
    pub changed_by: String,
    /// Free-form origin tag for status history (e.g. `"update_task"`).
    pub source: String,
}

/// Filter predicate for [`TaskBoard::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to this status.
    pub status: Option<TaskStatus>,
    /// Restrict to tasks assigned to this agent.
    pub assigned_to: Option<String>,
    /// Restrict to this namespace.
    pub namespace: Option<String>,
    /// Restrict to this execution mode.
    pub execution_mode: Option<ExecutionMode>,
    /// Exclude tasks with any not-done dependency.
    pub ready_only: bool,
}

/// Pagination / delta-read controls for [`TaskBoard::list`].
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Plain `updated_at >` delta filter.
    pub updated_after: Option<DateTime<Utc>>,
    /// `(updated_at, id)` cursor; ascending order, stable pagination.
    pub cursor: Option<(DateTime<Utc>, i64)>,
    /// Max rows to return.
    pub limit: i64,
    /// Row offset (only meaningful without a cursor).
    pub offset: i64,
}

/// Task board: CRUD, dependency graph, status history, and archival.
#[derive(Clone)]
pub struct TaskBoard {
    store: Store,
    registry: AgentRegistry,
}

impl TaskBoard {
    /// Wraps an already-open [`Store`], using `registry` to trigger
    /// quality-counter side effects on done↔non-done transitions.
    pub fn new(store: Store, registry: AgentRegistry) -> TaskBoard {
        TaskBoard { store, registry }
    }

    /// Creates a task and its dependency edges in a single transaction.
    pub async fn create(&self, req: CreateTaskRequest) -> HubResult<Task> {
        let namespace = normalize_namespace(req.namespace.as_deref());
        let priority = req.priority.unwrap_or_default();
        let execution_mode = req.execution_mode.unwrap_or_default();
        let consistency_mode = req.consistency_mode.unwrap_or_else(|| {
            if priority == TaskPriority::Critical {
                ConsistencyMode::Strict
            } else {
                ConsistencyMode::Cheap
            }
        });

        let mut tx = self.store.begin().await?;
        let now = now_str();

        let inserted = sqlx::query(
            "INSERT INTO tasks (title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', NULL, ?, ?, ?, ?, ?)",
        )
        .bind(&req.title)
        .bind(&req.description)
        .bind(&namespace)
        .bind(priority_str(priority))
        .bind(execution_mode_str(execution_mode))
        .bind(consistency_mode_str(consistency_mode))
        .bind(&req.creator)
        .bind(&req.trace_id)
        .bind(&req.span_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let task_id = inserted.last_insert_rowid();

        let mut deps: Vec<i64> = req.depends_on.into_iter().filter(|d| *d != task_id).collect();
        deps.sort_unstable();
        deps.dedup();

        for dep in &deps {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
                .bind(dep)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(HubError::new(ErrorCode::InvalidDependency, format!("depends_on task {dep} does not exist")));
            }
            sqlx::query("INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?, ?)")
                .bind(task_id)
                .bind(dep)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("INSERT INTO task_status_history (task_id, from_status, to_status, changed_by, source, created_at) VALUES (?, 'pending', 'pending', ?, 'create_task', ?)")
            .bind(task_id)
            .bind(&req.creator)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.get(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "task vanished immediately after insert"))
    }

    /// Applies a partial update, recomputing dependency edges when
    /// `depends_on` is present and recording a status-history row plus
    /// quality-counter side effects when `status` changes.
    pub async fn update(&self, task_id: i64, patch: UpdateTaskPatch) -> HubResult<Task> {
        let mut tx = self.store.begin().await?;
        let existing = fetch_task_tx(&mut tx, task_id).await?.ok_or_else(|| {
            HubError::new(ErrorCode::TaskNotFound, format!("no task with id {task_id}"))
        })?;

        let now = now_str();
        let new_title = patch.title.unwrap_or_else(|| existing.title.clone());
        let new_description = patch.description.unwrap_or_else(|| existing.description.clone());
        let new_priority = patch.priority.unwrap_or(existing.priority);
        let new_execution_mode = patch.execution_mode.unwrap_or(existing.execution_mode);
        let new_consistency_mode = patch.consistency_mode.unwrap_or(existing.consistency_mode);
        let new_status = patch.status.unwrap_or(existing.status);

        sqlx::query(
            "UPDATE tasks SET title = ?, description = ?, priority = ?, execution_mode = ?, consistency_mode = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&new_title)
        .bind(&new_description)
        .bind(priority_str(new_priority))
        .bind(execution_mode_str(new_execution_mode))
        .bind(consistency_mode_str(new_consistency_mode))
        .bind(status_str(new_status))
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if let Some(deps) = patch.depends_on {
            sqlx::query("DELETE FROM task_dependencies WHERE task_id = ?").bind(task_id).execute(&mut *tx).await?;
            let mut deps: Vec<i64> = deps.into_iter().filter(|d| *d != task_id).collect();
            deps.sort_unstable();
            deps.dedup();
            for dep in deps {
                let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
                    .bind(dep)
                    .fetch_optional(&mut *tx)
                    .await?;
                if exists.is_none() {
                    return Err(HubError::new(ErrorCode::InvalidDependency, format!("depends_on task {dep} does not exist")));
                }
                sqlx::query("INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?, ?)")
                    .bind(task_id)
                    .bind(dep)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        if new_status != existing.status {
            sqlx::query(
                "INSERT INTO task_status_history (task_id, from_status, to_status, changed_by, source, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(task_id)
            .bind(status_str(existing.status))
            .bind(status_str(new_status))
            .bind(&patch.changed_by)
            .bind(&patch.source)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if new_status != existing.status {
            if let Some(agent) = existing.assigned_to.as_deref() {
                if new_status == TaskStatus::Done && existing.status != TaskStatus::Done {
                    self.registry.record_completion(agent).await?;
                } else if existing.status == TaskStatus::Done && new_status != TaskStatus::Done {
                    self.registry.record_rollback(agent).await?;
                }
            }
        }

        self.get(task_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "task vanished during update"))
    }

    /// Fetches a single live (non-archived) task.
    pub async fn get(&self, task_id: i64) -> HubResult<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at
             FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(row_to_task).transpose()
    }

    /// Returns `true` iff every dependency of `task_id` has status `done`.
    pub async fn is_ready(&self, task_id: i64) -> HubResult<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM task_dependencies d
             JOIN tasks t ON t.id = d.depends_on_task_id
             WHERE d.task_id = ? AND t.status != 'done'",
        )
        .bind(task_id)
        .fetch_one(self.store.pool())
        .await?;
        Ok(row.0 == 0)
    }

    /// Returns the ids of dependencies of `task_id` that are not yet done.
    pub async fn unmet_dependencies(&self, task_id: i64) -> HubResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT d.depends_on_task_id FROM task_dependencies d
             JOIN tasks t ON t.id = d.depends_on_task_id
             WHERE d.task_id = ? AND t.status != 'done'
             ORDER BY d.depends_on_task_id",
        )
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Number of not-yet-done tasks that depend on `task_id` ("unblock
    /// count"), used as the claim engine's secondary priority key.
    pub async fn unblock_count(&self, task_id: i64) -> HubResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM task_dependencies d
             JOIN tasks t ON t.id = d.task_id
             WHERE d.depends_on_task_id = ? AND t.status != 'done'",
        )
        .bind(task_id)
        .fetch_one(self.store.pool())
        .await?;
        Ok(row.0)
    }

    /// Lists tasks matching `filter`. Delta mode (`page.updated_after` or
    /// `page.cursor` set) orders ascending by `(updated_at, id)` for
    /// stable pagination; default mode orders descending by `created_at`.
    pub async fn list(&self, filter: TaskFilter, page: ListPage) -> HubResult<Vec<Task>> {
        let delta_mode = page.updated_after.is_some() || page.cursor.is_some();

        let mut sql = String::from(
            "SELECT id, title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at
             FROM tasks WHERE 1=1",
        );
        let mut binds_str: Vec<String> = Vec::new();
        let mut binds_opt_str: Vec<Option<String>> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds_str.push(status_str(status).to_string());
        }
        if let Some(ref assigned_to) = filter.assigned_to {
            sql.push_str(" AND assigned_to = ?");
            binds_str.push(assigned_to.clone());
        }
        if let Some(ref namespace) = filter.namespace {
            sql.push_str(" AND namespace = ?");
            binds_str.push(namespace.clone());
        }
        if let Some(mode) = filter.execution_mode {
            sql.push_str(" AND execution_mode = ?");
            binds_str.push(execution_mode_str(mode).to_string());
        }
        if filter.ready_only {
            sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM task_dependencies d JOIN tasks dt ON dt.id = d.depends_on_task_id WHERE d.task_id = tasks.id AND dt.status != 'done')",
            );
        }

        if let Some((ts, id)) = page.cursor {
            sql.push_str(" AND (updated_at > ? OR (updated_at = ? AND id > ?))");
            binds_opt_str.push(Some(ts.to_rfc3339()));
            binds_opt_str.push(Some(ts.to_rfc3339()));
            binds_opt_str.push(None); // placeholder, id bound separately below
        } else if let Some(after) = page.updated_after {
            sql.push_str(" AND updated_at > ?");
            binds_opt_str.push(Some(after.to_rfc3339()));
        }

        if delta_mode {
            sql.push_str(" ORDER BY updated_at ASC, id ASC");
        } else {
            sql.push_str(" ORDER BY created_at DESC, id DESC");
        }
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        for b in &binds_str {
            query = query.bind(b);
        }
        if let Some((ts, id)) = page.cursor {
            query = query.bind(ts.to_rfc3339()).bind(ts.to_rfc3339()).bind(id);
        } else if let Some(after) = page.updated_after {
            query = query.bind(after.to_rfc3339());
        }
        query = query.bind(page.limit).bind(page.offset);

        let rows = query.fetch_all(self.store.pool()).await?;
        rows.into_iter().map(row_to_task).collect()
    }

    /// Moves done tasks older than `now - ttl` with no dependents into
    /// `tasks_archive`, deleting the live row. Capped at `limit` rows.
    pub async fn archive_done(&self, now: DateTime<Utc>, ttl: chrono::Duration, limit: i64) -> HubResult<u64> {
        let cutoff = now - ttl;
        let mut tx = self.store.begin().await?;
        let candidates: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM tasks WHERE status = 'done' AND updated_at < ?
             AND NOT EXISTS (SELECT 1 FROM task_dependencies d WHERE d.depends_on_task_id = tasks.id)
             LIMIT ?",
        )
        .bind(cutoff.to_rfc3339())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let archived_at = now.to_rfc3339();
        for (id,) in &candidates {
            sqlx::query(
                "INSERT INTO tasks_archive (id, title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at, archived_at)
                 SELECT id, title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at, ?
                 FROM tasks WHERE id = ?",
            )
            .bind(&archived_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM tasks WHERE id = ?").bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(candidates.len() as u64)
    }

    /// Deletes a task, failing `TASK_CLAIMED` if an active claim exists.
    /// Archives by default unless `archive` is `false`.
    pub async fn delete(&self, task_id: i64, archive: bool, reason: &str) -> HubResult<()> {
        let mut tx = self.store.begin().await?;
        let claimed: Option<(i64,)> = sqlx::query_as("SELECT task_id FROM task_claims WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if claimed.is_some() {
            return Err(HubError::new(ErrorCode::TaskClaimed, "task has an active claim").with_context("task_id", task_id));
        }
        let existing = fetch_task_tx(&mut tx, task_id).await?.ok_or_else(|| {
            HubError::new(ErrorCode::TaskNotFound, format!("no task with id {task_id}"))
        })?;

        if archive {
            let archived_at = now_str();
            sqlx::query(
                "INSERT INTO tasks_archive (id, title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at, archived_at)
                 SELECT id, title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at, ?
                 FROM tasks WHERE id = ?",
            )
            .bind(&archived_at)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        }
        let _ = (&existing, reason);
        sqlx::query("DELETE FROM tasks WHERE id = ?").bind(task_id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn fetch_task_tx(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, task_id: i64) -> HubResult<Option<Task>> {
    let row = sqlx::query(
        "SELECT id, title, description, namespace, priority, execution_mode, consistency_mode, status, assigned_to, creator, trace_id, span_id, created_at, updated_at
         FROM tasks WHERE id = ?",
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.map(row_to_task).transpose()
}

/// Empty string normalizes to `"default"`.
pub fn normalize_namespace(raw: Option<&str>) -> String {
    match raw {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => "default".to_string(),
    }
}

fn priority_str(p: TaskPriority) -> &'static str {
    match p {
        TaskPriority::Critical => "critical",
        TaskPriority::High => "high",
        TaskPriority::Medium => "medium",
        TaskPriority::Low => "low",
    }
}

fn parse_priority(raw: &str) -> HubResult<TaskPriority> {
    match raw {
        "critical" => Ok(TaskPriority::Critical),
        "high" => Ok(TaskPriority::High),
        "medium" => Ok(TaskPriority::Medium),
        "low" => Ok(TaskPriority::Low),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown priority column value {other}"))),
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

fn consistency_mode_str(m: ConsistencyMode) -> &'static str {
    match m {
        ConsistencyMode::Cheap => "cheap",
        ConsistencyMode::Strict => "strict",
    }
}

fn parse_consistency_mode(raw: &str) -> HubResult<ConsistencyMode> {
    match raw {
        "cheap" => Ok(ConsistencyMode::Cheap),
        "strict" => Ok(ConsistencyMode::Strict),
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

#[cfg(test)]
mod tests {
    use super::*;
    use hub_registry::{AgentRegistry, RegisterRequest};
    use hub_core::AgentLifecycle;

    async fn board() -> TaskBoard {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        TaskBoard::new(store.clone(), AgentRegistry::new(store))
    }

    #[tokio::test]
    async fn create_normalizes_namespace_and_modes() {
        let board = board().await;
        let t = board
            .create(CreateTaskRequest { title: "x".into(), creator: "tester".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(t.namespace, "default");
        assert_eq!(t.execution_mode, ExecutionMode::Any);
        assert_eq!(t.consistency_mode, ConsistencyMode::Cheap);
    }

    #[tokio::test]
    async fn critical_priority_upgrades_to_strict_unless_pinned() {
        let board = board().await;
        let t = board
            .create(CreateTaskRequest {
                title: "x".into(),
                creator: "tester".into(),
                priority: Some(TaskPriority::Critical),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(t.consistency_mode, ConsistencyMode::Strict);

        let pinned = board
            .create(CreateTaskRequest {
                title: "y".into(),
                creator: "tester".into(),
                priority: Some(TaskPriority::Critical),
                consistency_mode: Some(ConsistencyMode::Cheap),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pinned.consistency_mode, ConsistencyMode::Cheap);
    }

    #[tokio::test]
    async fn create_rejects_missing_dependency() {
        let board = board().await;
        let err = board
            .create(CreateTaskRequest { title: "x".into(), creator: "tester".into(), depends_on: vec![999], ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDependency);
    }

    #[tokio::test]
    async fn readiness_reflects_dependency_status() {
        let board = board().await;
        let dep = board.create(CreateTaskRequest { title: "dep".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        let task = board
            .create(CreateTaskRequest { title: "main".into(), creator: "t".into(), depends_on: vec![dep.id], ..Default::default() })
            .await
            .unwrap();
        assert!(!board.is_ready(task.id).await.unwrap());
        board
            .update(dep.id, UpdateTaskPatch { status: Some(TaskStatus::Done), changed_by: "t".into(), source: "test".into(), ..Default::default() })
            .await
            .unwrap();
        assert!(board.is_ready(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn self_dependency_is_filtered_silently() {
        let board = board().await;
        let t = board.create(CreateTaskRequest { title: "x".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        board
            .update(t.id, UpdateTaskPatch { depends_on: Some(vec![t.id]), changed_by: "t".into(), source: "test".into(), ..Default::default() })
            .await
            .unwrap();
        assert!(board.is_ready(t.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_fails_when_claimed() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let board = TaskBoard::new(store.clone(), AgentRegistry::new(store.clone()));
        let t = board.create(CreateTaskRequest { title: "x".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        let now = now_str();
        sqlx::query("INSERT INTO task_claims (task_id, agent_id, claim_id, claimed_at, lease_expires_at, updated_at) VALUES (?, 'w1', 'c1', ?, ?, ?)")
            .bind(t.id)
            .bind(&now)
            .bind(&now)
            .bind(&now)
            .execute(store.pool())
            .await
            .unwrap();
        let err = board.delete(t.id, true, "cleanup").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskClaimed);
    }

    #[tokio::test]
    async fn archive_done_moves_rows_with_no_dependents() {
        let board = board().await;
        let t = board.create(CreateTaskRequest { title: "x".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        board
            .update(t.id, UpdateTaskPatch { status: Some(TaskStatus::Done), changed_by: "t".into(), source: "test".into(), ..Default::default() })
            .await
            .unwrap();
        let moved = board.archive_done(Utc::now() + chrono::Duration::days(8), chrono::Duration::days(7), 200).await.unwrap();
        assert_eq!(moved, 1);
        assert!(board.get(t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn done_registers_quality_completion_for_assignee() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store.clone());
        registry
            .register(RegisterRequest { id: "w1".into(), name: "W".into(), type_tag: "t".into(), capabilities: "".into(), lifecycle: AgentLifecycle::Persistent })
            .await
            .unwrap();
        let board = TaskBoard::new(store.clone(), registry.clone());
        let t = board.create(CreateTaskRequest { title: "x".into(), creator: "t".into(), ..Default::default() }).await.unwrap();
        sqlx::query("UPDATE tasks SET assigned_to = 'w1' WHERE id = ?").bind(t.id).execute(store.pool()).await.unwrap();
        board
            .update(t.id, UpdateTaskPatch { status: Some(TaskStatus::Done), changed_by: "w1".into(), source: "test".into(), ..Default::default() })
            .await
            .unwrap();
        let agent = registry.get("w1").await.unwrap().unwrap();
        assert_eq!(agent.quality.completed_count, 1);
    }
}
