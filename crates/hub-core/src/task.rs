use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority. Ordered `Critical < High < Medium < Low` when sorted
/// ascending, matching the claim engine's `ORDER BY priority ASC` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Highest scheduling priority.
    Critical,
    /// Second-highest scheduling priority.
    High,
    /// Default scheduling priority.
    Medium,
    /// Lowest scheduling priority.
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

/// Capability requirement a task imposes on the claiming agent's workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Any agent, regardless of workspace mode, may claim this task.
    Any,
    /// Only agents with `WorkspaceMode::Repo` may claim this task.
    Repo,
    /// Only agents with `WorkspaceMode::Isolated` may claim this task.
    Isolated,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Any
    }
}

/// Strictness regime applied by the done-gate when this task is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Lower confidence floor, lower evidence minimum, verifier optional
    /// below the reliability-adjusted threshold.
    Cheap,
    /// Higher confidence floor, higher evidence minimum, independent
    /// verifier always required.
    Strict,
}

impl Default for ConsistencyMode {
    fn default() -> Self {
        ConsistencyMode::Cheap
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Unclaimed, eligible for `poll_and_claim` once dependency-ready.
    Pending,
    /// Claimed by exactly one agent under an active lease.
    InProgress,
    /// Closed successfully through the done-gate.
    Done,
    /// Closed terminally without passing the done-gate.
    Blocked,
}

/// A single unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    /// Monotonically assigned integer id.
    pub id: i64,
    /// Short human-readable title.
    pub title: String,
    /// Longer free-form description.
    pub description: Option<String>,
    /// Isolation tag; normalized to `"default"` when empty.
    pub namespace: String,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Capability requirement for claiming agents.
    pub execution_mode: ExecutionMode,
    /// Done-gate strictness regime.
    pub consistency_mode: ConsistencyMode,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Agent id currently holding this task, if claimed.
    pub assigned_to: Option<String>,
    /// Agent id or system actor that created this task.
    pub creator: String,
    /// Distributed-tracing trace id, if supplied by the caller.
    pub trace_id: Option<String>,
    /// Distributed-tracing span id, if supplied by the caller.
    pub span_id: Option<String>,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp; drives delta reads and archival cutoffs.
    pub updated_at: DateTime<Utc>,
}

/// A `(task_id, depends_on_task_id)` edge in the task dependency DAG.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct TaskDependency {
    /// Dependent task.
    pub task_id: i64,
    /// Task that must reach `Done` before `task_id` is ready.
    pub depends_on_task_id: i64,
}

/// An append-only evidence reference attached to a task by the done-gate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskEvidence {
    /// Task the evidence supports.
    pub task_id: i64,
    /// Caller-supplied reference string (log line, URL, artifact id, ...).
    pub evidence_ref: String,
    /// When this evidence was recorded.
    pub created_at: DateTime<Utc>,
}

/// An append-only record of a task status transition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskStatusHistory {
    /// Task that transitioned.
    pub task_id: i64,
    /// Status before the transition.
    pub from_status: TaskStatus,
    /// Status after the transition.
    pub to_status: TaskStatus,
    /// Agent or system actor responsible for the transition.
    pub changed_by: String,
    /// Free-form origin tag (e.g. `"release_task_claim"`, `"maintenance"`).
    pub source: String,
    /// When the transition was recorded.
    pub created_at: DateTime<Utc>,
}

/// A single active lease on a claimed task.
///
/// At most one row exists per `task_id`; its presence alongside
/// `Task::status == InProgress` is the sole authority for ownership.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Claim {
    /// Claimed task, primary key of the claim table.
    pub task_id: i64,
    /// Agent holding the lease.
    pub agent_id: String,
    /// Opaque identifier for this specific lease instance.
    pub claim_id: Uuid,
    /// When the lease was first acquired.
    pub claimed_at: DateTime<Utc>,
    /// When the lease expires absent a renewal.
    pub lease_expires_at: DateTime<Utc>,
    /// Last renewal (or acquisition) timestamp.
    pub updated_at: DateTime<Utc>,
}
