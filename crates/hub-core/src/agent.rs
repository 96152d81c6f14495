use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle class of a registered agent.
///
/// Ephemeral agents are garbage-collected on a much shorter idle timeout than
/// persistent ones (see the maintenance sweep in `hub-maintenance`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    /// Long-lived agent; survives across restarts of the caller.
    Persistent,
    /// Short-lived worker; reaped aggressively once idle.
    Ephemeral,
}

/// Online/offline status tracked by heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Last heartbeat is within the inactivity cutoff for this lifecycle class.
    Online,
    /// Last heartbeat is stale; claims may be reaped.
    Offline,
}

/// Capability class inferred from an agent's reported runtime profile.
///
/// Drives execution-mode matching in the claim engine: an agent whose
/// workspace mode is `Repo` may claim tasks requiring `any` or `repo`; an
/// `Isolated` agent may claim `any` or `isolated`; `Unknown` may claim only
/// `any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceMode {
    /// Has a git working tree the agent can operate on directly.
    Repo,
    /// Sandboxed or empty working directory, no shared repo state.
    Isolated,
    /// Mode could not be inferred from the reported profile.
    Unknown,
}

/// Self-reported runtime profile used to infer `WorkspaceMode`.
///
/// Inference rules (`update_runtime_profile`):
/// - `has_git` ⇒ `Repo`
/// - `empty_dir` ⇒ `Isolated`
/// - `file_count == 0 && !has_git` ⇒ `Isolated`
/// - otherwise ⇒ `Unknown`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeProfile {
    /// Working directory the agent reported at registration/update time.
    pub cwd: String,
    /// Whether a `.git` directory is present under `cwd`.
    pub has_git: bool,
    /// Number of entries found directly under `cwd`.
    pub file_count: u64,
    /// Whether `cwd` is empty.
    pub empty_dir: bool,
    /// Free-form origin tag supplied by the caller (e.g. `"sidecar"`).
    pub source: String,
    /// When this profile was recorded.
    pub detected_at: DateTime<Utc>,
}

/// Running counters used to weight an agent's consensus votes and to compute
/// the done-gate reliability penalty.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
pub struct AgentQuality {
    /// Number of tasks this agent has successfully completed via the done-gate.
    pub completed_count: u64,
    /// Number of completions later rolled back.
    pub rollback_count: u64,
}

impl AgentQuality {
    /// Rollback rate as a fraction of completed work, `0.0` for a fresh agent.
    pub fn rollback_rate(&self) -> f64 {
        if self.completed_count == 0 {
            0.0
        } else {
            self.rollback_count as f64 / self.completed_count as f64
        }
    }
}

/// A registered participant in the coordination hub.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Agent {
    /// Caller-chosen stable identifier, unique across the hub.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Free-form type tag (e.g. `"claude-sdk"`, `"codex"`).
    pub type_tag: String,
    /// Free-form capability description supplied at registration.
    pub capabilities: String,
    /// Persistent vs. ephemeral lifecycle class.
    pub lifecycle: AgentLifecycle,
    /// Inferred workspace mode, updated by `update_runtime_profile`.
    pub workspace_mode: WorkspaceMode,
    /// Most recently reported runtime profile, if any.
    pub runtime_profile: Option<RuntimeProfile>,
    /// Current online/offline status.
    pub status: AgentStatus,
    /// Last heartbeat or registration timestamp.
    pub last_seen: DateTime<Utc>,
    /// Quality counters used for reliability weighting.
    pub quality: AgentQuality,
}

/// Opaque bearer token bound to exactly one agent.
///
/// Issued on first registration and reused on every subsequent
/// re-registration of the same agent id.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentToken {
    /// The agent this token authenticates.
    pub agent_id: String,
    /// Opaque token value.
    pub token: Uuid,
    /// When the token was first issued.
    pub issued_at: DateTime<Utc>,
}
