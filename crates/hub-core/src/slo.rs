use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of an SLO condition raised by the maintenance evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SloSeverity {
    /// Informational; worth surfacing but not urgent.
    Medium,
    /// Degraded service; should be investigated soon.
    High,
    /// Actively blocking throughput.
    Critical,
}

/// A named operational condition, open or resolved.
///
/// Unique on `(code, resolved_at IS NULL)` — at most one open alert exists
/// per code at a time; a fresh evaluation that no longer sees the condition
/// stamps `resolved_at` rather than deleting the row.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SloAlert {
    /// Monotonically assigned integer id.
    pub id: i64,
    /// Stable condition code (`high_pending_age`, `stale_in_progress`,
    /// `claim_churn`).
    pub code: String,
    /// Severity at the time this alert was raised.
    pub severity: SloSeverity,
    /// Human-readable summary.
    pub message: String,
    /// Structured evaluator context (thresholds, observed values, ...).
    pub details: Value,
    /// When the alert was raised.
    pub created_at: DateTime<Utc>,
    /// When the condition cleared, if it has.
    pub resolved_at: Option<DateTime<Utc>>,
}
