use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A per-agent key/value slot shared between agents via upsert.
///
/// Uniquely identified by `(agent_id, key)`; writes always replace the full
/// row rather than merging.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Context {
    /// Owning agent.
    pub agent_id: String,
    /// Key within that agent's context namespace.
    pub key: String,
    /// Stored value, length-checked against config at write time.
    pub value: String,
    /// Isolation tag; normalized to `"default"` when empty.
    pub namespace: String,
    /// Distributed-tracing trace id, if supplied.
    pub trace_id: Option<String>,
    /// Distributed-tracing span id, if supplied.
    pub span_id: Option<String>,
    /// Last write timestamp; drives delta reads.
    pub updated_at: DateTime<Utc>,
}
