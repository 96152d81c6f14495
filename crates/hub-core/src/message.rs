use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A routed or broadcast message between agents.
///
/// `to_agent == None` marks a broadcast, visible to every agent; read marks
/// are tracked per-recipient in a separate table so a broadcast can be read
/// by many agents independently.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    /// Monotonically assigned integer id.
    pub id: i64,
    /// Sending agent.
    pub from_agent: String,
    /// Receiving agent, or `None` for a broadcast.
    pub to_agent: Option<String>,
    /// Message body, length-checked against config at send time.
    pub content: String,
    /// Caller-supplied structured metadata.
    pub metadata: Value,
    /// Distributed-tracing trace id, if supplied.
    pub trace_id: Option<String>,
    /// Distributed-tracing span id, if supplied.
    pub span_id: Option<String>,
    /// Insertion timestamp; primary ordering key for reads.
    pub created_at: DateTime<Utc>,
}

/// Per-`(message, agent)` read acknowledgement.
///
/// Inserted the first time a recipient observes a message through
/// `read_messages` or `get_for_agent`; its presence is what the `read` flag
/// on a returned message row reflects.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageRead {
    /// Message that was read.
    pub message_id: i64,
    /// Agent that read it.
    pub agent_id: String,
    /// When the read mark was recorded.
    pub read_at: DateTime<Utc>,
}
