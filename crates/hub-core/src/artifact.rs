use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A finalized binary artifact handed off through the ticketed side channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Agent that created the upload ticket for this artifact.
    pub created_by: String,
    /// File name as supplied by the uploader.
    pub name: String,
    /// MIME type, if known at finalization time.
    pub mime_type: Option<String>,
    /// Size in bytes, set once the upload is finalized.
    pub size_bytes: Option<u64>,
    /// SHA-256 of the finalized bytes, lowercase hex.
    pub sha256: Option<String>,
    /// Server-side storage path of the finalized bytes.
    pub storage_path: Option<String>,
    /// Isolation tag; normalized to `"default"` when empty.
    pub namespace: String,
    /// Optional free-form summary supplied by the uploader.
    pub summary: Option<String>,
    /// Number of times this artifact has been downloaded.
    pub access_count: u64,
    /// When this artifact is eligible for TTL sweep, if set.
    pub ttl_expires_at: Option<DateTime<Utc>>,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Grants an agent (or every agent, via `"*"`) access to an artifact beyond
/// its creator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactShare {
    /// Shared artifact.
    pub artifact_id: Uuid,
    /// Grantee agent id, or the literal `"*"` for every agent.
    pub agent_id: String,
    /// When the share was granted.
    pub created_at: DateTime<Utc>,
}

/// Associates an artifact with the task it was produced for, for
/// `list_task_artifacts` / `get_task_handoff`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskArtifact {
    /// Task the artifact is attached to.
    pub task_id: i64,
    /// Attached artifact.
    pub artifact_id: Uuid,
    /// When the attachment was recorded.
    pub created_at: DateTime<Utc>,
}

/// Direction of a one-shot artifact ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    /// Authorizes a single `POST /artifacts/upload/:id` call.
    Upload,
    /// Authorizes a single `GET /artifacts/download/:id` call.
    Download,
}

/// An in-memory, single-use authorization token for the artifact HTTP side
/// channel.
///
/// Tickets never touch the relational store; they live only in the issuing
/// process's memory and are swept on expiry by maintenance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactTicket {
    /// Opaque bearer token (two concatenated UUIDs).
    pub token: String,
    /// Upload or download.
    pub kind: TicketKind,
    /// Target artifact.
    pub artifact_id: Uuid,
    /// Agent the ticket was issued to.
    pub agent_id: String,
    /// Absolute expiry; the ticket is unusable (and swept) after this.
    pub expires_at: DateTime<Utc>,
    /// Maximum upload size this ticket authorizes, if it is an upload ticket.
    pub max_bytes: Option<u64>,
}
