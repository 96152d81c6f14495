// SPDX-License-Identifier: MIT OR Apache-2.0
//! hub-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Stable domain types shared by every coordination-hub crate: agents, tasks,
//! claims, messages, contexts, blob references, consensus decisions, artifact
//! records, and the cursor grammar used to page through all of them.
//!
//! If you only take one dependency from this workspace, take this one.

/// Agent registration and heartbeat types.
pub mod agent;
/// Content-addressed blob references and the lossless envelope format.
pub mod blobref;
/// Opaque pagination cursors used by every list/poll operation.
pub mod cursor;
/// Context document types shared between agents.
pub mod context;
/// Confidence-weighted consensus decisions.
pub mod consensus;
/// Inter-agent message envelope.
pub mod message;
/// Tasks, claims, dependencies, evidence, and status history.
pub mod task;
/// Artifact records, shares, and download tickets.
pub mod artifact;
/// SLO alert types surfaced by maintenance sweeps.
pub mod slo;

/// Current wire-contract version embedded in schema documents.
///
/// # Examples
///
/// ```
/// assert_eq!(hub_core::CONTRACT_VERSION, "coord-hub/v1");
/// ```
pub const CONTRACT_VERSION: &str = "coord-hub/v1";

pub use agent::{Agent, AgentLifecycle, AgentQuality, AgentStatus, AgentToken, RuntimeProfile, WorkspaceMode};
pub use artifact::{ArtifactRecord, ArtifactShare, ArtifactTicket, TaskArtifact, TicketKind};
pub use blobref::{
    Blob, BlobRef, LosslessEnvelope, BLOB_REF_KIND, BLOB_REF_VERSION, LOSSLESS_ENVELOPE_ALG,
    LOSSLESS_ENVELOPE_VERSION,
};
pub use consensus::{ConsensusDecision, ConsensusOutcome, Vote, VoteDecision};
pub use context::Context;
pub use cursor::{Cursor, MessageCursor, TaskCursor};
pub use message::{Message, MessageRead};
pub use slo::{SloAlert, SloSeverity};
pub use task::{
    Claim, ConsistencyMode, ExecutionMode, Task, TaskDependency, TaskEvidence, TaskPriority,
    TaskStatus, TaskStatusHistory,
};
