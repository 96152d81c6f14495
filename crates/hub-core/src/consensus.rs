use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single agent's vote on a proposal, as consumed by the consensus
/// resolver before normalization (dedupe, clamping, dropping invalid rows).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Vote {
    /// Voting agent; must be non-empty or the vote is dropped.
    pub agent_id: String,
    /// The agent's decision.
    pub decision: VoteDecision,
    /// Confidence in `[0,1]`; clamped on input, defaulted to `0.5` if absent.
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// The decision encoded by a single vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    /// Vote in favor of the proposal.
    Accept,
    /// Vote against the proposal.
    Reject,
    /// Explicit non-participation; counted but never weighted.
    Abstain,
}

/// The resolved outcome of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusOutcome {
    /// Weighted accept votes met or exceeded weighted reject votes.
    Accept,
    /// Weighted reject votes exceeded weighted accept votes.
    Reject,
    /// Resolution deferred to an independent human or agent verifier.
    EscalateVerifier,
}

/// A persisted consensus resolution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConsensusDecision {
    /// Monotonically assigned integer id.
    pub id: i64,
    /// Caller-supplied identifier for the proposal under vote.
    pub proposal_id: String,
    /// Agent that invoked the resolver.
    pub requesting_agent: String,
    /// Resolved outcome.
    pub outcome: ConsensusOutcome,
    /// Vote counting statistics (`weighted_accept`, `weighted_reject`,
    /// `non_abstain_count`, `disagreement_ratio`, ...).
    pub stats: Value,
    /// Ordered list of escalation/decision reason tags.
    pub reasons: Value,
    /// When this decision was persisted.
    pub created_at: DateTime<Utc>,
}
