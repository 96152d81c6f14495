// SPDX-License-Identifier: MIT OR Apache-2.0
//! Confidence-weighted, quality-adjusted consensus resolver.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use hub_blob::{lossless_decode, BlobStore};
use hub_config::HubConfig;
use hub_core::{BlobRef, ConsensusDecision, ConsensusOutcome, Vote, VoteDecision};
use hub_error::{ErrorCode, HubError, HubResult};
use hub_registry::AgentRegistry;
use hub_store::{now_str, parse_ts, Store};
use serde::Deserialize;
use serde_json::json;
use sqlx::Row;

const MAX_CONSENSUS_VOTES_HARD_CAP: usize = 1000;

/// Where the vote list for a resolution call comes from.
#[derive(Debug, Clone)]
pub enum VoteSource {
    /// Votes supplied inline in the call.
    Inline(Vec<Vote>),
    /// A 64-hex SHA-256 hash of a blob holding the votes.
    BlobHash(String),
    /// A full `BlobRef` envelope literal holding the votes.
    BlobRef(String),
}

/// When to emit a decision blob alongside the persisted decision row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitBlobRefPolicy {
    /// Never emit a decision blob.
    #[default]
    Never,
    /// Always emit one.
    Always,
    /// Only when the outcome escalates to a verifier.
    OnEscalate,
    /// Only when both accept and reject sides are non-zero.
    OnConflict,
}

/// Per-call tuning knobs, each falling back to a fixed default.
#[derive(Debug, Clone)]
pub struct ConsensusKnobs {
    /// Disagreement ratio above which the round escalates. Clamped `[0.1, 0.9]`.
    pub disagreement_threshold: f64,
    /// Minimum non-abstain votes required before scoring, else escalate.
    pub min_non_abstain_votes: usize,
    /// Estimated-token-cost cap; `None` disables the cap check.
    pub token_budget_cap: Option<u64>,
    /// Keep only the last vote per agent (order-preserving) when `true`.
    pub dedupe_by_agent: bool,
    /// Apply per-agent quality weighting when `true`.
    pub quality_weighting: bool,
    /// When to emit a decision blob.
    pub emit_blob_ref_policy: EmitBlobRefPolicy,
}

impl ConsensusKnobs {
    /// Builds knobs from `config`'s env-configured defaults plus the
    /// fixed per-call defaults for knobs `HubConfig` doesn't carry.
    pub fn from_config(config: &HubConfig) -> ConsensusKnobs {
        ConsensusKnobs {
            disagreement_threshold: config.consensus_disagreement_threshold.clamp(0.1, 0.9),
            min_non_abstain_votes: config.consensus_min_non_abstain_votes,
            token_budget_cap: None,
            dedupe_by_agent: true,
            quality_weighting: true,
            emit_blob_ref_policy: EmitBlobRefPolicy::Never,
        }
    }
}

/// A request to resolve a proposal via consensus.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// Caller-supplied identifier for the proposal under vote.
    pub proposal_id: String,
    /// Agent that invoked the resolver.
    pub requesting_agent: String,
    /// Where the votes come from.
    pub votes: VoteSource,
    /// Per-call tuning knobs.
    pub knobs: ConsensusKnobs,
}

#[derive(Deserialize)]
struct VotesWrapper {
    votes: Vec<RawVote>,
}

#[derive(Deserialize)]
struct RawVote {
    agent_id: Option<String>,
    decision: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Confidence-weighted, quality-adjusted consensus resolver.
#[derive(Clone)]
pub struct ConsensusResolver {
    store: Store,
    blobs: BlobStore,
    registry: AgentRegistry,
    max_votes: usize,
}

impl ConsensusResolver {
    /// Wraps already-open collaborators, capping total vote count at
    /// `max_votes` (default `1000`, hard-capped here regardless).
    pub fn new(store: Store, blobs: BlobStore, registry: AgentRegistry, max_votes: usize) -> ConsensusResolver {
        ConsensusResolver { store, blobs, registry, max_votes: max_votes.min(MAX_CONSENSUS_VOTES_HARD_CAP) }
    }

    /// Resolves `req` and persists the outcome.
    pub async fn resolve(&self, req: ResolveRequest) -> HubResult<ConsensusDecision> {
        let raw_votes = self.load_votes(&req.votes).await?;
        if raw_votes.len() > self.max_votes {
            return Err(HubError::new(ErrorCode::VotesTooLarge, format!("{} votes supplied, max {}", raw_votes.len(), self.max_votes)));
        }

        let mut votes = normalize_votes(raw_votes);
        if req.knobs.dedupe_by_agent {
            votes = dedupe_by_agent(votes);
        }
        if votes.is_empty() {
            return Err(HubError::new(ErrorCode::VotesEmpty, "no valid votes supplied"));
        }

        let n = votes.len();
        let estimated_token_cost = 40 + 5 * n as u64;

        let mut weighted_accept = 0.0_f64;
        let mut weighted_reject = 0.0_f64;
        let mut accept_count = 0_u64;
        let mut reject_count = 0_u64;
        let mut abstain_count = 0_u64;

        for vote in &votes {
            let confidence = vote.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
            match vote.decision {
                VoteDecision::Abstain => {
                    abstain_count += 1;
                    continue;
                }
                VoteDecision::Accept => accept_count += 1,
                VoteDecision::Reject => reject_count += 1,
            }
            let quality_weight = if req.knobs.quality_weighting {
                self.quality_weight(&vote.agent_id).await?
            } else {
                1.0
            };
            let effective = confidence * quality_weight;
            match vote.decision {
                VoteDecision::Accept => weighted_accept += effective,
                VoteDecision::Reject => weighted_reject += effective,
                VoteDecision::Abstain => unreachable!(),
            }
        }

        let non_abstain = accept_count + reject_count;
        let disagreement_ratio = if non_abstain == 0 {
            0.0
        } else {
            accept_count.min(reject_count) as f64 / non_abstain as f64
        };

        let mut reasons: Vec<&'static str> = Vec::new();
        let outcome = if req.knobs.token_budget_cap.is_some_and(|cap| estimated_token_cost > cap) {
            reasons.push("estimated_token_cost_exceeds_cap");
            ConsensusOutcome::EscalateVerifier
        } else if non_abstain < req.knobs.min_non_abstain_votes as u64 {
            reasons.push("insufficient_non_abstain_votes");
            ConsensusOutcome::EscalateVerifier
        } else if disagreement_ratio > req.knobs.disagreement_threshold {
            reasons.push("high_disagreement");
            ConsensusOutcome::EscalateVerifier
        } else if weighted_accept >= weighted_reject {
            ConsensusOutcome::Accept
        } else {
            ConsensusOutcome::Reject
        };

        let stats = json!({
            "weighted_accept": weighted_accept,
            "weighted_reject": weighted_reject,
            "accept_count": accept_count,
            "reject_count": reject_count,
            "abstain_count": abstain_count,
            "non_abstain_count": non_abstain,
            "disagreement_ratio": disagreement_ratio,
            "estimated_token_cost": estimated_token_cost,
            "vote_count": n,
        });
        let reasons_json = json!(reasons);

        let now = now_str();
        let stats_str = serde_json::to_string(&stats).map_err(|e| HubError::new(ErrorCode::SerializationError, "stats serialization failed").with_source(e))?;
        let reasons_str = serde_json::to_string(&reasons_json).map_err(|e| HubError::new(ErrorCode::SerializationError, "reasons serialization failed").with_source(e))?;
        let outcome_str = outcome_str(outcome);

        let inserted = sqlx::query(
            "INSERT INTO consensus_decisions (proposal_id, requesting_agent, outcome, stats, reasons, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&req.proposal_id)
        .bind(&req.requesting_agent)
        .bind(outcome_str)
        .bind(&stats_str)
        .bind(&reasons_str)
        .bind(&now)
        .execute(self.store.pool())
        .await?;
        let id = inserted.last_insert_rowid();

        let emit = match req.knobs.emit_blob_ref_policy {
            EmitBlobRefPolicy::Never => false,
            EmitBlobRefPolicy::Always => true,
            EmitBlobRefPolicy::OnEscalate => outcome == ConsensusOutcome::EscalateVerifier,
            EmitBlobRefPolicy::OnConflict => accept_count > 0 && reject_count > 0,
        };
        if emit {
            let decision_json = json!({
                "proposal_id": req.proposal_id,
                "outcome": outcome_str,
                "stats": stats,
                "reasons": reasons_json,
            })
            .to_string();
            let encoded = hub_blob::lossless_auto_encode(&decision_json, 256, 10.0);
            let hash = hub_blob::sha256_hex(&decision_json);
            self.blobs.put(&hash, &encoded.stored_value).await?;
        }

        Ok(ConsensusDecision {
            id,
            proposal_id: req.proposal_id,
            requesting_agent: req.requesting_agent,
            outcome,
            stats,
            reasons: reasons_json,
            created_at: parse_ts(&now)?,
        })
    }

    /// Lists persisted decisions, most recent first.
    pub async fn list_decisions(&self, limit: i64, offset: i64) -> HubResult<Vec<ConsensusDecision>> {
        let rows = sqlx::query("SELECT id, proposal_id, requesting_agent, outcome, stats, reasons, created_at FROM consensus_decisions ORDER BY id DESC LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(self.store.pool())
            .await?;
        rows.into_iter().map(row_to_decision).collect()
    }

    async fn quality_weight(&self, agent_id: &str) -> HubResult<f64> {
        let Some(agent) = self.registry.get(agent_id).await? else {
            return Ok(1.0);
        };
        if agent.quality.completed_count == 0 && agent.quality.rollback_count == 0 {
            return Ok(1.0);
        }
        let stability = 1.0 - (agent.quality.rollback_rate() * 0.7).min(0.35);
        let experience_boost = ((agent.quality.completed_count as f64 + 1.0).log10() * 0.06).min(0.12);
        Ok((stability + experience_boost).clamp(0.7, 1.2))
    }

    async fn load_votes(&self, source: &VoteSource) -> HubResult<Vec<RawVote>> {
        match source {
            VoteSource::Inline(votes) => Ok(votes
                .iter()
                .map(|v| RawVote { agent_id: Some(v.agent_id.clone()), decision: Some(decision_str(v.decision).to_string()), confidence: v.confidence })
                .collect()),
            VoteSource::BlobHash(hash) => self.load_votes_from_blob(hash).await,
            VoteSource::BlobRef(literal) => {
                let blob_ref = BlobRef::parse(literal)
                    .ok_or_else(|| HubError::new(ErrorCode::InvalidVotesBlobRef, "votes_blob_ref is not a well-formed blob reference"))?;
                self.load_votes_from_blob(&blob_ref.h).await
            }
        }
    }

    async fn load_votes_from_blob(&self, hash: &str) -> HubResult<Vec<RawVote>> {
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HubError::new(ErrorCode::InvalidVotesBlobRef, "votes blob hash must be 64 lowercase hex characters"));
        }
        let blob = self.blobs.get(hash).await?.ok_or_else(|| HubError::new(ErrorCode::VotesBlobNotFound, format!("no blob with hash {hash}")))?;
        let decoded = lossless_decode(&blob.value).map_err(|(_, failure)| HubError::from(failure))?;

        if let Ok(votes) = serde_json::from_str::<Vec<RawVote>>(&decoded) {
            return Ok(votes);
        }
        if let Ok(wrapper) = serde_json::from_str::<VotesWrapper>(&decoded) {
            return Ok(wrapper.votes);
        }
        Err(HubError::new(ErrorCode::VotesBlobInvalidJson, "votes blob is neither a JSON array nor {votes:[...]}"))
    }
}

fn normalize_votes(raw: Vec<RawVote>) -> Vec<Vote> {
    raw.into_iter()
        .filter_map(|v| {
            let agent_id = v.agent_id?;
            if agent_id.is_empty() {
                return None;
            }
            let decision = parse_decision(v.decision.as_deref()?)?;
            let confidence = v.confidence.map(|c| c.clamp(0.0, 1.0));
            Some(Vote { agent_id, decision, confidence })
        })
        .collect()
}

fn dedupe_by_agent(votes: Vec<Vote>) -> Vec<Vote> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: std::collections::HashMap<String, Vote> = std::collections::HashMap::new();
    for vote in votes {
        if !latest.contains_key(&vote.agent_id) {
            order.push(vote.agent_id.clone());
        }
        latest.insert(vote.agent_id.clone(), vote);
    }
    order.into_iter().filter_map(|id| latest.remove(&id)).collect()
}

fn parse_decision(raw: &str) -> Option<VoteDecision> {
    match raw {
        "accept" => Some(VoteDecision::Accept),
        "reject" => Some(VoteDecision::Reject),
        "abstain" => Some(VoteDecision::Abstain),
        _ => None,
    }
}

fn decision_str(d: VoteDecision) -> &'static str {
    match d {
        VoteDecision::Accept => "accept",
        VoteDecision::Reject => "reject",
        VoteDecision::Abstain => "abstain",
    }
}

fn outcome_str(o: ConsensusOutcome) -> &'static str {
    match o {
        ConsensusOutcome::Accept => "accept",
        ConsensusOutcome::Reject => "reject",
        ConsensusOutcome::EscalateVerifier => "escalate_verifier",
    }
}

fn parse_outcome(raw: &str) -> HubResult<ConsensusOutcome> {
    match raw {
        "accept" => Ok(ConsensusOutcome::Accept),
        "reject" => Ok(ConsensusOutcome::Reject),
        "escalate_verifier" => Ok(ConsensusOutcome::EscalateVerifier),
        other => Err(HubError::new(ErrorCode::Internal, format!("unknown persisted consensus outcome `{other}`"))),
    }
}

fn row_to_decision(row: sqlx::sqlite::SqliteRow) -> HubResult<ConsensusDecision> {
    let stats_raw: String = row.try_get("stats")?;
    let reasons_raw: String = row.try_get("reasons")?;
    let created_at_raw: String = row.try_get("created_at")?;
    Ok(ConsensusDecision {
        id: row.try_get("id")?,
        proposal_id: row.try_get("proposal_id")?,
        requesting_agent: row.try_get("requesting_agent")?,
        outcome: parse_outcome(&row.try_get::<String, _>("outcome")?)?,
        stats: serde_json::from_str(&stats_raw)
            .map_err(|e| HubError::new(ErrorCode::SerializationError, "stored stats is not valid JSON").with_source(e))?,
        reasons: serde_json::from_str(&reasons_raw)
            .map_err(|e| HubError::new(ErrorCode::SerializationError, "stored reasons is not valid JSON").with_source(e))?,
        created_at: parse_ts(&created_at_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn resolver_async() -> (ConsensusResolver, Store) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let blobs = hub_blob::BlobStore::new(store.clone());
        let registry = AgentRegistry::new(store.clone());
        (ConsensusResolver::new(store.clone(), blobs, registry, 1000), store)
    }

    fn vote(agent: &str, decision: VoteDecision, confidence: f64) -> Vote {
        Vote { agent_id: agent.to_string(), decision, confidence: Some(confidence) }
    }

    #[tokio::test]
    async fn unanimous_accept_resolves_accept() {
        let (resolver, _store) = resolver_async().await;
        let req = ResolveRequest {
            proposal_id: "p1".into(),
            requesting_agent: "w1".into(),
            votes: VoteSource::Inline(vec![vote("a", VoteDecision::Accept, 0.9), vote("b", VoteDecision::Accept, 0.9)]),
            knobs: ConsensusKnobs::from_config(&HubConfig::default()),
        };
        let decision = resolver.resolve(req).await.unwrap();
        assert_eq!(decision.outcome, ConsensusOutcome::Accept);
    }

    #[tokio::test]
    async fn high_disagreement_escalates() {
        let (resolver, _store) = resolver_async().await;
        let req = ResolveRequest {
            proposal_id: "p1".into(),
            requesting_agent: "w1".into(),
            votes: VoteSource::Inline(vec![vote("a", VoteDecision::Accept, 0.9), vote("b", VoteDecision::Reject, 0.9)]),
            knobs: ConsensusKnobs::from_config(&HubConfig::default()),
        };
        let decision = resolver.resolve(req).await.unwrap();
        assert_eq!(decision.outcome, ConsensusOutcome::EscalateVerifier);
        assert_eq!(decision.reasons, json!(["high_disagreement"]));
    }

    #[tokio::test]
    async fn insufficient_votes_escalates() {
        let (resolver, _store) = resolver_async().await;
        let req = ResolveRequest {
            proposal_id: "p1".into(),
            requesting_agent: "w1".into(),
            votes: VoteSource::Inline(vec![vote("a", VoteDecision::Accept, 0.9)]),
            knobs: ConsensusKnobs::from_config(&HubConfig::default()),
        };
        let decision = resolver.resolve(req).await.unwrap();
        assert_eq!(decision.outcome, ConsensusOutcome::EscalateVerifier);
        assert_eq!(decision.reasons, json!(["insufficient_non_abstain_votes"]));
    }

    #[tokio::test]
    async fn empty_votes_rejected() {
        let (resolver, _store) = resolver_async().await;
        let req = ResolveRequest {
            proposal_id: "p1".into(),
            requesting_agent: "w1".into(),
            votes: VoteSource::Inline(vec![]),
            knobs: ConsensusKnobs::from_config(&HubConfig::default()),
        };
        let err = resolver.resolve(req).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::VotesEmpty);
    }

    #[tokio::test]
    async fn dedupe_keeps_last_vote_per_agent() {
        let (resolver, _store) = resolver_async().await;
        let req = ResolveRequest {
            proposal_id: "p1".into(),
            requesting_agent: "w1".into(),
            votes: VoteSource::Inline(vec![
                vote("a", VoteDecision::Reject, 0.9),
                vote("b", VoteDecision::Accept, 0.9),
                vote("a", VoteDecision::Accept, 0.9),
            ]),
            knobs: ConsensusKnobs::from_config(&HubConfig::default()),
        };
        let decision = resolver.resolve(req).await.unwrap();
        // after dedupe: a=accept, b=accept -> unanimous accept, no disagreement.
        assert_eq!(decision.outcome, ConsensusOutcome::Accept);
    }

    #[tokio::test]
    async fn blob_sourced_votes_resolve_via_hash() {
        let (resolver, store) = resolver_async().await;
        let blobs = hub_blob::BlobStore::new(store.clone());
        let payload = json!([{"agent_id":"a","decision":"accept","confidence":0.9},{"agent_id":"b","decision":"accept","confidence":0.9}]).to_string();
        let hash = hub_blob::sha256_hex(&payload);
        blobs.put(&hash, &payload).await.unwrap();

        let req = ResolveRequest {
            proposal_id: "p1".into(),
            requesting_agent: "w1".into(),
            votes: VoteSource::BlobHash(hash),
            knobs: ConsensusKnobs::from_config(&HubConfig::default()),
        };
        let decision = resolver.resolve(req).await.unwrap();
        assert_eq!(decision.outcome, ConsensusOutcome::Accept);
    }

    #[tokio::test]
    async fn missing_votes_blob_fails() {
        let (resolver, _store) = resolver_async().await;
        let req = ResolveRequest {
            proposal_id: "p1".into(),
            requesting_agent: "w1".into(),
            votes: VoteSource::BlobHash("a".repeat(64)),
            knobs: ConsensusKnobs::from_config(&HubConfig::default()),
        };
        let err = resolver.resolve(req).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::VotesBlobNotFound);
    }

    #[tokio::test]
    async fn list_decisions_returns_most_recent_first() {
        let (resolver, _store) = resolver_async().await;
        for proposal in ["p1", "p2"] {
            let req = ResolveRequest {
                proposal_id: proposal.into(),
                requesting_agent: "w1".into(),
                votes: VoteSource::Inline(vec![vote("a", VoteDecision::Accept, 0.9)]),
                knobs: ConsensusKnobs::from_config(&HubConfig::default()),
            };
            resolver.resolve(req).await.unwrap();
        }
        let decisions = resolver.list_decisions(10, 0).await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].proposal_id, "p2");
        assert_eq!(decisions[1].proposal_id, "p1");
    }
}
