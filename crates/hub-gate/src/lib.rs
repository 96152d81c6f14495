// SPDX-License-Identifier: MIT OR Apache-2.0
//! Done-gate: confidence/verifier/evidence validation for closing tasks.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use hub_config::HubConfig;
use hub_core::ConsistencyMode;
use hub_error::{ErrorCode, HubError, HubResult};
use hub_registry::AgentRegistry;
use hub_store::{now_str, Store};

/// Caller-supplied inputs to a done-gate evaluation.
#[derive(Debug, Clone)]
pub struct DoneGateInput {
    /// Task being closed.
    pub task_id: i64,
    /// Agent requesting closure.
    pub agent_id: String,
    /// Consistency regime to apply. Resolution of caller override vs.
    /// the task's stored mode vs. the environment default happens before
    /// this struct is built.
    pub consistency_mode: ConsistencyMode,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    /// Must be `true` or the gate fails unconditionally.
    pub verification_passed: bool,
    /// Agent id of an independent verifier, if any.
    pub verified_by: Option<String>,
    /// New evidence references to add; normalized before validation.
    pub evidence_refs: Vec<String>,
}

/// Done-gate: confidence/verifier/evidence validation for closing tasks.
#[derive(Clone)]
pub struct DoneGate {
    store: Store,
    registry: AgentRegistry,
    config: HubConfig,
}

impl DoneGate {
    /// Wraps an already-open [`Store`] and [`AgentRegistry`], using
    /// `config` for confidence floors, thresholds, and evidence minima.
    pub fn new(store: Store, registry: AgentRegistry, config: HubConfig) -> DoneGate {
        DoneGate { store, registry, config }
    }

    /// Validates `input` against the resolved consistency regime. On
    /// success, persists the new evidence refs via an upsert into
    /// `task_evidence` and returns the final deduped evidence-ref count.
    pub async fn evaluate(&self, input: DoneGateInput) -> HubResult<usize> {
        if !input.verification_passed {
            return Err(HubError::new(ErrorCode::DoneGateFailed, "verification_passed must be true"));
        }
        if !input.confidence.is_finite() {
            return Err(HubError::new(ErrorCode::DoneGateFailed, "confidence must be a finite number"));
        }

        let strict = input.consistency_mode == ConsistencyMode::Strict;
        let floor = if strict { self.config.strict_confidence_floor } else { self.config.cheap_confidence_floor };
        if input.confidence < floor {
            return Err(HubError::new(ErrorCode::DoneGateFailed, format!("confidence {} below floor {floor}", input.confidence)));
        }

        let refs = normalize_evidence_refs(&input.evidence_refs)?;

        let agent = self.registry.get(&input.agent_id).await?;
        let rollback_rate = agent.map(|a| a.quality.rollback_rate()).unwrap_or(0.0);
        let reliability_penalty = rollback_rate.clamp(0.0, 1.0) * self.config.done_gate_max_reliability_penalty;
        let base_threshold = self.config.done_gate_base_threshold + reliability_penalty;
        let threshold = if strict { base_threshold.max(self.config.strict_confidence_floor) } else { base_threshold };

        let has_independent_verifier = matches!(&input.verified_by, Some(v) if !v.is_empty() && v != &input.agent_id);

        if strict && !has_independent_verifier {
            return Err(HubError::new(ErrorCode::VerifierRequired, "strict consistency mode always requires an independent verifier"));
        }
        if input.confidence < threshold && !has_independent_verifier {
            return Err(HubError::new(
                ErrorCode::VerifierRequired,
                format!("confidence {} below required threshold {threshold}; independent verifier required", input.confidence),
            ));
        }

        let existing_refs: Vec<(String,)> = sqlx::query_as("SELECT evidence_ref FROM task_evidence WHERE task_id = ?")
            .bind(input.task_id)
            .fetch_all(self.store.pool())
            .await?;
        let mut union: Vec<String> = existing_refs.into_iter().map(|(r,)| r).collect();
        for r in &refs {
            if !union.contains(r) {
                union.push(r.clone());
            }
        }

        let min_evidence = if strict { self.config.strict_min_evidence } else { self.config.cheap_min_evidence };
        if union.len() < min_evidence {
            return Err(HubError::new(
                ErrorCode::EvidenceRequired,
                format!("{} evidence ref(s) present, {min_evidence} required", union.len()),
            ));
        }

        let now = now_str();
        for r in &refs {
            sqlx::query("INSERT OR IGNORE INTO task_evidence (task_id, evidence_ref, created_at) VALUES (?, ?, ?)")
                .bind(input.task_id)
                .bind(r)
                .bind(&now)
                .execute(self.store.pool())
                .await?;
        }

        Ok(union.len())
    }
}

/// Trims, length-caps (≤256 chars), and dedupes evidence refs, rejecting
/// calls that supply more than 16 in one go.
fn normalize_evidence_refs(raw: &[String]) -> HubResult<Vec<String>> {
    if raw.len() > 16 {
        return Err(HubError::new(ErrorCode::EvidenceTooMany, format!("{} evidence refs supplied, max 16 per call", raw.len())));
    }
    let mut seen = Vec::new();
    for r in raw {
        let trimmed = r.trim();
        if trimmed.is_empty() {
            continue;
        }
        let capped: String = trimmed.chars().take(256).collect();
        if !seen.contains(&capped) {
            seen.push(capped);
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_registry::RegisterRequest;
    use hub_core::AgentLifecycle;

    async fn gate_with_agent(id: &str) -> (DoneGate, Store) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let registry = AgentRegistry::new(store.clone());
        registry
            .register(RegisterRequest { id: id.into(), name: "W".into(), type_tag: "t".into(), capabilities: "".into(), lifecycle: AgentLifecycle::Persistent })
            .await
            .unwrap();
        let gate = DoneGate::new(store.clone(), registry, HubConfig::default());
        (gate, store)
    }

    fn base_input(task_id: i64, agent_id: &str) -> DoneGateInput {
        DoneGateInput {
            task_id,
            agent_id: agent_id.to_string(),
            consistency_mode: ConsistencyMode::Cheap,
            confidence: 0.96,
            verification_passed: true,
            verified_by: Some(agent_id.to_string()),
            evidence_refs: vec!["e1".into()],
        }
    }

    #[tokio::test]
    async fn cheap_mode_passes_with_high_confidence_no_verifier() {
        let (gate, _store) = gate_with_agent("w1").await;
        let out = gate.evaluate(base_input(1, "w1")).await.unwrap();
        assert_eq!(out, 1);
    }

    #[tokio::test]
    async fn strict_mode_requires_independent_verifier() {
        let (gate, _store) = gate_with_agent("w1").await;
        let mut input = base_input(1, "w1");
        input.consistency_mode = ConsistencyMode::Strict;
        input.evidence_refs = vec!["e1".into(), "e2".into()];
        let err = gate.evaluate(input.clone()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::VerifierRequired);

        input.verified_by = Some("w2".into());
        let out = gate.evaluate(input).await.unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn low_confidence_requires_verifier_even_in_cheap_mode() {
        let (gate, _store) = gate_with_agent("w1").await;
        let mut input = base_input(1, "w1");
        input.confidence = 0.8;
        input.verified_by = Some("w1".into());
        let err = gate.evaluate(input.clone()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::VerifierRequired);

        input.verified_by = Some("w2".into());
        gate.evaluate(input).await.unwrap();
    }

    #[tokio::test]
    async fn evidence_below_minimum_fails() {
        let (gate, _store) = gate_with_agent("w1").await;
        let mut input = base_input(1, "w1");
        input.evidence_refs = vec![];
        let err = gate.evaluate(input).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EvidenceRequired);
    }

    #[tokio::test]
    async fn more_than_sixteen_refs_rejected() {
        let (gate, _store) = gate_with_agent("w1").await;
        let mut input = base_input(1, "w1");
        input.evidence_refs = (0..17).map(|i| format!("e{i}")).collect();
        let err = gate.evaluate(input).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EvidenceTooMany);
    }

    #[tokio::test]
    async fn confidence_below_floor_fails_even_with_verifier() {
        let (gate, _store) = gate_with_agent("w1").await;
        let mut input = base_input(1, "w1");
        input.confidence = 0.5;
        input.verified_by = Some("w2".into());
        let err = gate.evaluate(input).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DoneGateFailed);
    }
}
