// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-source, env-overridable runtime configuration for the
//! coordination hub.
//!
//! Every environment-overridable tunable lives on [`HubConfig`].
//! Values are read once at boot via
//! [`HubConfig::from_env`]; the hub does not support runtime reconfiguration.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// A single malformed environment variable, collected so callers can report
/// every problem at once instead of failing on the first one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid value for {name}: {reason}")]
pub struct ConfigWarning {
    /// Name of the offending environment variable.
    pub name: String,
    /// Human-readable description of why it was rejected.
    pub reason: String,
}

/// Top-level runtime configuration, loaded once at process start.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Default lease duration handed to `poll_and_claim`/`claim_task` when
    /// the caller omits one. Seconds. Default `300`.
    pub default_lease_secs: u64,

    /// Confidence floor in `cheap` consistency mode. Default `0.75`.
    pub cheap_confidence_floor: f64,
    /// Confidence floor in `strict` consistency mode (`strict-min`).
    /// Default `0.95`.
    pub strict_confidence_floor: f64,
    /// Base required-confidence threshold before the reliability penalty.
    /// Default `0.9`.
    pub done_gate_base_threshold: f64,
    /// Maximum additive reliability penalty applied to the required
    /// confidence threshold. Default `0.07`.
    pub done_gate_max_reliability_penalty: f64,
    /// Minimum distinct evidence references required in `cheap` mode.
    /// Default `1`.
    pub cheap_min_evidence: usize,
    /// Minimum distinct evidence references required in `strict` mode.
    /// Default `2`.
    pub strict_min_evidence: usize,

    /// Maximum message content length, in characters. Default `1024`.
    pub max_message_content_chars: usize,
    /// Maximum context value length, in characters. Default `2048`.
    pub max_context_value_chars: usize,

    /// Freshness bound for the cached shared watermarks. Default `75ms`.
    pub watermark_cache: Duration,
    /// Maximum entries retained in the per-agent message-watermark cache.
    /// Default `5000`.
    pub watermark_agent_cache_max: usize,

    /// Default disagreement-ratio escalation threshold. Default `0.35`.
    pub consensus_disagreement_threshold: f64,
    /// Default minimum non-abstaining votes before a decision is reached.
    /// Default `2`.
    pub consensus_min_non_abstain_votes: usize,
    /// Maximum number of votes accepted in one resolution call. Default `1000`.
    pub max_consensus_votes: usize,

    /// Default long-poll wait ceiling. Default `25s`, hard cap `300s`.
    pub max_wait: Duration,
    /// Default long-poll retry backoff factor. Default `1.5`.
    pub wait_backoff_factor: f64,
    /// Default long-poll retry backoff cap. Default `10s`.
    pub wait_backoff_cap: Duration,
    /// Default long-poll retry backoff jitter fraction. Default `0.20`.
    pub wait_backoff_jitter: f64,

    /// Maintenance sweep interval. Default `30s`.
    pub maintenance_interval: Duration,
    /// Persistent-agent inactivity cutoff before marking offline. Default `30m`.
    pub persistent_offline_after: Duration,
    /// Ephemeral-agent inactivity cutoff before marking offline. Default `5m`.
    pub ephemeral_offline_after: Duration,
    /// Delay after going offline before an ephemeral agent's claims are reaped.
    /// Default `max(60s, 2 * ephemeral_offline_after)`.
    pub ephemeral_claim_reap_after: Duration,
    /// Retention before deleting an offline persistent agent. Default `7d`.
    pub persistent_agent_ttl: Duration,
    /// Retention before deleting an offline ephemeral agent. Default `2h`.
    pub ephemeral_agent_ttl: Duration,
    /// Idempotency record retention. Default `10m`.
    pub idempotency_ttl: Duration,
    /// Message retention before TTL sweep. Default `24h`.
    pub message_ttl: Duration,
    /// Activity-log retention before TTL sweep. Default `24h`.
    pub activity_log_ttl: Duration,
    /// Unreferenced protocol-blob retention before TTL sweep. Default `7d`.
    pub protocol_blob_ttl: Duration,
    /// Artifact retention absent an explicit `ttl_expires_at`. Default `7d`.
    pub artifact_ttl: Duration,
    /// Auth-event retention before TTL sweep. Default `7d`.
    pub auth_event_ttl: Duration,
    /// Resolved SLO alert retention before TTL sweep. Default `14d`.
    pub resolved_slo_alert_ttl: Duration,
    /// Done-task archival cutoff. Default `7d`.
    pub archive_done_after: Duration,
    /// Maximum rows archived per maintenance pass. Default `200`.
    pub archive_batch_limit: usize,

    /// `high_pending_age` SLO threshold. Default `30m`.
    pub slo_pending_age: Duration,
    /// `stale_in_progress` SLO threshold. Default `20m`.
    pub slo_stale_in_progress: Duration,
    /// `claim_churn` SLO lookback window. Default `10m`.
    pub slo_claim_churn_window: Duration,
    /// `claim_churn` SLO activity-count threshold. Default `120`.
    pub slo_claim_churn_threshold: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            default_lease_secs: 300,

            cheap_confidence_floor: 0.75,
            strict_confidence_floor: 0.95,
            done_gate_base_threshold: 0.9,
            done_gate_max_reliability_penalty: 0.07,
            cheap_min_evidence: 1,
            strict_min_evidence: 2,

            max_message_content_chars: 1024,
            max_context_value_chars: 2048,

            watermark_cache: Duration::from_millis(75),
            watermark_agent_cache_max: 5000,

            consensus_disagreement_threshold: 0.35,
            consensus_min_non_abstain_votes: 2,
            max_consensus_votes: 1000,

            max_wait: Duration::from_secs(25),
            wait_backoff_factor: 1.5,
            wait_backoff_cap: Duration::from_secs(10),
            wait_backoff_jitter: 0.20,

            maintenance_interval: Duration::from_secs(30),
            persistent_offline_after: Duration::from_secs(30 * 60),
            ephemeral_offline_after: Duration::from_secs(5 * 60),
            ephemeral_claim_reap_after: Duration::from_secs(600),
            persistent_agent_ttl: Duration::from_secs(7 * 24 * 3600),
            ephemeral_agent_ttl: Duration::from_secs(2 * 3600),
            idempotency_ttl: Duration::from_secs(600),
            message_ttl: Duration::from_secs(24 * 3600),
            activity_log_ttl: Duration::from_secs(24 * 3600),
            protocol_blob_ttl: Duration::from_secs(7 * 24 * 3600),
            artifact_ttl: Duration::from_secs(7 * 24 * 3600),
            auth_event_ttl: Duration::from_secs(7 * 24 * 3600),
            resolved_slo_alert_ttl: Duration::from_secs(14 * 24 * 3600),
            archive_done_after: Duration::from_secs(7 * 24 * 3600),
            archive_batch_limit: 200,

            slo_pending_age: Duration::from_secs(30 * 60),
            slo_stale_in_progress: Duration::from_secs(20 * 60),
            slo_claim_churn_window: Duration::from_secs(10 * 60),
            slo_claim_churn_threshold: 120,
        }
    }
}

impl HubConfig {
    /// Loads configuration from environment variables, falling back to
    /// [`HubConfig::default`] for anything unset. Malformed values are
    /// collected as warnings rather than aborting the load; the default for
    /// that field is used instead.
    ///
    /// `EPHEMERAL_CLAIM_REAP_AFTER_MS`, if unset, is derived from
    /// `ephemeral_offline_after` via the
    /// `max(60s, 2 * ephemeral-offline-ms)` rule, so it must be computed
    /// after `EPHEMERAL_OFFLINE_AFTER_MS` is resolved.
    pub fn from_env() -> (HubConfig, Vec<ConfigWarning>) {
        let mut cfg = HubConfig::default();
        let mut warnings = Vec::new();

        load_u64(&mut cfg.default_lease_secs, "DEFAULT_LEASE_SECS", &mut warnings);
        cfg.default_lease_secs = cfg.default_lease_secs.clamp(30, 86_400);

        load_f64(&mut cfg.cheap_confidence_floor, "CHEAP_CONFIDENCE_FLOOR", &mut warnings);
        load_f64(&mut cfg.strict_confidence_floor, "STRICT_CONFIDENCE_FLOOR", &mut warnings);
        load_f64(&mut cfg.done_gate_base_threshold, "DONE_GATE_BASE_THRESHOLD", &mut warnings);
        load_f64(
            &mut cfg.done_gate_max_reliability_penalty,
            "DONE_GATE_MAX_RELIABILITY_PENALTY",
            &mut warnings,
        );
        load_usize(&mut cfg.cheap_min_evidence, "CHEAP_MIN_EVIDENCE", &mut warnings);
        load_usize(&mut cfg.strict_min_evidence, "STRICT_MIN_EVIDENCE", &mut warnings);

        load_usize(&mut cfg.max_message_content_chars, "MAX_MESSAGE_CONTENT_CHARS", &mut warnings);
        load_usize(&mut cfg.max_context_value_chars, "MAX_CONTEXT_VALUE_CHARS", &mut warnings);

        load_duration_ms(&mut cfg.watermark_cache, "WATERMARK_CACHE_MS", &mut warnings);
        load_usize(&mut cfg.watermark_agent_cache_max, "WATERMARK_AGENT_CACHE_MAX", &mut warnings);

        load_f64(
            &mut cfg.consensus_disagreement_threshold,
            "CONSENSUS_DISAGREEMENT_THRESHOLD",
            &mut warnings,
        );
        cfg.consensus_disagreement_threshold = cfg.consensus_disagreement_threshold.clamp(0.1, 0.9);
        load_usize(
            &mut cfg.consensus_min_non_abstain_votes,
            "CONSENSUS_MIN_NON_ABSTAIN_VOTES",
            &mut warnings,
        );
        load_usize(&mut cfg.max_consensus_votes, "MAX_CONSENSUS_VOTES", &mut warnings);

        load_duration_ms(&mut cfg.max_wait, "MAX_WAIT_MS", &mut warnings);
        cfg.max_wait = cfg.max_wait.clamp(Duration::from_millis(100), Duration::from_secs(300));
        load_f64(&mut cfg.wait_backoff_factor, "WAIT_BACKOFF_FACTOR", &mut warnings);
        cfg.wait_backoff_factor = cfg.wait_backoff_factor.clamp(1.0, 3.0);
        load_duration_ms(&mut cfg.wait_backoff_cap, "WAIT_BACKOFF_CAP_MS", &mut warnings);
        cfg.wait_backoff_cap = cfg.wait_backoff_cap.clamp(Duration::from_millis(100), Duration::from_secs(120));
        load_f64(&mut cfg.wait_backoff_jitter, "WAIT_BACKOFF_JITTER", &mut warnings);
        cfg.wait_backoff_jitter = cfg.wait_backoff_jitter.clamp(0.0, 0.80);

        load_duration_ms(&mut cfg.maintenance_interval, "MAINTENANCE_INTERVAL_MS", &mut warnings);
        load_duration_ms(&mut cfg.persistent_offline_after, "PERSISTENT_OFFLINE_AFTER_MS", &mut warnings);
        load_duration_ms(&mut cfg.ephemeral_offline_after, "EPHEMERAL_OFFLINE_AFTER_MS", &mut warnings);

        let default_reap = Duration::from_secs(60).max(cfg.ephemeral_offline_after * 2);
        cfg.ephemeral_claim_reap_after = default_reap;
        load_duration_ms(&mut cfg.ephemeral_claim_reap_after, "EPHEMERAL_CLAIM_REAP_AFTER_MS", &mut warnings);

        load_duration_ms(&mut cfg.persistent_agent_ttl, "PERSISTENT_AGENT_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.ephemeral_agent_ttl, "EPHEMERAL_AGENT_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.idempotency_ttl, "IDEMPOTENCY_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.message_ttl, "MESSAGE_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.activity_log_ttl, "ACTIVITY_LOG_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.protocol_blob_ttl, "PROTOCOL_BLOB_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.artifact_ttl, "ARTIFACT_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.auth_event_ttl, "AUTH_EVENT_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.resolved_slo_alert_ttl, "RESOLVED_SLO_ALERT_TTL_MS", &mut warnings);
        load_duration_ms(&mut cfg.archive_done_after, "ARCHIVE_DONE_AFTER_MS", &mut warnings);
        load_usize(&mut cfg.archive_batch_limit, "ARCHIVE_BATCH_LIMIT", &mut warnings);

        load_duration_ms(&mut cfg.slo_pending_age, "SLO_PENDING_AGE_MS", &mut warnings);
        load_duration_ms(&mut cfg.slo_stale_in_progress, "SLO_STALE_IN_PROGRESS_MS", &mut warnings);
        load_duration_ms(&mut cfg.slo_claim_churn_window, "SLO_CLAIM_CHURN_WINDOW_MS", &mut warnings);
        load_u64(&mut cfg.slo_claim_churn_threshold, "SLO_CLAIM_CHURN_THRESHOLD", &mut warnings);

        (cfg, warnings)
    }

    /// Renders every tunable as a flat string map, for `/health` and
    /// `get_kpi_snapshot` diagnostics.
    pub fn to_snapshot(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("default_lease_secs".into(), self.default_lease_secs.to_string());
        map.insert("watermark_cache_ms".into(), self.watermark_cache.as_millis().to_string());
        map.insert("watermark_agent_cache_max".into(), self.watermark_agent_cache_max.to_string());
        map.insert("maintenance_interval_ms".into(), self.maintenance_interval.as_millis().to_string());
        map.insert("max_wait_ms".into(), self.max_wait.as_millis().to_string());
        map
    }
}

fn load_u64(slot: &mut u64, name: &str, warnings: &mut Vec<ConfigWarning>) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<u64>() {
            Ok(v) => *slot = v,
            Err(e) => warnings.push(ConfigWarning { name: name.to_string(), reason: e.to_string() }),
        }
    }
}

fn load_usize(slot: &mut usize, name: &str, warnings: &mut Vec<ConfigWarning>) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<usize>() {
            Ok(v) => *slot = v,
            Err(e) => warnings.push(ConfigWarning { name: name.to_string(), reason: e.to_string() }),
        }
    }
}

fn load_f64(slot: &mut f64, name: &str, warnings: &mut Vec<ConfigWarning>) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<f64>() {
            Ok(v) => *slot = v,
            Err(e) => warnings.push(ConfigWarning { name: name.to_string(), reason: e.to_string() }),
        }
    }
}

fn load_duration_ms(slot: &mut Duration, name: &str, warnings: &mut Vec<ConfigWarning>) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<u64>() {
            Ok(v) => *slot = Duration::from_millis(v),
            Err(e) => warnings.push(ConfigWarning { name: name.to_string(), reason: e.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.default_lease_secs, 300);
        assert_eq!(cfg.watermark_cache, Duration::from_millis(75));
        assert_eq!(cfg.watermark_agent_cache_max, 5000);
        assert_eq!(cfg.max_consensus_votes, 1000);
        assert_eq!(cfg.slo_claim_churn_threshold, 120);
    }

    #[test]
    fn ephemeral_claim_reap_after_derives_from_offline_cutoff_when_unset() {
        // SAFETY-free: env mutation is process-wide but this test does not
        // run concurrently with others that touch these names.
        env::remove_var("EPHEMERAL_OFFLINE_AFTER_MS");
        env::remove_var("EPHEMERAL_CLAIM_REAP_AFTER_MS");
        let (cfg, warnings) = HubConfig::from_env();
        assert!(warnings.is_empty());
        assert_eq!(cfg.ephemeral_claim_reap_after, Duration::from_secs(600));
    }

    #[test]
    fn malformed_env_var_falls_back_to_default_and_warns() {
        env::set_var("MAX_CONSENSUS_VOTES", "not-a-number");
        let (cfg, warnings) = HubConfig::from_env();
        env::remove_var("MAX_CONSENSUS_VOTES");
        assert_eq!(cfg.max_consensus_votes, 1000);
        assert!(warnings.iter().any(|w| w.name == "MAX_CONSENSUS_VOTES"));
    }

    #[test]
    fn consensus_disagreement_threshold_is_clamped() {
        env::set_var("CONSENSUS_DISAGREEMENT_THRESHOLD", "0.95");
        let (cfg, _warnings) = HubConfig::from_env();
        env::remove_var("CONSENSUS_DISAGREEMENT_THRESHOLD");
        assert_eq!(cfg.consensus_disagreement_threshold, 0.9);
    }
}
