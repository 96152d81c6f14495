// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-local KPI and transport counters backing `get_kpi_snapshot` and
//! `get_transport_snapshot`.
//!
//! Every counter here is an in-memory atomic: nothing is persisted, and a
//! restart resets all of them to zero. These are operational dashboards,
//! not an audit trail — the
//! audit trail is `activity_log`, served separately by `get_activity_log`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Running counters incremented by the server as tool calls complete.
#[derive(Default)]
pub struct KpiCounters {
    claims_issued: AtomicU64,
    claims_renewed: AtomicU64,
    claims_stolen: AtomicU64,
    claims_released_done: AtomicU64,
    claims_released_other: AtomicU64,
    done_gate_passed: AtomicU64,
    done_gate_failed: AtomicU64,
    consensus_accept: AtomicU64,
    consensus_reject: AtomicU64,
    consensus_escalate: AtomicU64,
    artifacts_uploaded: AtomicU64,
    artifacts_downloaded: AtomicU64,
    tool_calls_total: AtomicU64,
    tool_calls_failed: AtomicU64,
}

impl KpiCounters {
    /// A fresh, all-zero counter set.
    pub fn new() -> KpiCounters {
        KpiCounters::default()
    }

    /// Records one `poll_and_claim`/`claim_task` success.
    pub fn record_claim_issued(&self) {
        self.claims_issued.fetch_add(1, Ordering::Relaxed);
    }
    /// Records one successful `renew_task_claim`.
    pub fn record_claim_renewed(&self) {
        self.claims_renewed.fetch_add(1, Ordering::Relaxed);
    }
    /// Records a `CLAIM_STOLEN` outcome on claim, renew, or release.
    pub fn record_claim_stolen(&self) {
        self.claims_stolen.fetch_add(1, Ordering::Relaxed);
    }
    /// Records a `release_task_claim` whose `next_status` was `done`.
    pub fn record_claim_released_done(&self) {
        self.claims_released_done.fetch_add(1, Ordering::Relaxed);
    }
    /// Records a `release_task_claim` whose `next_status` was not `done`.
    pub fn record_claim_released_other(&self) {
        self.claims_released_other.fetch_add(1, Ordering::Relaxed);
    }
    /// Records a done-gate evaluation outcome.
    pub fn record_done_gate(&self, passed: bool) {
        if passed {
            self.done_gate_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.done_gate_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    /// Records one `resolve_consensus*` outcome.
    pub fn record_consensus_outcome(&self, outcome: &hub_core::ConsensusOutcome) {
        use hub_core::ConsensusOutcome::*;
        match outcome {
            Accept => self.consensus_accept.fetch_add(1, Ordering::Relaxed),
            Reject => self.consensus_reject.fetch_add(1, Ordering::Relaxed),
            EscalateVerifier => self.consensus_escalate.fetch_add(1, Ordering::Relaxed),
        };
    }
    /// Records one finalized artifact upload.
    pub fn record_artifact_uploaded(&self) {
        self.artifacts_uploaded.fetch_add(1, Ordering::Relaxed);
    }
    /// Records one consumed artifact download ticket.
    pub fn record_artifact_downloaded(&self) {
        self.artifacts_downloaded.fetch_add(1, Ordering::Relaxed);
    }
    /// Records the outcome of a single dispatched tool call.
    pub fn record_tool_call(&self, ok: bool) {
        self.tool_calls_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.tool_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Renders a point-in-time snapshot for `get_kpi_snapshot`.
    pub fn snapshot(&self) -> KpiSnapshot {
        KpiSnapshot {
            claims_issued: self.claims_issued.load(Ordering::Relaxed),
            claims_renewed: self.claims_renewed.load(Ordering::Relaxed),
            claims_stolen: self.claims_stolen.load(Ordering::Relaxed),
            claims_released_done: self.claims_released_done.load(Ordering::Relaxed),
            claims_released_other: self.claims_released_other.load(Ordering::Relaxed),
            done_gate_passed: self.done_gate_passed.load(Ordering::Relaxed),
            done_gate_failed: self.done_gate_failed.load(Ordering::Relaxed),
            consensus_accept: self.consensus_accept.load(Ordering::Relaxed),
            consensus_reject: self.consensus_reject.load(Ordering::Relaxed),
            consensus_escalate: self.consensus_escalate.load(Ordering::Relaxed),
            artifacts_uploaded: self.artifacts_uploaded.load(Ordering::Relaxed),
            artifacts_downloaded: self.artifacts_downloaded.load(Ordering::Relaxed),
            tool_calls_total: self.tool_calls_total.load(Ordering::Relaxed),
            tool_calls_failed: self.tool_calls_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time rendering of [`KpiCounters`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KpiSnapshot {
    /// Claims issued via `poll_and_claim` or `claim_task`.
    pub claims_issued: u64,
    /// Successful `renew_task_claim` calls.
    pub claims_renewed: u64,
    /// `CLAIM_STOLEN` outcomes across claim, renew, and release.
    pub claims_stolen: u64,
    /// `release_task_claim` calls that finished a task.
    pub claims_released_done: u64,
    /// `release_task_claim` calls that did not finish a task.
    pub claims_released_other: u64,
    /// Done-gate evaluations that passed.
    pub done_gate_passed: u64,
    /// Done-gate evaluations that failed.
    pub done_gate_failed: u64,
    /// Consensus resolutions that accepted.
    pub consensus_accept: u64,
    /// Consensus resolutions that rejected.
    pub consensus_reject: u64,
    /// Consensus resolutions that escalated to a verifier.
    pub consensus_escalate: u64,
    /// Finalized artifact uploads.
    pub artifacts_uploaded: u64,
    /// Consumed artifact download tickets.
    pub artifacts_downloaded: u64,
    /// Every dispatched tool call, success or failure.
    pub tool_calls_total: u64,
    /// Tool calls that returned a structured error.
    pub tool_calls_failed: u64,
}

/// Which of the four watermark streams a long-poll waiter is blocked on, for
/// [`TransportCounters::waiter_started`] / [`TransportCounters::waiter_finished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStream {
    /// `messages` stream.
    Messages,
    /// `tasks` stream.
    Tasks,
    /// `context` stream.
    Context,
    /// `activity` stream.
    Activity,
}

/// Live transport-layer gauges backing `get_transport_snapshot`: how many
/// SSE subscribers are connected right now, and how many `wait_for_updates`
/// callers are currently blocked on each stream.
#[derive(Default)]
pub struct TransportCounters {
    open_sse_sessions: AtomicI64,
    waiting_messages: AtomicI64,
    waiting_tasks: AtomicI64,
    waiting_context: AtomicI64,
    waiting_activity: AtomicI64,
}

impl TransportCounters {
    /// A fresh, all-zero gauge set.
    pub fn new() -> TransportCounters {
        TransportCounters::default()
    }

    /// Call when an `/events` SSE subscriber connects.
    pub fn sse_connected(&self) {
        self.open_sse_sessions.fetch_add(1, Ordering::Relaxed);
    }
    /// Call when an `/events` SSE subscriber disconnects.
    pub fn sse_disconnected(&self) {
        self.open_sse_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Call when a `wait_for_updates` poll begins blocking on `stream`.
    pub fn waiter_started(&self, stream: WaitStream) {
        self.gauge_for(stream).fetch_add(1, Ordering::Relaxed);
    }
    /// Call when a `wait_for_updates` poll watching `stream` returns, whether
    /// changed or timed out.
    pub fn waiter_finished(&self, stream: WaitStream) {
        self.gauge_for(stream).fetch_sub(1, Ordering::Relaxed);
    }

    fn gauge_for(&self, stream: WaitStream) -> &AtomicI64 {
        match stream {
            WaitStream::Messages => &self.waiting_messages,
            WaitStream::Tasks => &self.waiting_tasks,
            WaitStream::Context => &self.waiting_context,
            WaitStream::Activity => &self.waiting_activity,
        }
    }

    /// Renders a point-in-time snapshot for `get_transport_snapshot`.
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            open_sse_sessions: self.open_sse_sessions.load(Ordering::Relaxed).max(0) as u64,
            waiting: WaiterCounts {
                messages: self.waiting_messages.load(Ordering::Relaxed).max(0) as u64,
                tasks: self.waiting_tasks.load(Ordering::Relaxed).max(0) as u64,
                context: self.waiting_context.load(Ordering::Relaxed).max(0) as u64,
                activity: self.waiting_activity.load(Ordering::Relaxed).max(0) as u64,
            },
        }
    }
}

/// Per-stream count of `wait_for_updates` callers currently blocked.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WaiterCounts {
    /// Waiters watching `messages`.
    pub messages: u64,
    /// Waiters watching `tasks`.
    pub tasks: u64,
    /// Waiters watching `context`.
    pub context: u64,
    /// Waiters watching `activity`.
    pub activity: u64,
}

/// Point-in-time rendering of [`TransportCounters`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportSnapshot {
    /// Currently connected `/events` SSE subscribers.
    pub open_sse_sessions: u64,
    /// Currently blocked `wait_for_updates` callers, by stream.
    pub waiting: WaiterCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kpi_counters_accumulate_independently() {
        let kpi = KpiCounters::new();
        kpi.record_claim_issued();
        kpi.record_claim_issued();
        kpi.record_claim_stolen();
        kpi.record_done_gate(true);
        kpi.record_done_gate(false);
        kpi.record_tool_call(true);
        kpi.record_tool_call(false);

        let snap = kpi.snapshot();
        assert_eq!(snap.claims_issued, 2);
        assert_eq!(snap.claims_stolen, 1);
        assert_eq!(snap.done_gate_passed, 1);
        assert_eq!(snap.done_gate_failed, 1);
        assert_eq!(snap.tool_calls_total, 2);
        assert_eq!(snap.tool_calls_failed, 1);
    }

    #[test]
    fn consensus_outcome_routes_to_matching_counter() {
        let kpi = KpiCounters::new();
        kpi.record_consensus_outcome(&hub_core::ConsensusOutcome::Accept);
        kpi.record_consensus_outcome(&hub_core::ConsensusOutcome::EscalateVerifier);
        let snap = kpi.snapshot();
        assert_eq!(snap.consensus_accept, 1);
        assert_eq!(snap.consensus_reject, 0);
        assert_eq!(snap.consensus_escalate, 1);
    }

    #[test]
    fn transport_gauges_track_concurrent_waiters_per_stream() {
        let transport = TransportCounters::new();
        transport.sse_connected();
        transport.sse_connected();
        transport.sse_disconnected();
        transport.waiter_started(WaitStream::Tasks);
        transport.waiter_started(WaitStream::Tasks);
        transport.waiter_started(WaitStream::Messages);
        transport.waiter_finished(WaitStream::Messages);

        let snap = transport.snapshot();
        assert_eq!(snap.open_sse_sessions, 1);
        assert_eq!(snap.waiting.tasks, 2);
        assert_eq!(snap.waiting.messages, 0);
    }
}
