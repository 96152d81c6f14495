// SPDX-License-Identifier: MIT OR Apache-2.0
//! Long-poll `waitForUpdates` loop and its SSE push counterpart.
//!
//! Both variants share the same primitive: sample [`hub_watermark::ClockWatermarks`]
//! at an interval until one of the caller's requested streams advances past a
//! baseline cursor, or a hard deadline elapses. The polling variant returns a
//! single outcome; the SSE variant (wired up by the server crate around
//! [`poll_until_change`]) keeps looping, emitting `update`/`heartbeat` frames.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use hub_core::Cursor;
use hub_error::HubResult;
use hub_watermark::{ClockWatermarks, Stream};
use serde::Serialize;
use std::time::{Duration, Instant};

const MIN_WAIT_MS: u64 = 100;
const DEFAULT_MAX_WAIT_MS: u64 = 25_000;
const MAX_MAX_WAIT_MS: u64 = 300_000;

const MIN_POLL_INTERVAL_MS: u64 = 100;
const MAX_POLL_INTERVAL_MS: u64 = 2_000;

/// Minimum idle time before an SSE connection must emit a `heartbeat` frame.
pub const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Clamps a caller-supplied `wait_ms` to `[100, max_wait_ms]`, where
/// `max_wait_ms` itself is the deployment's `MAX_WAIT_MS` (env default 25s,
/// hard cap 300s).
pub fn normalize_wait_ms(requested: Option<u64>, max_wait_ms: u64) -> u64 {
    let max_wait_ms = max_wait_ms.min(MAX_MAX_WAIT_MS);
    requested.unwrap_or(DEFAULT_MAX_WAIT_MS).clamp(MIN_WAIT_MS, max_wait_ms.max(MIN_WAIT_MS))
}

/// Clamps a caller-supplied `poll_interval_ms` to `[100, 2000]`.
pub fn normalize_poll_interval_ms(requested: Option<u64>) -> u64 {
    requested.unwrap_or(500).clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS)
}

/// Tunables for the streak-based timeout backoff, sourced from
/// `WAIT_BACKOFF_*` env configuration.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Growth factor per consecutive timeout, clamped `[1.0, 3.0]`.
    pub factor: f64,
    /// Ceiling on `retry_after_ms`, clamped `[100ms, 120s]`.
    pub cap_ms: u64,
    /// Symmetric jitter fraction, clamped `[0.0, 0.8]`.
    pub jitter: f64,
}

impl BackoffConfig {
    /// Normalizes raw env-sourced values into their documented bounds.
    pub fn new(factor: f64, cap_ms: u64, jitter: f64) -> BackoffConfig {
        BackoffConfig { factor: factor.clamp(1.0, 3.0), cap_ms: cap_ms.clamp(100, 120_000), jitter: jitter.clamp(0.0, 0.8) }
    }
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig { factor: 1.5, cap_ms: 10_000, jitter: 0.20 }
    }
}

/// `retry_after_ms` for a caller whose wait just timed out with no change
/// observed, given how many consecutive timeouts (`miss_streak`) it has
/// already accumulated on this cursor. Callers reset their streak to zero the
/// moment a wait returns [`WaitOutcome::Changed`].
pub fn compute_retry_after_ms(cfg: BackoffConfig, miss_streak: u32, rng: impl FnOnce() -> f64) -> u64 {
    let exponent = miss_streak.min(20);
    let raw = 1_000.0 * cfg.factor.powi(exponent as i32);
    let capped = raw.min(cfg.cap_ms as f64);
    let jitter_draw = rng().clamp(-1.0, 1.0) * cfg.jitter;
    (capped * (1.0 + jitter_draw)).max(0.0).round() as u64
}

/// Outcome of one `waitForUpdates` call.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// At least one requested stream advanced past the baseline.
    Changed {
        /// Full four-part cursor as of the moment of detection.
        cursor: Cursor,
        /// Which of the requested streams advanced.
        changed_streams: Vec<Stream>,
    },
    /// The deadline elapsed with no requested stream advancing.
    TimedOut {
        /// Suggested delay before the caller's next `waitForUpdates` call.
        retry_after_ms: u64,
    },
}

/// Polls `watermarks` for `agent_id` until a requested stream advances past
/// `baseline`, or `wait_ms` elapses — whichever comes first. Never emits a
/// partial result: the only two outcomes are a full [`WaitOutcome::Changed`]
/// or a full [`WaitOutcome::TimedOut`].
pub async fn poll_until_change(
    watermarks: &ClockWatermarks,
    agent_id: &str,
    streams: &[Stream],
    baseline: Cursor,
    wait_ms: u64,
    poll_interval_ms: u64,
    backoff: BackoffConfig,
    miss_streak: u32,
    rng: impl Fn() -> f64,
) -> HubResult<WaitOutcome> {
    let streams: &[Stream] = if streams.is_empty() { &Stream::ALL } else { streams };
    let deadline = Instant::now() + Duration::from_millis(wait_ms);
    let interval = Duration::from_millis(poll_interval_ms);

    loop {
        let mut current = baseline;
        let mut changed_streams = Vec::new();
        for stream in streams {
            let value = watermarks.value_for(*stream, agent_id).await?;
            set_cursor_field(&mut current, *stream, value);
            if value > baseline_field(&baseline, *stream) {
                changed_streams.push(*stream);
            }
        }
        if !changed_streams.is_empty() {
            return Ok(WaitOutcome::Changed { cursor: current, changed_streams });
        }
        if Instant::now() >= deadline {
            return Ok(WaitOutcome::TimedOut { retry_after_ms: compute_retry_after_ms(backoff, miss_streak, rng) });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

fn baseline_field(cursor: &Cursor, stream: Stream) -> i64 {
    match stream {
        Stream::Messages => cursor.messages,
        Stream::Tasks => cursor.tasks,
        Stream::Context => cursor.context,
        Stream::Activity => cursor.activity,
    }
}

fn set_cursor_field(cursor: &mut Cursor, stream: Stream, value: i64) {
    match stream {
        Stream::Messages => cursor.messages = value,
        Stream::Tasks => cursor.tasks = value,
        Stream::Context => cursor.context = value,
        Stream::Activity => cursor.activity = value,
    }
}

/// Size-tuned response envelope selector for `wait_for_updates`.
/// `Compact` is the default; the others trade detail for payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Single-letter keys only: `c`, `s`, `u`, `r`.
    Nano,
    /// Abbreviated keys, no elapsed timing.
    Micro,
    /// Abbreviated keys plus elapsed timing.
    Tiny,
    /// Full key names, elapsed timing, and the watermark cursor. Default.
    Compact,
    /// Everything `Compact` has, plus a per-stream changed/unchanged boolean.
    Full,
}

impl Default for ResponseShape {
    fn default() -> ResponseShape {
        ResponseShape::Compact
    }
}

impl ResponseShape {
    /// Parses the `shape` query parameter; unrecognized values fall back to
    /// [`ResponseShape::Compact`].
    pub fn parse(raw: &str) -> ResponseShape {
        match raw {
            "nano" => ResponseShape::Nano,
            "micro" => ResponseShape::Micro,
            "tiny" => ResponseShape::Tiny,
            "full" => ResponseShape::Full,
            _ => ResponseShape::Compact,
        }
    }
}

/// Renders a [`WaitOutcome`] into the wire JSON for the selected shape.
pub fn render(shape: ResponseShape, outcome: &WaitOutcome, watched: &[Stream], elapsed_ms: u64) -> serde_json::Value {
    let (changed, cursor_enc, retry_after_ms, changed_streams): (bool, Option<String>, Option<u64>, Vec<&'static str>) = match outcome {
        WaitOutcome::Changed { cursor, changed_streams } => {
            (true, Some(cursor.encode()), None, changed_streams.iter().map(Stream::as_str).collect())
        }
        WaitOutcome::TimedOut { retry_after_ms } => (false, None, Some(*retry_after_ms), Vec::new()),
    };

    match shape {
        ResponseShape::Nano => serde_json::json!({
            "c": changed,
            "s": changed_streams,
            "u": cursor_enc,
            "r": retry_after_ms,
        }),
        ResponseShape::Micro => serde_json::json!({
            "changed": changed,
            "streams": changed_streams,
            "cursor": cursor_enc,
            "retry_after_ms": retry_after_ms,
        }),
        ResponseShape::Tiny => serde_json::json!({
            "changed": changed,
            "streams": changed_streams,
            "cursor": cursor_enc,
            "retry_after_ms": retry_after_ms,
            "elapsed_ms": elapsed_ms,
        }),
        ResponseShape::Compact => serde_json::json!({
            "changed": changed,
            "changed_streams": changed_streams,
            "cursor": cursor_enc,
            "retry_after_ms": retry_after_ms,
            "elapsed_ms": elapsed_ms,
        }),
        ResponseShape::Full => {
            let mut per_stream = serde_json::Map::new();
            for s in watched {
                per_stream.insert(s.as_str().to_string(), serde_json::Value::Bool(changed_streams.contains(&s.as_str())));
            }
            serde_json::json!({
                "changed": changed,
                "changed_streams": changed_streams,
                "streams": per_stream,
                "cursor": cursor_enc,
                "retry_after_ms": retry_after_ms,
                "elapsed_ms": elapsed_ms,
            })
        }
    }
}

/// One frame of the `/events` SSE push variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SseFrame {
    /// First frame on connect, carrying the subscriber's starting cursor.
    Hello {
        /// Encoded starting cursor.
        cursor: String,
    },
    /// Emitted whenever a watched stream advances.
    Update {
        /// Encoded cursor as of the advance.
        cursor: String,
        /// Streams that advanced.
        changed_streams: Vec<String>,
    },
    /// Emitted after `SSE_HEARTBEAT_INTERVAL` of no `Update` frame.
    Heartbeat {
        /// Encoded cursor as of the heartbeat, so clients can resync without
        /// waiting for the next real change.
        cursor: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_store::Store;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn returns_timed_out_when_nothing_advances() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let watermarks = ClockWatermarks::new(store, StdDuration::from_millis(10), 100);
        let outcome = poll_until_change(
            &watermarks,
            "agent-1",
            &Stream::ALL,
            Cursor::ZERO,
            150,
            50,
            BackoffConfig::default(),
            0,
            || 0.0,
        )
        .await
        .unwrap();
        match outcome {
            WaitOutcome::TimedOut { retry_after_ms } => assert!(retry_after_ms > 0),
            WaitOutcome::Changed { .. } => panic!("expected timeout, watermarks never moved"),
        }
    }

    #[tokio::test]
    async fn detects_task_watermark_advance() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let watermarks = ClockWatermarks::new(store.clone(), StdDuration::from_millis(10), 100);
        let baseline = watermarks.cursor_for("agent-1", Default::default()).await.unwrap();

        let writer_store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            let now = hub_store::now_str();
            sqlx::query(
                "INSERT INTO tasks (title, namespace, priority, execution_mode, consistency_mode, status, creator, created_at, updated_at)
                 VALUES ('t', 'default', 'medium', 'any', 'cheap', 'pending', 'tester', ?, ?)",
            )
            .bind(&now)
            .bind(&now)
            .execute(writer_store.pool())
            .await
            .unwrap();
        });

        let outcome = poll_until_change(
            &watermarks,
            "agent-1",
            &[Stream::Tasks],
            baseline,
            2_000,
            20,
            BackoffConfig::default(),
            0,
            || 0.0,
        )
        .await
        .unwrap();
        match outcome {
            WaitOutcome::Changed { changed_streams, .. } => assert_eq!(changed_streams, vec![Stream::Tasks]),
            WaitOutcome::TimedOut { .. } => panic!("task insert never got picked up before wait_ms elapsed"),
        }
    }

    #[test]
    fn wait_ms_and_poll_interval_are_clamped() {
        assert_eq!(normalize_wait_ms(Some(1), 25_000), 100);
        assert_eq!(normalize_wait_ms(Some(999_999), 25_000), 25_000);
        assert_eq!(normalize_wait_ms(None, 25_000), 25_000);
        assert_eq!(normalize_poll_interval_ms(Some(1)), 100);
        assert_eq!(normalize_poll_interval_ms(Some(5_000)), 2_000);
    }

    #[test]
    fn retry_after_grows_with_streak_and_respects_cap() {
        let cfg = BackoffConfig::default();
        let first = compute_retry_after_ms(cfg, 0, || 0.0);
        let later = compute_retry_after_ms(cfg, 10, || 0.0);
        assert!(later >= first);
        assert!(later <= cfg.cap_ms);
    }

    #[test]
    fn response_shape_parses_known_names_and_falls_back_to_compact() {
        assert_eq!(ResponseShape::parse("nano"), ResponseShape::Nano);
        assert_eq!(ResponseShape::parse("bogus"), ResponseShape::Compact);
    }

    #[test]
    fn nano_shape_uses_single_letter_keys() {
        let outcome = WaitOutcome::TimedOut { retry_after_ms: 500 };
        let rendered = render(ResponseShape::Nano, &outcome, &Stream::ALL, 150);
        let obj = rendered.as_object().unwrap();
        assert!(obj.contains_key("c"));
        assert!(obj.contains_key("s"));
        assert!(obj.contains_key("u"));
        assert!(obj.contains_key("r"));
    }
}
