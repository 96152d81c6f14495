// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed, deduplicated payload store.
//!
//! The store never hashes anything itself — callers compute the SHA-256
//! of the value they intend to store and use it as the primary key. This
//! crate layers a convenience compression policy (`LosslessAuto`) on top
//! for large text payloads, and a reachability-based GC that only ever
//! deletes a hash once no message or context row still references it.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine;
use chrono::{DateTime, Utc};
use hub_core::{Blob, LosslessEnvelope};
use hub_error::{ErrorCode, HubError, HubResult};
use hub_store::{now_str, parse_ts, Store};
use sha2::{Digest, Sha256};
use sqlx::Row;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Brotli quality used by `lossless_auto_encode`.
const BROTLI_QUALITY: u32 = 4;
/// Brotli window (lg) used by `lossless_auto_encode`.
const BROTLI_LG_WINDOW: u32 = 22;

/// Computes the lowercase hex SHA-256 of `value`, the hash callers are
/// expected to pass to [`BlobStore::put`].
#[must_use]
pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

/// Outcome of [`BlobStore::put`]: whether the hash was newly inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// `true` if this hash had never been seen before.
    pub created: bool,
}

/// Content-addressed, deduplicated payload store.
#[derive(Clone)]
pub struct BlobStore {
    store: Store,
}

impl BlobStore {
    /// Wraps an already-open [`Store`].
    pub fn new(store: Store) -> BlobStore {
        BlobStore { store }
    }

    /// Inserts `value` under `hash` if unseen, otherwise bumps `updated_at`.
    /// The caller is responsible for having computed `hash` correctly;
    /// this store does not re-hash or verify it.
    pub async fn put(&self, hash: &str, value: &str) -> HubResult<PutOutcome> {
        let now = now_str();
        let existed = sqlx::query("SELECT 1 FROM protocol_blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(self.store.pool())
            .await?
            .is_some();
        sqlx::query(
            "INSERT INTO protocol_blobs (hash, value, created_at, updated_at, access_count)
             VALUES (?, ?, ?, ?, 0)
             ON CONFLICT(hash) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(hash)
        .bind(value)
        .bind(&now)
        .bind(&now)
        .execute(self.store.pool())
        .await?;
        Ok(PutOutcome { created: !existed })
    }

    /// Fetches a blob by hash, incrementing its access counter.
    pub async fn get(&self, hash: &str) -> HubResult<Option<Blob>> {
        let row = sqlx::query("SELECT hash, value, created_at, updated_at, access_count FROM protocol_blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(self.store.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };
        sqlx::query("UPDATE protocol_blobs SET access_count = access_count + 1 WHERE hash = ?")
            .bind(hash)
            .execute(self.store.pool())
            .await?;
        Ok(Some(Blob {
            hash: row.get("hash"),
            value: row.get("value"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
            access_count: row.get::<i64, _>("access_count") as u64 + 1,
        }))
    }

    /// Lists blobs ordered by `updated_at DESC`, most recently touched first.
    pub async fn list(&self, limit: i64, offset: i64) -> HubResult<Vec<Blob>> {
        let rows = sqlx::query(
            "SELECT hash, value, created_at, updated_at, access_count FROM protocol_blobs
             ORDER BY updated_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.store.pool())
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Blob {
                    hash: row.get("hash"),
                    value: row.get("value"),
                    created_at: parse_ts(&row.get::<String, _>("created_at"))?,
                    updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
                    access_count: row.get::<i64, _>("access_count") as u64,
                })
            })
            .collect()
    }

    /// Deletes every blob whose `updated_at` is older than `cutoff` and
    /// which no message content or context value still references (via a
    /// `"h":"<hash>"` substring match). Returns the number of rows deleted.
    ///
    /// A reference-count column would be a more index-friendly
    /// alternative; this LIKE-based scan is used directly rather than
    /// only as a probe,
    /// since no reference-count column exists in this schema.
    pub async fn gc_unreferenced(&self, cutoff: DateTime<Utc>) -> HubResult<u64> {
        let result = sqlx::query(
            "DELETE FROM protocol_blobs
             WHERE updated_at < ?
               AND NOT EXISTS (
                 SELECT 1 FROM messages m
                 WHERE m.content LIKE '%\"h\":\"' || protocol_blobs.hash || '\"%'
               )
               AND NOT EXISTS (
                 SELECT 1 FROM context c
                 WHERE c.value LIKE '%\"h\":\"' || protocol_blobs.hash || '\"%'
               )",
        )
        .bind(cutoff.to_rfc3339())
        .execute(self.store.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

/// Result of [`lossless_auto_encode`]: the string to actually persist, and
/// whether compression was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOutcome {
    /// The value to store (either `raw` unchanged or a `LosslessEnvelope` literal).
    pub stored_value: String,
    /// Whether compression was applied.
    pub applied: bool,
}

/// Encodes `raw` for storage, compressing into a [`LosslessEnvelope`] when
/// it is worthwhile: the payload must be at least
/// `min_payload_chars` long AND the compressed envelope must be at least
/// `min_gain_pct` percent smaller than the raw text, else the raw text is
/// stored unchanged.
pub fn lossless_auto_encode(raw: &str, min_payload_chars: usize, min_gain_pct: f64) -> EncodeOutcome {
    if raw.chars().count() < min_payload_chars {
        return EncodeOutcome { stored_value: raw.to_string(), applied: false };
    }

    let mut compressed = Vec::new();
    {
        let params = brotli::enc::BrotliEncoderParams {
            quality: BROTLI_QUALITY as i32,
            lgwin: BROTLI_LG_WINDOW as i32,
            mode: brotli::enc::BrotliEncoderMode::BROTLI_MODE_TEXT,
            ..Default::default()
        };
        let mut input = raw.as_bytes();
        brotli::BrotliCompress(&mut input, &mut compressed, &params)
            .expect("brotli compression into an in-memory buffer cannot fail");
    }
    let data = BASE64.encode(&compressed);
    let envelope = LosslessEnvelope {
        v: hub_core::LOSSLESS_ENVELOPE_VERSION.to_string(),
        alg: hub_core::LOSSLESS_ENVELOPE_ALG.to_string(),
        raw_chars: raw.chars().count() as u64,
        raw_sha256: sha256_hex(raw),
        data,
    };
    let literal = envelope.to_literal();

    let gain_pct = if raw.len() == 0 {
        0.0
    } else {
        100.0 * (1.0 - (literal.len() as f64 / raw.len() as f64))
    };

    if gain_pct >= min_gain_pct {
        EncodeOutcome { stored_value: literal, applied: true }
    } else {
        EncodeOutcome { stored_value: raw.to_string(), applied: false }
    }
}

/// Error detail for [`lossless_decode`] integrity failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("lossless envelope integrity check failed: {reason}")]
pub struct IntegrityFailure {
    /// Human-readable description of the mismatch.
    pub reason: String,
}

/// Decodes a value previously produced by [`lossless_auto_encode`].
///
/// If `stored` is not a [`LosslessEnvelope`] literal, it is returned
/// unchanged (it was never compressed). If it is an envelope but fails
/// its integrity check, the envelope string itself is returned as-is
/// alongside the failure: on mismatch, callers get the integrity
/// failure and the envelope string as-is.
pub fn lossless_decode(stored: &str) -> Result<String, (String, IntegrityFailure)> {
    let Some(envelope) = LosslessEnvelope::parse(stored) else {
        return Ok(stored.to_string());
    };

    let decode_and_check = || -> Result<String, String> {
        let compressed = BASE64.decode(&envelope.data).map_err(|e| e.to_string())?;
        let mut decompressed = Vec::new();
        let mut input = compressed.as_slice();
        brotli::BrotliDecompress(&mut input, &mut decompressed).map_err(|e| e.to_string())?;
        let raw = String::from_utf8(decompressed).map_err(|e| e.to_string())?;
        if raw.chars().count() as u64 != envelope.raw_chars {
            return Err(format!(
                "declared raw_chars {} does not match decoded length {}",
                envelope.raw_chars,
                raw.chars().count()
            ));
        }
        let actual_sha = sha256_hex(&raw);
        if actual_sha != envelope.raw_sha256 {
            return Err(format!("declared raw_sha256 {} does not match computed {actual_sha}", envelope.raw_sha256));
        }
        Ok(raw)
    };

    match decode_and_check() {
        Ok(raw) => Ok(raw),
        Err(reason) => Err((stored.to_string(), IntegrityFailure { reason })),
    }
}

impl From<IntegrityFailure> for HubError {
    fn from(f: IntegrityFailure) -> Self {
        HubError::new(ErrorCode::VotesBlobIntegrityFailed, f.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_reports_created_on_first_insert_only() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let blobs = BlobStore::new(store);
        let hash = sha256_hex("hello world");
        let first = blobs.put(&hash, "hello world").await.unwrap();
        assert!(first.created);
        let second = blobs.put(&hash, "hello world").await.unwrap();
        assert!(!second.created);
    }

    #[tokio::test]
    async fn get_increments_access_count() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let blobs = BlobStore::new(store);
        let hash = sha256_hex("payload");
        blobs.put(&hash, "payload").await.unwrap();
        let b1 = blobs.get(&hash).await.unwrap().unwrap();
        assert_eq!(b1.access_count, 1);
        let b2 = blobs.get(&hash).await.unwrap().unwrap();
        assert_eq!(b2.access_count, 2);
    }

    #[test]
    fn lossless_roundtrip_recovers_exact_bits() {
        let raw = "x".repeat(5000);
        let out = lossless_auto_encode(&raw, 256, 10.0);
        assert!(out.applied);
        let decoded = lossless_decode(&out.stored_value).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn small_payload_is_never_compressed() {
        let out = lossless_auto_encode("short", 256, 10.0);
        assert!(!out.applied);
        assert_eq!(out.stored_value, "short");
    }

    #[test]
    fn incompressible_payload_falls_back_to_raw() {
        // High-entropy-ish text that brotli at q4 won't shrink by 10%.
        let raw: String = (0..300).map(|i| char::from((b'a' + (i * 37 % 26) as u8) as char)).collect();
        let out = lossless_auto_encode(&raw, 1, 99.0);
        assert!(!out.applied);
    }

    #[test]
    fn decode_detects_tampered_envelope() {
        let raw = "y".repeat(5000);
        let out = lossless_auto_encode(&raw, 256, 10.0);
        let mut envelope = LosslessEnvelope::parse(&out.stored_value).unwrap();
        envelope.raw_sha256 = "0".repeat(64);
        let tampered = envelope.to_literal();
        let result = lossless_decode(&tampered);
        assert!(result.is_err());
    }

    #[test]
    fn decode_passes_through_non_envelope_strings() {
        assert_eq!(lossless_decode("plain text").unwrap(), "plain text");
    }
}
