use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Envelope version tag for `BlobRef`.
pub const BLOB_REF_VERSION: &str = "caep-1";
/// Envelope kind tag for `BlobRef`.
pub const BLOB_REF_KIND: &str = "blob";
/// Envelope version tag for `LosslessEnvelope`.
pub const LOSSLESS_ENVELOPE_VERSION: &str = "caep-blobz-1";
/// Compression algorithm tag for `LosslessEnvelope`.
pub const LOSSLESS_ENVELOPE_ALG: &str = "brotli-base64";

/// A pointer, embedded as a string literal inside a message or context
/// value, to a payload that actually lives in the content-addressed blob
/// store.
///
/// Serializes to the exact key order `{"v","k","h","c"}` required by
/// the required key order. Parsing is strict: any other shape, or a mismatched `v`/`k`, is
/// rejected rather than coerced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BlobRef {
    /// Envelope version, always `"caep-1"`.
    pub v: String,
    /// Envelope kind, always `"blob"`.
    pub k: String,
    /// Lowercase 64-character hex SHA-256 of the referenced payload.
    pub h: String,
    /// Declared character length of the referenced payload.
    pub c: u64,
}

impl BlobRef {
    /// Builds a well-formed envelope for `hash`/`chars`.
    pub fn new(hash: impl Into<String>, chars: u64) -> Self {
        BlobRef {
            v: BLOB_REF_VERSION.to_string(),
            k: BLOB_REF_KIND.to_string(),
            h: hash.into(),
            c: chars,
        }
    }

    /// Parses a `BlobRef` out of a raw string, returning `None` unless the
    /// shape matches exactly (`v == "caep-1"`, `k == "blob"`, `h` is 64 hex
    /// characters).
    pub fn parse(raw: &str) -> Option<BlobRef> {
        let candidate: BlobRef = serde_json::from_str(raw).ok()?;
        if candidate.v != BLOB_REF_VERSION || candidate.k != BLOB_REF_KIND {
            return None;
        }
        if candidate.h.len() != 64 || !candidate.h.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(candidate)
    }

    /// Renders the canonical JSON form of this envelope.
    pub fn to_literal(&self) -> String {
        serde_json::to_string(self).expect("BlobRef serializes infallibly")
    }

    /// Substring a reachability scan looks for inside message/context text.
    ///
    /// Mirrors the `"h":"<hash>"` probe used by blob GC.
    pub fn reachability_needle(hash: &str) -> String {
        format!("\"h\":\"{hash}\"")
    }
}

/// The compressed-at-rest representation stored inside the blob store's
/// `value` column when `LosslessAuto` decides compression is worthwhile.
///
/// Serializes to a fixed key order. Decoding verifies
/// `raw_chars` and `raw_sha256` against the recovered plaintext; callers
/// must treat any mismatch as an integrity failure rather than silently
/// accepting truncated or corrupted data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LosslessEnvelope {
    /// Envelope version, always `"caep-blobz-1"`.
    pub v: String,
    /// Compression algorithm, always `"brotli-base64"`.
    pub alg: String,
    /// Character length of the original, uncompressed payload.
    pub raw_chars: u64,
    /// SHA-256 of the original, uncompressed payload, lowercase hex.
    pub raw_sha256: String,
    /// Base64-encoded brotli-compressed payload bytes.
    pub data: String,
}

impl LosslessEnvelope {
    /// Parses a `LosslessEnvelope` out of a raw string, returning `None`
    /// unless the shape matches exactly.
    pub fn parse(raw: &str) -> Option<LosslessEnvelope> {
        let candidate: LosslessEnvelope = serde_json::from_str(raw).ok()?;
        if candidate.v != LOSSLESS_ENVELOPE_VERSION || candidate.alg != LOSSLESS_ENVELOPE_ALG {
            return None;
        }
        Some(candidate)
    }

    /// Renders the canonical JSON form of this envelope.
    pub fn to_literal(&self) -> String {
        serde_json::to_string(self).expect("LosslessEnvelope serializes infallibly")
    }
}

/// A single deduplicated entry in the content-addressed blob store.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Blob {
    /// 64-character lowercase hex SHA-256 of `value`, computed by the caller.
    pub hash: String,
    /// Stored payload; either raw text or a `LosslessEnvelope` literal.
    pub value: String,
    /// When this hash was first stored.
    pub created_at: DateTime<Utc>,
    /// Last time `put` observed this hash (bumped, not replaced, on repeat).
    pub updated_at: DateTime<Utc>,
    /// Number of times this blob has been fetched via `get`.
    pub access_count: u64,
}
