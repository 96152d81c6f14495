// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request-body field extraction and cursor/stream validation for the
//! tool-dispatch endpoint.
//!
//! Handlers receive a bare `serde_json::Value` body (the dispatch route is
//! one path for every tool, so there is no single typed request struct per
//! route). These helpers pull typed fields out of that value, mapping every
//! failure to [`ErrorCode::InvalidPayload`] so the caller gets one
//! consistent error shape regardless of which field was wrong.

use hub_error::{ErrorCode, HubError, HubResult};
use hub_watermark::Stream;
use serde_json::Value;

/// Maximum `idempotency_key` length accepted on any tool call.
pub const MAX_IDEMPOTENCY_KEY_CHARS: usize = 128;

fn missing(field: &str) -> HubError {
    HubError::new(ErrorCode::InvalidPayload, format!("missing required field `{field}`"))
}

fn wrong_type(field: &str, expected: &str) -> HubError {
    HubError::new(ErrorCode::InvalidPayload, format!("field `{field}` must be {expected}"))
}

/// Reads a required string field.
pub fn require_str<'a>(body: &'a Value, field: &str) -> HubResult<&'a str> {
    body.get(field).ok_or_else(|| missing(field))?.as_str().ok_or_else(|| wrong_type(field, "a string"))
}

/// Reads an optional string field, treating JSON `null` and absence alike.
pub fn optional_str<'a>(body: &'a Value, field: &str) -> HubResult<Option<&'a str>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_str().map(Some).ok_or_else(|| wrong_type(field, "a string")),
    }
}

/// Reads a required `i64` field.
pub fn require_i64(body: &Value, field: &str) -> HubResult<i64> {
    body.get(field).ok_or_else(|| missing(field))?.as_i64().ok_or_else(|| wrong_type(field, "an integer"))
}

/// Reads an optional `i64` field.
pub fn optional_i64(body: &Value, field: &str) -> HubResult<Option<i64>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| wrong_type(field, "an integer")),
    }
}

/// Reads an optional `u64` field.
pub fn optional_u64(body: &Value, field: &str) -> HubResult<Option<u64>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| wrong_type(field, "a non-negative integer")),
    }
}

/// Reads an optional `f64` field.
pub fn optional_f64(body: &Value, field: &str) -> HubResult<Option<f64>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| wrong_type(field, "a number")),
    }
}

/// Reads a required `f64` field.
pub fn require_f64(body: &Value, field: &str) -> HubResult<f64> {
    body.get(field).ok_or_else(|| missing(field))?.as_f64().ok_or_else(|| wrong_type(field, "a number"))
}

/// Reads an optional `bool` field, defaulting to `false`.
pub fn optional_bool(body: &Value, field: &str) -> HubResult<bool> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(v) => v.as_bool().ok_or_else(|| wrong_type(field, "a boolean")),
    }
}

/// Reads an optional array of strings, defaulting to an empty vec.
pub fn optional_str_array(body: &Value, field: &str) -> HubResult<Vec<String>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(|| wrong_type(field, "an array of strings")))
            .collect(),
        Some(_) => Err(wrong_type(field, "an array of strings")),
    }
}

/// Reads an optional array of `i64`s, defaulting to an empty vec.
pub fn optional_i64_array(body: &Value, field: &str) -> HubResult<Vec<i64>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_i64().ok_or_else(|| wrong_type(field, "an array of integers")))
            .collect(),
        Some(_) => Err(wrong_type(field, "an array of integers")),
    }
}

/// Reads an optional `limit`/`offset`-style pagination pair, clamping `limit`
/// to `[1, max_limit]` and defaulting to `(default_limit, 0)`.
pub fn pagination(body: &Value, default_limit: i64, max_limit: i64) -> HubResult<(i64, i64)> {
    let limit = optional_i64(body, "limit")?.unwrap_or(default_limit).clamp(1, max_limit);
    let offset = optional_i64(body, "offset")?.unwrap_or(0).max(0);
    Ok((limit, offset))
}

/// Validates and normalizes a caller-supplied `idempotency_key`, rejecting
/// empty or over-long values.
pub fn validate_idempotency_key(key: &str) -> HubResult<()> {
    if key.is_empty() || key.chars().count() > MAX_IDEMPOTENCY_KEY_CHARS {
        return Err(HubError::new(
            ErrorCode::InvalidPayload,
            format!("idempotency_key must be 1..={MAX_IDEMPOTENCY_KEY_CHARS} characters"),
        ));
    }
    Ok(())
}

/// Parses the `streams` field (an array of stream names) into [`Stream`]s,
/// rejecting any unrecognized name. An absent or empty array means "all
/// streams", mirroring [`Stream::ALL`].
pub fn parse_streams(body: &Value) -> HubResult<Vec<Stream>> {
    let names = optional_str_array(body, "streams")?;
    if names.is_empty() {
        return Ok(Stream::ALL.to_vec());
    }
    names
        .iter()
        .map(|name| Stream::parse(name).ok_or_else(|| HubError::new(ErrorCode::StreamsInvalid, format!("unknown stream `{name}`"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_rejects_missing_and_wrong_type() {
        let body = json!({"agent_id": "w1", "n": 3});
        assert_eq!(require_str(&body, "agent_id").unwrap(), "w1");
        assert_eq!(require_str(&body, "missing").unwrap_err().code, ErrorCode::InvalidPayload);
        assert_eq!(require_str(&body, "n").unwrap_err().code, ErrorCode::InvalidPayload);
    }

    #[test]
    fn pagination_clamps_limit_and_floors_offset() {
        let body = json!({"limit": 9999, "offset": -5});
        let (limit, offset) = pagination(&body, 100, 500).unwrap();
        assert_eq!(limit, 500);
        assert_eq!(offset, 0);
    }

    #[test]
    fn pagination_uses_defaults_when_absent() {
        let (limit, offset) = pagination(&json!({}), 100, 500).unwrap();
        assert_eq!(limit, 100);
        assert_eq!(offset, 0);
    }

    #[test]
    fn parse_streams_defaults_to_all() {
        let streams = parse_streams(&json!({})).unwrap();
        assert_eq!(streams.len(), 4);
    }

    #[test]
    fn parse_streams_rejects_unknown_name() {
        let err = parse_streams(&json!({"streams": ["messages", "bogus"]})).unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamsInvalid);
    }

    #[test]
    fn idempotency_key_rejects_empty_and_oversized() {
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key(&"x".repeat(200)).is_err());
        assert!(validate_idempotency_key("ok-key").is_ok());
    }
}
