//! Opaque pagination cursors.
//!
//! Three distinct grammars share the name "cursor":
//! message cursors, task cursors, and the four-part watermark cursor used
//! by `wait_for_updates` and the SSE stream. Each has its own strict
//! parser; none accept a shape other than their own.

use chrono::{DateTime, TimeZone, Utc};
use hub_error::{ErrorCode, HubError, HubResult};

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn encode_base36(mut value: i64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let negative = value < 0;
    if negative {
        value = -value;
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    if negative {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 digits are ASCII")
}

fn decode_base36(raw: &str) -> Option<i64> {
    if raw.is_empty() {
        return None;
    }
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value: i64 = 0;
    for b in digits.bytes() {
        let d = (b as char).to_digit(36)? as i64;
        value = value.checked_mul(36)?.checked_add(d)?;
    }
    Some(if negative { -value } else { value })
}

/// A `"<created_at>:<id>"` cursor over the messages stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCursor {
    /// Unix-millisecond timestamp component.
    pub created_at_ms: i64,
    /// Message id component, used to break ties at equal timestamps.
    pub id: i64,
}

impl MessageCursor {
    /// Formats this cursor as `"<created_at>:<id>"`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.created_at_ms, self.id)
    }

    /// Parses a `"<created_at>:<id>"` cursor, rejecting any other shape.
    pub fn parse(raw: &str) -> HubResult<MessageCursor> {
        let (ts, id) = raw
            .split_once(':')
            .ok_or_else(|| HubError::new(ErrorCode::CursorInvalid, "message cursor must be '<created_at>:<id>'"))?;
        let created_at_ms: i64 = ts
            .parse()
            .map_err(|_| HubError::new(ErrorCode::CursorInvalid, "message cursor timestamp is not an integer"))?;
        let id: i64 = id
            .parse()
            .map_err(|_| HubError::new(ErrorCode::CursorInvalid, "message cursor id is not an integer"))?;
        Ok(MessageCursor { created_at_ms, id })
    }

    /// The timestamp component as a `DateTime<Utc>`.
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.created_at_ms).single().unwrap_or_else(Utc::now)
    }
}

/// A `"<updated_at>:<id>"` cursor over the tasks stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCursor {
    /// Unix-millisecond timestamp component.
    pub updated_at_ms: i64,
    /// Task id component, used to break ties at equal timestamps.
    pub id: i64,
}

impl TaskCursor {
    /// Formats this cursor as `"<updated_at>:<id>"`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.updated_at_ms, self.id)
    }

    /// Parses a `"<updated_at>:<id>"` cursor, rejecting any other shape.
    pub fn parse(raw: &str) -> HubResult<TaskCursor> {
        let (ts, id) = raw
            .split_once(':')
            .ok_or_else(|| HubError::new(ErrorCode::CursorInvalid, "task cursor must be '<updated_at>:<id>'"))?;
        let updated_at_ms: i64 = ts
            .parse()
            .map_err(|_| HubError::new(ErrorCode::CursorInvalid, "task cursor timestamp is not an integer"))?;
        let id: i64 = id
            .parse()
            .map_err(|_| HubError::new(ErrorCode::CursorInvalid, "task cursor id is not an integer"))?;
        Ok(TaskCursor { updated_at_ms, id })
    }

    /// The timestamp component as a `DateTime<Utc>`.
    pub fn updated_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.updated_at_ms).single().unwrap_or_else(Utc::now)
    }
}

/// A four-part `"<msg>.<task>.<ctx>.<activity>"` watermark cursor, each
/// component a base-36 integer, used by `wait_for_updates` and `/events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Messages watermark component.
    pub messages: i64,
    /// Tasks watermark component.
    pub tasks: i64,
    /// Context watermark component.
    pub context: i64,
    /// Activity log watermark component.
    pub activity: i64,
}

impl Cursor {
    /// The zero cursor, ordered before any real watermark value.
    pub const ZERO: Cursor = Cursor { messages: 0, tasks: 0, context: 0, activity: 0 };

    /// Formats this cursor as `"<msg_b36>.<task_b36>.<ctx_b36>.<activity_b36>"`.
    pub fn encode(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            encode_base36(self.messages),
            encode_base36(self.tasks),
            encode_base36(self.context),
            encode_base36(self.activity),
        )
    }

    /// Parses a four-part base-36 watermark cursor, rejecting any other shape.
    pub fn parse(raw: &str) -> HubResult<Cursor> {
        let parts: Vec<&str> = raw.split('.').collect();
        let [m, t, c, a]: [&str; 4] = parts
            .try_into()
            .map_err(|_| HubError::new(ErrorCode::CursorInvalid, "watermark cursor must have exactly four dot-separated parts"))?;
        let decode_part = |label: &str, part: &str| {
            decode_base36(part).ok_or_else(|| {
                HubError::new(ErrorCode::CursorInvalid, format!("watermark cursor '{label}' component is not base-36"))
            })
        };
        Ok(Cursor {
            messages: decode_part("messages", m)?,
            tasks: decode_part("tasks", t)?,
            context: decode_part("context", c)?,
            activity: decode_part("activity", a)?,
        })
    }

    /// True if `self` reflects at least as much progress as `other` on every
    /// stream — the monotonicity property `wait_for_updates` relies on.
    pub fn advanced_over(&self, other: &Cursor) -> bool {
        self.messages >= other.messages
            && self.tasks >= other.tasks
            && self.context >= other.context
            && self.activity >= other.activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_cursor_round_trips() {
        let c = MessageCursor { created_at_ms: 1_700_000_000_123, id: 42 };
        assert_eq!(MessageCursor::parse(&c.encode()).unwrap(), c);
    }

    #[test]
    fn task_cursor_rejects_malformed_shape() {
        assert!(TaskCursor::parse("not-a-cursor").is_err());
        assert!(TaskCursor::parse("123:abc").is_err());
    }

    #[test]
    fn watermark_cursor_round_trips_through_base36() {
        let c = Cursor { messages: 123456, tasks: 0, context: 999, activity: 1 };
        let encoded = c.encode();
        assert_eq!(Cursor::parse(&encoded).unwrap(), c);
    }

    #[test]
    fn watermark_cursor_rejects_wrong_part_count() {
        assert!(Cursor::parse("1.2.3").is_err());
        assert!(Cursor::parse("1.2.3.4.5").is_err());
    }

    #[test]
    fn watermark_cursor_rejects_non_base36_component() {
        assert!(Cursor::parse("1.2.3.!!").is_err());
    }

    #[test]
    fn base36_round_trips_zero_and_large_values() {
        for v in [0i64, 1, 35, 36, 999_999_999, i64::from(u32::MAX)] {
            assert_eq!(decode_base36(&encode_base36(v)), Some(v));
        }
    }
}
