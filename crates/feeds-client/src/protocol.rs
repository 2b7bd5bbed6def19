//! Feed wire protocol: stream frames, line framing, and JSON bodies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Item, MessageEvent};

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

pub mod frame_type {
    pub const KEEP_ALIVE: u64 = 0;
    pub const MESSAGE: u64 = 1;
    pub const END: u64 = 255;
}

pub mod grant_type {
    pub const CLIENT_CREDENTIALS: &str = "client_credentials";
    pub const REFRESH_TOKEN: &str = "refresh_token";
}

/// Custom verb used to open a feed stream.
pub const SUBSCRIBE_METHOD: &str = "SUBSCRIBE";
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Upper bound for a single unterminated line held in memory.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

fn violation(message: impl Into<String>) -> Error {
    Error::ProtocolViolation(message.into())
}

// ---------------------------------------------------------------------------
// Stream frames
// ---------------------------------------------------------------------------

/// One decoded `[type, id, headers, body]` line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    KeepAlive,
    Message(MessageEvent),
    End,
}

pub fn parse_frame(line: &str) -> Result<Frame> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| violation(format!("frame is not valid JSON: {e}")))?;
    let serde_json::Value::Array(fields) = value else {
        return Err(violation("frame is not a JSON array"));
    };
    let kind = fields
        .first()
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| violation("frame type missing or not an integer"))?;

    match kind {
        frame_type::KEEP_ALIVE => Ok(Frame::KeepAlive),
        frame_type::MESSAGE => parse_message(fields).map(Frame::Message),
        frame_type::END => Ok(Frame::End),
        other => Err(violation(format!("unknown frame type {other}"))),
    }
}

fn parse_message(fields: Vec<serde_json::Value>) -> Result<MessageEvent> {
    let mut fields = fields.into_iter().skip(1);

    let id = match fields.next() {
        Some(serde_json::Value::String(id)) => id,
        _ => return Err(violation("message frame without a string id")),
    };

    let headers = match fields.next() {
        Some(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| match value {
                serde_json::Value::String(s) => (name, s),
                other => (name, other.to_string()),
            })
            .collect(),
        Some(serde_json::Value::Null) | None => HashMap::new(),
        Some(_) => return Err(violation("message headers are not an object")),
    };

    let body = fields.next().unwrap_or(serde_json::Value::Null);

    Ok(MessageEvent { id, headers, body })
}

// ---------------------------------------------------------------------------
// Line framing
// ---------------------------------------------------------------------------

/// Splits a chunked byte stream into newline-delimited UTF-8 lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed, without the
    /// trailing `\n` / `\r\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self
            .pending
            .get(from..)
            .and_then(|rest| rest.iter().position(|b| *b == b'\n'))
        {
            let end = from + offset;
            let line = self.pending.get(start..end).unwrap_or_default();
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let line = std::str::from_utf8(line)
                .map_err(|e| violation(format!("line is not UTF-8: {e}")))?;
            lines.push(line.to_string());
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();

        if self.pending.len() > MAX_LINE_BYTES {
            return Err(violation(format!(
                "line exceeds {MAX_LINE_BYTES} bytes without a newline"
            )));
        }
        Ok(lines)
    }

    /// Bytes received after the last complete line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// JSON bodies
// ---------------------------------------------------------------------------

/// Token endpoint response for both grant types.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Some servers omit this on refresh; the previous one stays valid.
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// `GET /feeds/{name}` response. Items are newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub next_id: Option<String>,
}

/// `POST /feeds/{name}` body.
#[derive(Debug, Serialize)]
pub struct AppendRequest<'a> {
    pub items: &'a [Item],
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_message_frame() {
        let frame = parse_frame(r#"[1, "42", {"trace": "abc"}, {"x": 1}]"#).unwrap();
        let Frame::Message(msg) = frame else {
            panic!("expected message, got {frame:?}");
        };
        assert_eq!(msg.id, "42");
        assert_eq!(msg.headers.get("trace").map(String::as_str), Some("abc"));
        assert_eq!(msg.body, serde_json::json!({"x": 1}));
    }

    #[test]
    fn parse_keep_alive_with_short_array() {
        assert_eq!(parse_frame("[0]").unwrap(), Frame::KeepAlive);
        assert_eq!(parse_frame(r#"[0, "", {}, null]"#).unwrap(), Frame::KeepAlive);
    }

    #[test]
    fn parse_end_frame() {
        assert_eq!(parse_frame(r#"[255, "", {}, null]"#).unwrap(), Frame::End);
    }

    #[test]
    fn unknown_frame_type_is_violation() {
        let err = parse_frame(r#"[7, "1", {}, null]"#).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(ref m) if m.contains("7")));
    }

    #[test]
    fn non_array_and_garbage_are_violations() {
        assert!(matches!(
            parse_frame(r#"{"type": 1}"#),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(parse_frame("not json"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(parse_frame("[]"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(
            parse_frame(r#"["1", "2", {}, null]"#),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn message_without_string_id_is_violation() {
        assert!(matches!(
            parse_frame(r#"[1, 42, {}, null]"#),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(parse_frame("[1]"), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn message_headers_tolerate_null_and_non_string_values() {
        let Frame::Message(msg) = parse_frame(r#"[1, "1", null]"#).unwrap() else {
            panic!("expected message");
        };
        assert!(msg.headers.is_empty());
        assert_eq!(msg.body, serde_json::Value::Null);

        let Frame::Message(msg) = parse_frame(r#"[1, "2", {"n": 5}, "b"]"#).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(msg.headers.get("n").map(String::as_str), Some("5"));
    }

    #[test]
    fn line_buffer_splits_across_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"[1, \"1\"").unwrap().is_empty());
        let lines = buf.push(b", {}, null]\n[0]\r\n[255").unwrap();
        assert_eq!(lines, vec![r#"[1, "1", {}, null]"#.to_string(), "[0]".to_string()]);
        assert_eq!(buf.pending_len(), 4);
        assert_eq!(buf.push(b"]\n").unwrap(), vec!["[255]".to_string()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn line_buffer_long_line_in_small_chunks() {
        let mut buf = LineBuffer::default();
        let body = "x".repeat(10_000);
        for byte in body.as_bytes().chunks(3) {
            assert!(buf.push(byte).unwrap().is_empty());
        }
        assert_eq!(buf.pending_len(), 10_000);

        let lines = buf.push(b"\r\n[0]\n").unwrap();
        assert_eq!(lines, vec![body, "[0]".to_string()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn line_buffer_rejects_oversized_line() {
        let mut buf = LineBuffer::default();
        let chunk = vec![b'x'; MAX_LINE_BYTES / 2];
        assert!(buf.push(&chunk).unwrap().is_empty());
        assert!(buf.push(&chunk).unwrap().is_empty());
        assert!(matches!(buf.push(b"x"), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn line_buffer_rejects_invalid_utf8() {
        let mut buf = LineBuffer::default();
        assert!(matches!(
            buf.push(&[0xff, 0xfe, b'\n']),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn token_response_without_refresh_token() {
        let json = r#"{"access_token": "a", "expires_in": 3600, "token_type": "bearer"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "a");
        assert!(token.refresh_token.is_none());
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn fetch_response_with_null_next_id() {
        let json = r#"{"items": [{"id": "2", "data": "b"}, {"id": "1", "data": "a"}], "next_id": null}"#;
        let resp: FetchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.items.len(), 2);
        assert!(resp.next_id.is_none());
    }

    #[test]
    fn append_request_shape() {
        let items = vec![Item::new(serde_json::json!({"x": 1}))];
        let json = serde_json::to_value(AppendRequest { items: &items }).unwrap();
        assert_eq!(json, serde_json::json!({"items": [{"data": {"x": 1}}]}));
    }
}
