//! Redis RESP engine (§4.1.6).

use crate::common::{ParsedOp, ParsedResponse};
use crate::error::{ProtocolError, ProtocolResult};
use sniffler_core::{model::OperationType, Mock};

/// A decoded RESP value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:123\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`, or `None` for `$-1\r\n`.
    Bulk(Option<Vec<u8>>),
    /// `*2\r\n...`, or `None` for `*-1\r\n`.
    Array(Option<Vec<RespValue>>),
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decode one RESP value from `buf`, returning `Ok(None)` if more bytes are
/// needed.
pub fn decode(buf: &[u8]) -> ProtocolResult<Option<(RespValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    match buf[0] {
        b'+' | b'-' | b':' => {
            let Some(end) = find_crlf(buf) else { return Ok(None) };
            let text = std::str::from_utf8(&buf[1..end])
                .map_err(|e| ProtocolError::Malformed { message: e.to_string() })?
                .to_string();
            let value = match buf[0] {
                b'+' => RespValue::Simple(text),
                b'-' => RespValue::Error(text),
                b':' => RespValue::Integer(text.parse().map_err(|_| ProtocolError::Malformed {
                    message: format!("invalid integer: {text}"),
                })?),
                _ => unreachable!(),
            };
            Ok(Some((value, end + 2)))
        }
        b'$' => {
            let Some(end) = find_crlf(buf) else { return Ok(None) };
            let len: i64 = std::str::from_utf8(&buf[1..end])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Malformed { message: "invalid bulk length".into() })?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), end + 2)));
            }
            let data_start = end + 2;
            let data_end = data_start + len as usize;
            if buf.len() < data_end + 2 {
                return Ok(None);
            }
            Ok(Some((RespValue::Bulk(Some(buf[data_start..data_end].to_vec())), data_end + 2)))
        }
        b'*' => {
            let Some(end) = find_crlf(buf) else { return Ok(None) };
            let count: i64 = std::str::from_utf8(&buf[1..end])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Malformed { message: "invalid array length".into() })?;
            if count < 0 {
                return Ok(Some((RespValue::Array(None), end + 2)));
            }
            let mut offset = end + 2;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match decode(&buf[offset..])? {
                    Some((value, consumed)) => {
                        items.push(value);
                        offset += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), offset)))
        }
        _ => decode_inline(buf),
    }
}

/// Inline-command fallback: space-separated ASCII up to CRLF, for test
/// fixtures that don't speak full RESP.
fn decode_inline(buf: &[u8]) -> ProtocolResult<Option<(RespValue, usize)>> {
    let Some(end) = find_crlf(buf) else { return Ok(None) };
    let line = std::str::from_utf8(&buf[..end]).map_err(|e| ProtocolError::Malformed { message: e.to_string() })?;
    let parts: Vec<RespValue> = line
        .split_whitespace()
        .map(|p| RespValue::Bulk(Some(p.as_bytes().to_vec())))
        .collect();
    Ok(Some((RespValue::Array(Some(parts)), end + 2)))
}

fn encode(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(i) => {
            out.extend_from_slice(format!(":{i}\r\n").as_bytes());
        }
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Bulk(Some(data)) => {
            out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        RespValue::Array(Some(items)) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode(item, out);
            }
        }
    }
}

fn classify_verb(verb: &str) -> OperationType {
    match verb.to_ascii_uppercase().as_str() {
        "GET" | "MGET" | "EXISTS" | "STRLEN" | "TTL" | "KEYS" | "SCAN" => OperationType::Read,
        "SET" | "MSET" | "DEL" | "INCR" | "DECR" | "EXPIRE" | "APPEND" | "LPUSH" | "RPUSH" => OperationType::Write,
        "MULTI" | "EXEC" | "DISCARD" | "WATCH" => OperationType::Connection,
        "SUBSCRIBE" | "PUBLISH" | "UNSUBSCRIBE" => OperationType::Connection,
        "PING" | "AUTH" | "HELLO" | "SELECT" | "CLIENT" => OperationType::Connection,
        "CONFIG" | "INFO" | "FLUSHALL" | "FLUSHDB" => OperationType::Server,
        _ => OperationType::Read,
    }
}

fn bulk_as_string(v: &RespValue) -> Option<String> {
    match v {
        RespValue::Bulk(Some(bytes)) => Some(String::from_utf8_lossy(bytes).to_string()),
        RespValue::Simple(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse as many complete client commands as `buf` contains.
pub fn parse_client(buf: &[u8]) -> (Vec<ParsedOp>, usize) {
    let mut ops = Vec::new();
    let mut offset = 0;

    loop {
        match decode(&buf[offset..]) {
            Ok(Some((value, consumed))) => {
                if let RespValue::Array(Some(items)) = &value {
                    let strings: Vec<String> = items.iter().filter_map(bulk_as_string).collect();
                    if let Some((verb, args)) = strings.split_first() {
                        ops.push(ParsedOp {
                            fingerprint: sniffler_core::fingerprint::redis(verb, args),
                            op_type: classify_verb(verb),
                            params: serde_json::json!({ "verb": verb, "args": args }),
                            request_id: None,
                            is_auth: matches!(verb.to_ascii_uppercase().as_str(), "AUTH" | "HELLO"),
                        });
                    }
                }
                offset += consumed;
            }
            Ok(None) => break,
            Err(_) => {
                ops.push(crate::common::parse_error_op(&buf[offset..]));
                offset += 1;
                if offset >= buf.len() {
                    break;
                }
            }
        }
    }
    (ops, offset)
}

/// Parse as many complete server replies as `buf` contains.
pub fn parse_server(buf: &[u8]) -> (Vec<ParsedResponse>, usize) {
    let mut responses = Vec::new();
    let mut offset = 0;
    loop {
        match decode(&buf[offset..]) {
            Ok(Some((value, consumed))) => {
                let is_error = matches!(value, RespValue::Error(_));
                responses.push(ParsedResponse {
                    payload: resp_to_json(&value),
                    is_error,
                    response_to: None,
                });
                offset += consumed;
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    (responses, offset)
}

fn resp_to_json(value: &RespValue) -> serde_json::Value {
    match value {
        RespValue::Simple(s) => serde_json::json!({ "type": "simple", "value": s }),
        RespValue::Error(s) => serde_json::json!({ "type": "error", "value": s }),
        RespValue::Integer(i) => serde_json::json!({ "type": "integer", "value": i }),
        RespValue::Bulk(None) => serde_json::json!({ "type": "bulk", "value": null }),
        RespValue::Bulk(Some(b)) => serde_json::json!({ "type": "bulk", "value": String::from_utf8_lossy(b) }),
        RespValue::Array(None) => serde_json::json!({ "type": "array", "value": null }),
        RespValue::Array(Some(items)) => serde_json::json!({ "type": "array", "value": items.iter().map(resp_to_json).collect::<Vec<_>>() }),
    }
}

/// Synthesize a RESP reply for `mock` (§4.1.6 synthesis). `mock.response`
/// is a typed JSON value: `{"type": "string"|"number"|"null"|"array"|"error", "value": ...}`.
pub fn synthesize_response(mock: &Mock) -> Vec<u8> {
    let value = json_to_resp(&mock.response);
    let mut out = Vec::new();
    encode(&value, &mut out);
    out
}

fn json_to_resp(value: &serde_json::Value) -> RespValue {
    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("bulk");
    match kind {
        "error" => RespValue::Error(value.get("value").and_then(|v| v.as_str()).unwrap_or("ERR mocked error").to_string()),
        "number" => RespValue::Integer(value.get("value").and_then(|v| v.as_i64()).unwrap_or(0)),
        "null" => RespValue::Bulk(None),
        "array" => RespValue::Array(Some(
            value
                .get("value")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .map(json_to_resp)
                .collect(),
        )),
        _ => match value.get("value") {
            Some(serde_json::Value::String(s)) => RespValue::Bulk(Some(s.as_bytes().to_vec())),
            Some(serde_json::Value::Null) | None => RespValue::Bulk(None),
            Some(other) => RespValue::Bulk(Some(other.to_string().into_bytes())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_command_array() {
        let buf = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let (ops, consumed) = parse_client(buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(ops[0].fingerprint, "GET foo");
        assert_eq!(ops[0].op_type, OperationType::Read);
    }

    #[test]
    fn null_bulk_roundtrips() {
        let buf = b"$-1\r\n";
        let (value, consumed) = decode(buf).unwrap().unwrap();
        assert_eq!(value, RespValue::Bulk(None));
        assert_eq!(consumed, buf.len());
        let mut out = Vec::new();
        encode(&value, &mut out);
        assert_eq!(out, buf);
    }

    #[test]
    fn inline_command_fallback() {
        let buf = b"PING\r\n";
        let (ops, consumed) = parse_client(buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(ops[0].fingerprint, "PING");
    }

    #[test]
    fn partial_delivery_in_n_chunks() {
        let full: &[u8] = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let (ops_whole, _) = parse_client(full);

        let mut buf = Vec::new();
        let mut ops_chunked = Vec::new();
        for chunk in full.chunks(4) {
            buf.extend_from_slice(chunk);
            let (mut ops, consumed) = parse_client(&buf);
            ops_chunked.append(&mut ops);
            buf.drain(..consumed);
        }
        assert_eq!(ops_whole, ops_chunked);
    }

    #[test]
    fn synthesize_string_value() {
        let mock = Mock::new(
            "m1".into(),
            6379,
            "GET foo".into(),
            serde_json::json!({ "type": "string", "value": "bar" }),
            true,
        );
        let bytes = synthesize_response(&mock);
        assert_eq!(bytes, b"$3\r\nbar\r\n");
    }
}
