//! PostgreSQL frontend/backend engine (§4.1.2).
//!
//! Wire framing: a one-byte type tag then a big-endian 4-byte total length
//! (excluding the tag). The startup message is the sole exception: it has
//! no tag and begins with a 4-byte length followed by the protocol version.

use crate::common::{hex_prefix, parse_error_op, ParsedOp, ParsedResponse};
use crate::error::{ProtocolError, ProtocolResult};
use sniffler_core::{model::OperationType, Mock};

const STARTUP_PROTOCOL_V3: i32 = 196_608;

/// Per-connection state the interceptor runtime owns and threads through
/// successive calls: whether the initial startup message has already been
/// consumed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientState {
    /// True once the startup packet has been seen on this connection.
    pub startup_done: bool,
}

/// Decode the startup message: 4-byte length, 4-byte protocol version,
/// then null-terminated key/value pairs ending in a final `\0`.
fn decode_startup(buf: &[u8]) -> ProtocolResult<Option<(ParsedOp, usize)>> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < 8 || len > 1 << 20 {
        return Err(ProtocolError::Malformed {
            message: format!("implausible startup length {len}"),
        });
    }
    if buf.len() < len {
        return Ok(None);
    }
    let version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let op = ParsedOp {
        fingerprint: "CONNECTION startup".to_string(),
        op_type: OperationType::Connection,
        params: serde_json::json!({ "protocol_version": version }),
        request_id: None,
        is_auth: true,
    };
    Ok(Some((op, len)))
}

fn tag_to_op_type(sql: &str) -> OperationType {
    sniffler_core::fingerprint::classify_sql(&sniffler_core::fingerprint::sql(sql))
}

fn c_string(buf: &[u8]) -> ProtocolResult<(&str, usize)> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProtocolError::Malformed {
            message: "unterminated C-string".to_string(),
        })?;
    let s = std::str::from_utf8(&buf[..nul]).map_err(|e| ProtocolError::Malformed {
        message: format!("invalid utf-8: {e}"),
    })?;
    Ok((s, nul + 1))
}

/// Decode one tagged client frame starting at `buf[0]`.
fn decode_tagged_client(buf: &[u8]) -> ProtocolResult<Option<(ParsedOp, usize)>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len < 4 || len > 64 * 1024 * 1024 {
        return Err(ProtocolError::Malformed {
            message: format!("implausible message length {len} for tag {tag}"),
        });
    }
    let total = 1 + len;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = &buf[5..total];

    let op = match tag {
        b'Q' => {
            let (sql, _) = c_string(payload)?;
            let fingerprint = sniffler_core::fingerprint::sql(sql);
            ParsedOp {
                op_type: tag_to_op_type(sql),
                fingerprint,
                params: serde_json::json!({ "sql": sql }),
                request_id: None,
                is_auth: false,
            }
        }
        b'P' => {
            let (stmt_name, consumed) = c_string(payload)?;
            let (sql, _) = c_string(&payload[consumed..])?;
            let fingerprint = sniffler_core::fingerprint::sql(sql);
            ParsedOp {
                op_type: tag_to_op_type(sql),
                fingerprint,
                params: serde_json::json!({ "statement": stmt_name, "sql": sql }),
                request_id: None,
                is_auth: false,
            }
        }
        b'B' => ParsedOp {
            fingerprint: "CONNECTION bind".to_string(),
            op_type: OperationType::Connection,
            params: serde_json::json!({ "raw_len": payload.len() }),
            request_id: None,
            is_auth: true,
        },
        b'E' => ParsedOp {
            fingerprint: "CONNECTION execute".to_string(),
            op_type: OperationType::Connection,
            params: serde_json::json!({}),
            request_id: None,
            is_auth: true,
        },
        b'S' => ParsedOp {
            fingerprint: "CONNECTION sync".to_string(),
            op_type: OperationType::Connection,
            params: serde_json::json!({}),
            request_id: None,
            is_auth: true,
        },
        b'X' => ParsedOp {
            fingerprint: "CONNECTION terminate".to_string(),
            op_type: OperationType::Connection,
            params: serde_json::json!({}),
            request_id: None,
            is_auth: true,
        },
        _ => ParsedOp {
            fingerprint: format!("CONNECTION {}", tag as char),
            op_type: OperationType::Connection,
            params: serde_json::json!({}),
            request_id: None,
            is_auth: true,
        },
    };
    Ok(Some((op, total)))
}

/// Parse as many complete client frames as `buf` contains, leaving any
/// trailing partial frame for the next call.
pub fn parse_client(buf: &[u8], state: &mut ClientState) -> (Vec<ParsedOp>, usize) {
    let mut ops = Vec::new();
    let mut offset = 0;

    if !state.startup_done {
        match decode_startup(&buf[offset..]) {
            Ok(Some((op, consumed))) => {
                ops.push(op);
                offset += consumed;
                state.startup_done = true;
            }
            Ok(None) => return (ops, offset),
            Err(_) => {
                ops.push(parse_error_op(&buf[offset..]));
                return (ops, buf.len());
            }
        }
    }

    loop {
        match decode_tagged_client(&buf[offset..]) {
            Ok(Some((op, consumed))) => {
                ops.push(op);
                offset += consumed;
            }
            Ok(None) => break,
            Err(_) => {
                ops.push(parse_error_op(&buf[offset..]));
                // Resynchronize at the next byte; without a reliable frame
                // boundary the safest recovery point is +1.
                offset += 1;
                if offset >= buf.len() {
                    break;
                }
            }
        }
    }
    (ops, offset)
}

/// Parse as many complete server frames as `buf` contains.
pub fn parse_server(buf: &[u8]) -> (Vec<ParsedResponse>, usize) {
    let mut responses = Vec::new();
    let mut offset = 0;

    loop {
        let remaining = &buf[offset..];
        if remaining.len() < 5 {
            break;
        }
        let tag = remaining[0];
        let len = u32::from_be_bytes([remaining[1], remaining[2], remaining[3], remaining[4]]) as usize;
        if len < 4 || len > 64 * 1024 * 1024 {
            responses.push(ParsedResponse {
                payload: serde_json::json!({ "parse_error": hex_prefix(remaining) }),
                is_error: true,
                response_to: None,
            });
            offset += 1;
            continue;
        }
        let total = 1 + len;
        if remaining.len() < total {
            break;
        }
        let payload = &remaining[5..total];

        match tag {
            b'Z' => responses.push(ParsedResponse {
                payload: serde_json::json!({ "type": "ready_for_query", "status": payload.first().map(|b| *b as char) }),
                is_error: false,
                response_to: None,
            }),
            b'C' => {
                let tag_str = std::str::from_utf8(payload).unwrap_or("").trim_end_matches('\0').to_string();
                responses.push(ParsedResponse {
                    payload: serde_json::json!({ "type": "command_complete", "tag": tag_str }),
                    is_error: false,
                    response_to: None,
                });
            }
            b'T' => responses.push(ParsedResponse {
                payload: serde_json::json!({ "type": "row_description" }),
                is_error: false,
                response_to: None,
            }),
            b'D' => responses.push(ParsedResponse {
                payload: serde_json::json!({ "type": "data_row" }),
                is_error: false,
                response_to: None,
            }),
            b'E' => {
                let fields = decode_error_fields(payload);
                responses.push(ParsedResponse {
                    payload: serde_json::json!({ "type": "error", "fields": fields }),
                    is_error: true,
                    response_to: None,
                });
            }
            _ => responses.push(ParsedResponse {
                payload: serde_json::json!({ "type": "other", "tag": (tag as char).to_string() }),
                is_error: false,
                response_to: None,
            }),
        }
        offset += total;
    }
    (responses, offset)
}

fn decode_error_fields(payload: &[u8]) -> serde_json::Value {
    let mut fields = serde_json::Map::new();
    let mut i = 0;
    while i < payload.len() && payload[i] != 0 {
        let code = payload[i] as char;
        let start = i + 1;
        if let Some(nul) = payload[start..].iter().position(|&b| b == 0) {
            let value = String::from_utf8_lossy(&payload[start..start + nul]).to_string();
            fields.insert(code.to_string(), serde_json::Value::String(value));
            i = start + nul + 1;
        } else {
            break;
        }
    }
    serde_json::Value::Object(fields)
}

fn command_tag_for(op_type: OperationType, row_count: usize) -> String {
    match op_type {
        OperationType::Select | OperationType::Find | OperationType::Read => format!("SELECT {row_count}"),
        OperationType::Insert => "INSERT 0 1".to_string(),
        OperationType::Update => "UPDATE 1".to_string(),
        OperationType::Delete => "DELETE 1".to_string(),
        _ => "OK".to_string(),
    }
}

fn write_message(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Synthesize an on-wire response frame set for `mock` (§4.1.2 synthesis).
/// `mock.response` is expected to be `{"rows": [...], "error": null}` or
/// `{"error": {"severity": ..., "code": ..., "message": ...}}`.
pub fn synthesize_response(mock: &Mock, op_type: OperationType) -> Vec<u8> {
    let mut out = Vec::new();

    if let Some(error) = mock.response.get("error").filter(|e| !e.is_null()) {
        let severity = error.get("severity").and_then(|v| v.as_str()).unwrap_or("ERROR");
        let code = error.get("code").and_then(|v| v.as_str()).unwrap_or("XX000");
        let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("mocked error");
        let mut payload = Vec::new();
        payload.push(b'S');
        payload.extend_from_slice(severity.as_bytes());
        payload.push(0);
        payload.push(b'C');
        payload.extend_from_slice(code.as_bytes());
        payload.push(0);
        payload.push(b'M');
        payload.extend_from_slice(message.as_bytes());
        payload.push(0);
        payload.push(0);
        write_message(&mut out, b'E', &payload);
        write_message(&mut out, b'Z', b"I");
        return out;
    }

    let rows = mock.response.get("rows").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let columns: Vec<String> = rows
        .first()
        .and_then(|r| r.as_object())
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default();

    let mut row_desc = Vec::new();
    row_desc.extend_from_slice(&(columns.len() as u16).to_be_bytes());
    for name in &columns {
        row_desc.extend_from_slice(name.as_bytes());
        row_desc.push(0);
        row_desc.extend_from_slice(&0u32.to_be_bytes()); // table OID
        row_desc.extend_from_slice(&0u16.to_be_bytes()); // column attnum
        row_desc.extend_from_slice(&25u32.to_be_bytes()); // type OID (text)
        row_desc.extend_from_slice(&(-1i16).to_be_bytes()); // type len
        row_desc.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        row_desc.extend_from_slice(&0u16.to_be_bytes()); // format code (text)
    }
    if !columns.is_empty() {
        write_message(&mut out, b'T', &row_desc);
    }

    for row in &rows {
        let mut data = Vec::new();
        data.extend_from_slice(&(columns.len() as u16).to_be_bytes());
        for col in &columns {
            let value = row.get(col);
            match value {
                None | Some(serde_json::Value::Null) => {
                    data.extend_from_slice(&(-1i32).to_be_bytes());
                }
                Some(v) => {
                    let text = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    data.extend_from_slice(&(text.len() as i32).to_be_bytes());
                    data.extend_from_slice(text.as_bytes());
                }
            }
        }
        write_message(&mut out, b'D', &data);
    }

    let tag = command_tag_for(op_type, rows.len());
    let mut tag_bytes = tag.into_bytes();
    tag_bytes.push(0);
    write_message(&mut out, b'C', &tag_bytes);
    write_message(&mut out, b'Z', b"I");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn startup_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        let body = b"user\0alice\0\0";
        let len = 4 + 4 + body.len();
        buf.extend_from_slice(&(len as u32).to_be_bytes());
        buf.extend_from_slice(&STARTUP_PROTOCOL_V3.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    fn simple_query(sql: &str) -> Vec<u8> {
        let mut payload = sql.as_bytes().to_vec();
        payload.push(0);
        let mut buf = vec![b'Q'];
        buf.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    #[test]
    fn parses_startup_then_simple_query() {
        let mut buf = startup_bytes();
        buf.extend_from_slice(&simple_query("SELECT 1"));
        let mut state = ClientState::default();
        let (ops, consumed) = parse_client(&buf, &mut state);
        assert_eq!(consumed, buf.len());
        assert_eq!(ops.len(), 2);
        assert!(state.startup_done);
        assert_eq!(ops[1].fingerprint, "select 1");
        assert_eq!(ops[1].op_type, OperationType::Select);
    }

    #[test]
    fn partial_frame_across_n_chunks_matches_single_chunk() {
        let full = simple_query("SELECT 1");
        let mut state_whole = ClientState { startup_done: true };
        let (ops_whole, _) = parse_client(&full, &mut state_whole);

        let mut state_chunked = ClientState { startup_done: true };
        let mut buf = Vec::new();
        let mut ops_chunked = Vec::new();
        for chunk in full.chunks(3) {
            buf.extend_from_slice(chunk);
            let (mut ops, consumed) = parse_client(&buf, &mut state_chunked);
            ops_chunked.append(&mut ops);
            buf.drain(..consumed);
        }
        assert_eq!(ops_whole, ops_chunked);
    }

    #[test]
    fn parse_server_ready_for_query_and_command_complete() {
        let mut buf = Vec::new();
        write_message(&mut buf, b'C', b"SELECT 1\0");
        write_message(&mut buf, b'Z', b"I");
        let (responses, consumed) = parse_server(&buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(responses.len(), 2);
        assert!(!responses[0].is_error);
    }

    #[test]
    fn synthesize_select_row() {
        let mock = Mock::new(
            "m1".into(),
            5432,
            "select 1".into(),
            serde_json::json!({ "rows": [{"col": 1}] }),
            true,
        );
        let bytes = synthesize_response(&mock, OperationType::Select);
        let (responses, consumed) = parse_server(&bytes);
        assert_eq!(consumed, bytes.len());
        assert!(responses.iter().any(|r| r.payload["type"] == "row_description"));
        assert!(responses.iter().any(|r| r.payload["type"] == "command_complete"));
    }

    #[test]
    fn synthesize_error() {
        let mock = Mock::new(
            "m2".into(),
            5432,
            "select boom".into(),
            serde_json::json!({ "error": {"severity": "ERROR", "code": "42601", "message": "syntax error"} }),
            true,
        );
        let bytes = synthesize_response(&mock, OperationType::Select);
        let (responses, _) = parse_server(&bytes);
        assert!(responses[0].is_error);
    }
}
