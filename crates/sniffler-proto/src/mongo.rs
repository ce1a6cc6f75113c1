//! MongoDB wire protocol engine (§4.1.5).
//!
//! Framing: 16-byte header (length, requestId, responseTo, opcode) followed
//! by an opcode-specific body. Only `OP_MSG` (2013) is interpreted; legacy
//! opcodes are treated as auth/connection traffic and forwarded unmocked.

use crate::bson;
use crate::common::{ParsedOp, ParsedResponse};
use crate::error::{ProtocolError, ProtocolResult};
use sniffler_core::{model::OperationType, Mock};

const OP_MSG: i32 = 2013;
const HEADER_LEN: usize = 16;

const AUTH_COMMANDS: &[&str] = &["ismaster", "hello", "saslstart", "saslcontinue", "authenticate", "getnonce", "buildinfo"];

struct Header {
    length: usize,
    request_id: u32,
    response_to: u32,
    opcode: i32,
}

fn read_header(buf: &[u8]) -> Option<Header> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let length = i32::from_le_bytes(buf[0..4].try_into().unwrap());
    if length < HEADER_LEN as i32 {
        return None;
    }
    Some(Header {
        length: length as usize,
        request_id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        response_to: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        opcode: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
    })
}

/// OP_MSG body is flag bits (u32) followed by one or more sections. Returns
/// the merged kind-0 body document plus any kind-1 document-sequence docs.
fn decode_op_msg_body(body: &[u8]) -> ProtocolResult<serde_json::Value> {
    if body.len() < 4 {
        return Err(ProtocolError::Incomplete { needed: 4, have: body.len() });
    }
    let mut offset = 4; // flag bits
    let mut merged = serde_json::Map::new();

    while offset < body.len() {
        let kind = body[offset];
        offset += 1;
        match kind {
            0 => {
                let (doc, consumed) = bson::decode_document(&body[offset..])?;
                if let serde_json::Value::Object(map) = doc {
                    merged.extend(map);
                }
                offset += consumed;
            }
            1 => {
                let section_len = i32::from_le_bytes(
                    body.get(offset..offset + 4)
                        .ok_or(ProtocolError::Incomplete { needed: 4, have: 0 })?
                        .try_into()
                        .unwrap(),
                ) as usize;
                let section_end = offset + section_len;
                let mut cursor = offset + 4;
                let id_end = body[cursor..section_end]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|p| cursor + p)
                    .ok_or_else(|| ProtocolError::Malformed { message: "unterminated sequence identifier".into() })?;
                let identifier = String::from_utf8_lossy(&body[cursor..id_end]).to_string();
                cursor = id_end + 1;
                let mut docs = Vec::new();
                while cursor < section_end {
                    let (doc, consumed) = bson::decode_document(&body[cursor..section_end])?;
                    docs.push(doc);
                    cursor += consumed;
                }
                merged.insert(identifier, serde_json::Value::Array(docs));
                offset = section_end;
            }
            _ => return Err(ProtocolError::Malformed { message: format!("unknown OP_MSG section kind {kind}") }),
        }
    }
    Ok(serde_json::Value::Object(merged))
}

fn command_name(doc: &serde_json::Value) -> Option<String> {
    doc.as_object()?.keys().next().cloned()
}

fn classify_command(name: &str) -> OperationType {
    match name.to_ascii_lowercase().as_str() {
        "find" | "aggregate" | "count" | "distinct" => OperationType::Find,
        "insert" | "update" | "delete" | "findandmodify" => OperationType::Write,
        "ping" => OperationType::Connection,
        other if AUTH_COMMANDS.contains(&other) => OperationType::Connection,
        _ => OperationType::Server,
    }
}

fn is_auth_command(name: &str) -> bool {
    AUTH_COMMANDS.contains(&name.to_ascii_lowercase().as_str())
}

/// The wire-sniffing sentinel: the first four bytes of an HTTP request
/// line never form a plausible BSON document length, so a connection that
/// opens with one of these is almost certainly a misdirected HTTP client
/// hitting a Mongo listener.
fn looks_like_http(buf: &[u8]) -> bool {
    const METHODS: &[&[u8]] = &[b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"OPTI"];
    METHODS.iter().any(|m| buf.starts_with(m))
}

/// A synthetic HTTP 400 returned when [`looks_like_http`] fires, so a
/// misdirected client gets a readable error instead of a hung connection.
pub fn http_sniff_response() -> Vec<u8> {
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
}

/// Parse as many complete client messages as `buf` contains.
pub fn parse_client(buf: &[u8]) -> (Vec<ParsedOp>, usize) {
    let mut ops = Vec::new();
    let mut offset = 0;

    if looks_like_http(buf) {
        ops.push(ParsedOp {
            fingerprint: "http-sniff".to_string(),
            op_type: OperationType::ParseError,
            params: serde_json::json!({ "reason": "http request on mongo listener" }),
            request_id: None,
            is_auth: false,
        });
        return (ops, buf.len());
    }

    loop {
        let remaining = &buf[offset..];
        let Some(header) = read_header(remaining) else { break };
        if remaining.len() < header.length {
            break;
        }
        if header.opcode != OP_MSG {
            ops.push(ParsedOp {
                fingerprint: format!("CONNECTION opcode-{}", header.opcode),
                op_type: OperationType::Connection,
                params: serde_json::json!({}),
                request_id: Some(header.request_id),
                is_auth: true,
            });
            offset += header.length;
            continue;
        }

        let body = &remaining[HEADER_LEN..header.length];
        match decode_op_msg_body(body) {
            Ok(doc) => {
                let command = command_name(&doc).unwrap_or_else(|| "unknown".to_string());
                let collection = doc.get(&command).and_then(|v| v.as_str()).unwrap_or("").to_string();
                let is_auth = is_auth_command(&command);
                ops.push(ParsedOp {
                    fingerprint: sniffler_core::fingerprint::mongo(&collection, &command, &doc),
                    op_type: classify_command(&command),
                    params: doc,
                    request_id: Some(header.request_id),
                    is_auth,
                });
            }
            Err(_) => ops.push(crate::common::parse_error_op(body)),
        }
        offset += header.length;
    }
    (ops, offset)
}

/// Parse as many complete server messages as `buf` contains.
pub fn parse_server(buf: &[u8]) -> (Vec<ParsedResponse>, usize) {
    let mut responses = Vec::new();
    let mut offset = 0;

    loop {
        let remaining = &buf[offset..];
        let Some(header) = read_header(remaining) else { break };
        if remaining.len() < header.length {
            break;
        }
        if header.opcode != OP_MSG {
            offset += header.length;
            continue;
        }
        let body = &remaining[HEADER_LEN..header.length];
        match decode_op_msg_body(body) {
            Ok(doc) => {
                let is_error = doc.get("ok").and_then(|v| v.as_f64()).map(|v| v != 1.0).unwrap_or(false)
                    || doc.get("errmsg").is_some();
                responses.push(ParsedResponse {
                    payload: doc,
                    is_error,
                    response_to: Some(header.response_to),
                });
            }
            Err(_) => {}
        }
        offset += header.length;
    }
    (responses, offset)
}

fn write_op_msg(request_id: u32, response_to: u32, body_doc: &serde_json::Value) -> Vec<u8> {
    let doc_bytes = bson::encode_document(body_doc);
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // flag bits
    body.push(0); // section kind 0
    body.extend_from_slice(&doc_bytes);

    let total_len = HEADER_LEN + body.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as i32).to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(&OP_MSG.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Synthesize an OP_MSG reply for `mock` (§4.1.5 synthesis). `mock.response`
/// is the bare command-reply document, e.g. `{"cursor": {...}, "ok": 1}` or
/// `{"ok": 0, "errmsg": "...", "code": 11000}`.
pub fn synthesize_response(mock: &Mock, request_id: u32, originating_request_id: u32) -> Vec<u8> {
    write_op_msg(request_id, originating_request_id, &mock.response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_msg(request_id: u32, doc: &serde_json::Value) -> Vec<u8> {
        write_op_msg(request_id, 0, doc)
    }

    #[test]
    fn parses_find_command() {
        let doc = serde_json::json!({ "find": "users", "filter": { "age": 5 } });
        let buf = op_msg(7, &doc);
        let (ops, consumed) = parse_client(&buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(ops[0].op_type, OperationType::Find);
        assert_eq!(ops[0].request_id, Some(7));
    }

    #[test]
    fn auth_command_marked_is_auth_and_forwarded() {
        let doc = serde_json::json!({ "ismaster": 1 });
        let buf = op_msg(1, &doc);
        let (ops, _) = parse_client(&buf);
        assert!(ops[0].is_auth);
    }

    #[test]
    fn http_sniff_sentinel_detected() {
        let buf = b"GET / HTTP/1.1\r\n\r\n";
        let (ops, consumed) = parse_client(buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(ops[0].op_type, OperationType::ParseError);
    }

    #[test]
    fn n_chunk_delivery_matches_single_chunk() {
        let doc = serde_json::json!({ "ping": 1 });
        let full = op_msg(3, &doc);
        let (ops_whole, _) = parse_client(&full);

        let mut buf = Vec::new();
        let mut ops_chunked = Vec::new();
        for chunk in full.chunks(5) {
            buf.extend_from_slice(chunk);
            let (mut ops, consumed) = parse_client(&buf);
            ops_chunked.append(&mut ops);
            buf.drain(..consumed);
        }
        assert_eq!(ops_whole, ops_chunked);
    }

    #[test]
    fn synthesize_and_parse_reply() {
        let mock = Mock::new(
            "m1".into(),
            27017,
            "db.users.find({})".into(),
            serde_json::json!({ "ok": 1.0, "cursor": { "firstBatch": [] } }),
            true,
        );
        let bytes = synthesize_response(&mock, 99, 7);
        let (responses, consumed) = parse_server(&bytes);
        assert_eq!(consumed, bytes.len());
        assert!(!responses[0].is_error);
        assert_eq!(responses[0].response_to, Some(7));
    }

    #[test]
    fn error_reply_flagged() {
        let mock = Mock::new(
            "m2".into(),
            27017,
            "db.users.insert({})".into(),
            serde_json::json!({ "ok": 0.0, "errmsg": "duplicate key", "code": 11000 }),
            true,
        );
        let bytes = synthesize_response(&mock, 100, 8);
        let (responses, _) = parse_server(&bytes);
        assert!(responses[0].is_error);
    }
}
