//! MySQL client/server engine (§4.1.3).
//!
//! Wire framing: 3-byte little-endian payload length + 1-byte sequence id +
//! payload.

use crate::common::{ParsedOp, ParsedResponse};
use sniffler_core::{model::OperationType, Mock};

const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;

fn read_header(buf: &[u8]) -> Option<(usize, u8)> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
    Some((len, buf[3]))
}

/// Decode a MySQL length-encoded integer at `buf[offset..]`, returning the
/// value and the number of bytes consumed.
pub fn read_length_encoded_int(buf: &[u8], offset: usize) -> Option<(u64, usize)> {
    let first = *buf.get(offset)?;
    match first {
        0..=0xfb => Some((first as u64, 1)),
        0xfc => {
            let b = buf.get(offset + 1..offset + 3)?;
            Some((u16::from_le_bytes([b[0], b[1]]) as u64, 3))
        }
        0xfd => {
            let b = buf.get(offset + 1..offset + 4)?;
            Some((u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64, 4))
        }
        0xfe => {
            let b = buf.get(offset + 1..offset + 9)?;
            Some((u64::from_le_bytes(b.try_into().ok()?), 9))
        }
        _ => None,
    }
}

fn write_length_encoded_int(out: &mut Vec<u8>, value: u64) {
    if value < 251 {
        out.push(value as u8);
    } else if value < 1 << 16 {
        out.push(0xfc);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 1 << 24 {
        out.push(0xfd);
        out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xfe);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn write_length_encoded_string(out: &mut Vec<u8>, s: &str) {
    write_length_encoded_int(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Parse as many complete client packets as `buf` contains.
pub fn parse_client(buf: &[u8]) -> (Vec<ParsedOp>, usize) {
    let mut ops = Vec::new();
    let mut offset = 0;

    loop {
        let remaining = &buf[offset..];
        let Some((len, _seq)) = read_header(remaining) else {
            break;
        };
        let total = 4 + len;
        if remaining.len() < total {
            break;
        }
        let payload = &remaining[4..total];
        if payload.is_empty() {
            offset += total;
            continue;
        }

        let op = match payload[0] {
            COM_QUERY => {
                let sql = String::from_utf8_lossy(&payload[1..]).to_string();
                let fingerprint = sniffler_core::fingerprint::sql(&sql);
                ParsedOp {
                    op_type: sniffler_core::fingerprint::classify_sql(&fingerprint),
                    fingerprint,
                    params: serde_json::json!({ "sql": sql }),
                    request_id: None,
                    is_auth: false,
                }
            }
            COM_STMT_PREPARE => {
                let sql = String::from_utf8_lossy(&payload[1..]).to_string();
                let fingerprint = sniffler_core::fingerprint::sql(&sql);
                ParsedOp {
                    op_type: sniffler_core::fingerprint::classify_sql(&fingerprint),
                    fingerprint,
                    params: serde_json::json!({ "sql": sql, "prepared": true }),
                    request_id: None,
                    is_auth: false,
                }
            }
            COM_STMT_EXECUTE if payload.len() >= 5 => {
                let stmt_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                ParsedOp {
                    fingerprint: format!("stmt_execute:{stmt_id}"),
                    op_type: OperationType::Read,
                    params: serde_json::json!({ "statement_id": stmt_id }),
                    request_id: None,
                    is_auth: false,
                }
            }
            _ => ParsedOp {
                fingerprint: format!("CONNECTION cmd-0x{:02x}", payload[0]),
                op_type: OperationType::Connection,
                params: serde_json::json!({}),
                request_id: None,
                is_auth: true,
            },
        };
        ops.push(op);
        offset += total;
    }
    (ops, offset)
}

/// Parse as many complete server packets as `buf` contains. Multi-packet
/// result sets (column defs + rows) are summarized into a single
/// `ParsedResponse` once a terminating EOF/OK is observed.
pub fn parse_server(buf: &[u8]) -> (Vec<ParsedResponse>, usize) {
    let mut responses = Vec::new();
    let mut offset = 0;
    let mut pending_result_set = false;

    loop {
        let remaining = &buf[offset..];
        let Some((len, _seq)) = read_header(remaining) else {
            break;
        };
        let total = 4 + len;
        if remaining.len() < total {
            break;
        }
        let payload = &remaining[4..total];
        if payload.is_empty() {
            offset += total;
            continue;
        }

        match payload[0] {
            0x00 if payload.len() >= 3 => {
                responses.push(ParsedResponse {
                    payload: serde_json::json!({ "type": "ok" }),
                    is_error: false,
                    response_to: None,
                });
            }
            0xff => {
                let code = if payload.len() >= 3 {
                    u16::from_le_bytes([payload[1], payload[2]])
                } else {
                    0
                };
                let message = if payload.len() > 3 {
                    String::from_utf8_lossy(&payload[3..]).to_string()
                } else {
                    String::new()
                };
                responses.push(ParsedResponse {
                    payload: serde_json::json!({ "type": "error", "code": code, "message": message }),
                    is_error: true,
                    response_to: None,
                });
            }
            0xfe if payload.len() < 9 => {
                if pending_result_set {
                    responses.push(ParsedResponse {
                        payload: serde_json::json!({ "type": "result_set_end" }),
                        is_error: false,
                        response_to: None,
                    });
                    pending_result_set = false;
                } else {
                    responses.push(ParsedResponse {
                        payload: serde_json::json!({ "type": "eof" }),
                        is_error: false,
                        response_to: None,
                    });
                }
            }
            _ => {
                pending_result_set = true;
            }
        }
        offset += total;
    }
    (responses, offset)
}

/// Column definition used when synthesizing a result set.
struct Column<'a> {
    name: &'a str,
}

fn write_packet(out: &mut Vec<u8>, seq: &mut u8, payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    out.push(*seq);
    out.extend_from_slice(payload);
    *seq = seq.wrapping_add(1);
}

/// Synthesize an on-wire result set or error for `mock` (§4.1.3 synthesis).
/// `mock.response` is `{"rows": [...]}` or `{"error": {"code": u16, "sqlstate": "...", "message": "..."}}`.
pub fn synthesize_response(mock: &Mock) -> Vec<u8> {
    let mut out = Vec::new();
    let mut seq: u8 = 1;

    if let Some(error) = mock.response.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(|v| v.as_u64()).unwrap_or(1064) as u16;
        let sqlstate = error.get("sqlstate").and_then(|v| v.as_str()).unwrap_or("HY000");
        let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("mocked error");
        let mut payload = vec![0xff];
        payload.extend_from_slice(&code.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(sqlstate.as_bytes());
        payload.extend_from_slice(message.as_bytes());
        write_packet(&mut out, &mut seq, &payload);
        return out;
    }

    let rows = mock.response.get("rows").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let column_names: Vec<String> = rows
        .first()
        .and_then(|r| r.as_object())
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default();
    let columns: Vec<Column> = column_names.iter().map(|n| Column { name: n }).collect();

    let mut count_payload = Vec::new();
    write_length_encoded_int(&mut count_payload, columns.len() as u64);
    write_packet(&mut out, &mut seq, &count_payload);

    for col in &columns {
        let mut def = Vec::new();
        write_length_encoded_string(&mut def, "def");
        write_length_encoded_string(&mut def, "");
        write_length_encoded_string(&mut def, "");
        write_length_encoded_string(&mut def, "");
        write_length_encoded_string(&mut def, col.name);
        write_length_encoded_string(&mut def, col.name);
        def.push(0x0c); // length of fixed fields
        def.extend_from_slice(&33u16.to_le_bytes()); // utf8_general_ci
        def.extend_from_slice(&255u32.to_le_bytes()); // column length
        def.push(0xfd); // VAR_STRING
        def.extend_from_slice(&0u16.to_le_bytes()); // flags
        def.push(0); // decimals
        def.extend_from_slice(&[0, 0]); // filler
        write_packet(&mut out, &mut seq, &def);
    }
    write_packet(&mut out, &mut seq, &[0xfe, 0x00, 0x00, 0x00, 0x00]);

    for row in &rows {
        let mut data = Vec::new();
        for name in &column_names {
            match row.get(name) {
                None | Some(serde_json::Value::Null) => data.push(0xfb),
                Some(v) => {
                    let text = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    write_length_encoded_string(&mut data, &text);
                }
            }
        }
        write_packet(&mut out, &mut seq, &data);
    }
    write_packet(&mut out, &mut seq, &[0xfe, 0x00, 0x00, 0x00, 0x00]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn com_query(sql: &str) -> Vec<u8> {
        let mut payload = vec![COM_QUERY];
        payload.extend_from_slice(sql.as_bytes());
        let mut buf = (payload.len() as u32).to_le_bytes()[..3].to_vec();
        buf.push(0);
        buf.extend_from_slice(&payload);
        buf
    }

    #[test]
    fn parses_com_query() {
        let buf = com_query("SELECT * FROM users");
        let (ops, consumed) = parse_client(&buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(ops[0].fingerprint, "select * from users");
    }

    #[test]
    fn length_encoded_int_roundtrips_boundary_values() {
        for value in [0u64, 250, 251, 65535, 65536, 1 << 24] {
            let mut out = Vec::new();
            write_length_encoded_int(&mut out, value);
            let (decoded, _) = read_length_encoded_int(&out, 0).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn n_chunk_delivery_matches_single_chunk() {
        let full = com_query("SELECT 1");
        let (ops_whole, _) = parse_client(&full);

        let mut buf = Vec::new();
        let mut ops_chunked = Vec::new();
        for chunk in full.chunks(2) {
            buf.extend_from_slice(chunk);
            let (mut ops, consumed) = parse_client(&buf);
            ops_chunked.append(&mut ops);
            buf.drain(..consumed);
        }
        assert_eq!(ops_whole, ops_chunked);
    }

    #[test]
    fn synthesize_and_parse_result_set() {
        let mock = Mock::new(
            "m1".into(),
            3306,
            "select * from users".into(),
            serde_json::json!({ "rows": [{"id": 1, "name": "a"}] }),
            true,
        );
        let bytes = synthesize_response(&mock);
        let (responses, consumed) = parse_server(&bytes);
        assert_eq!(consumed, bytes.len());
        assert!(responses.iter().any(|r| r.payload["type"] == "result_set_end"));
    }

    #[test]
    fn synthesize_error() {
        let mock = Mock::new(
            "m2".into(),
            3306,
            "select boom".into(),
            serde_json::json!({ "error": {"code": 1146, "sqlstate": "42S02", "message": "Table doesn't exist"} }),
            true,
        );
        let bytes = synthesize_response(&mock);
        let (responses, _) = parse_server(&bytes);
        assert!(responses[0].is_error);
    }
}
