//! Microsoft SQL Server (TDS) engine (§4.1.4).
//!
//! Framing: 8-byte packet header (type, status, big-endian length, SPID,
//! packet id, window) followed by payload. A single message may span
//! multiple packets; this engine treats each ALL_HEADERS-prefixed payload
//! as self-contained, which holds for the single-packet batches this
//! listener is expected to see.

use crate::common::{ParsedOp, ParsedResponse};
use crate::error::{ProtocolError, ProtocolResult};
use sniffler_core::{model::OperationType, Mock};

const PKT_SQL_BATCH: u8 = 0x01;
const PKT_RPC: u8 = 0x03;
const PKT_TABULAR_RESULT: u8 = 0x04;
const STATUS_EOM: u8 = 0x01;

const TOKEN_COLMETADATA: u8 = 0x81;
const TOKEN_ROW: u8 = 0xd1;
const TOKEN_ERROR: u8 = 0xaa;
const TOKEN_LOGINACK: u8 = 0xa4;

const TYPE_INT: u8 = 0x26;
const TYPE_TINYINT: u8 = 0x30;
const TYPE_SMALLINT: u8 = 0x34;
const TYPE_BIGINT: u8 = 0x38;
const TYPE_NVARCHAR: u8 = 0xe7;

struct PacketHeader {
    packet_type: u8,
    status: u8,
    length: usize,
}

fn read_packet_header(buf: &[u8]) -> Option<PacketHeader> {
    if buf.len() < 8 {
        return None;
    }
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length < 8 {
        return None;
    }
    Some(PacketHeader { packet_type: buf[0], status: buf[1], length })
}

fn write_packet_header(out: &mut Vec<u8>, packet_type: u8, status: u8, total_length: u16) {
    out.push(packet_type);
    out.push(status);
    out.extend_from_slice(&total_length.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // SPID
    out.push(0); // packet id
    out.push(0); // window
}

/// Skip the ALL_HEADERS preamble (TotalLength u32 LE covering itself),
/// present on SQL Batch and RPC request payloads. Returns the offset past
/// it, or 0 if the payload doesn't start with a plausible ALL_HEADERS.
fn skip_all_headers(payload: &[u8]) -> usize {
    if payload.len() < 4 {
        return 0;
    }
    let total = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    if total >= 4 && total <= payload.len() {
        total
    } else {
        0
    }
}

fn utf16le_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

fn string_to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// `B_VARCHAR`: 1-byte character count, followed by that many UTF-16LE
/// code units. Returns the string and bytes consumed.
fn read_b_varchar(buf: &[u8]) -> ProtocolResult<(String, usize)> {
    let count = *buf.first().ok_or(ProtocolError::Incomplete { needed: 1, have: 0 })? as usize;
    let byte_len = count * 2;
    let data = buf.get(1..1 + byte_len).ok_or(ProtocolError::Incomplete { needed: byte_len, have: buf.len() })?;
    Ok((utf16le_to_string(data), 1 + byte_len))
}

/// `US_VARCHAR`: 2-byte LE character count, followed by UTF-16LE units.
fn read_us_varchar(buf: &[u8]) -> ProtocolResult<(String, usize)> {
    let count = u16::from_le_bytes(buf.get(0..2).ok_or(ProtocolError::Incomplete { needed: 2, have: buf.len() })?.try_into().unwrap()) as usize;
    let byte_len = count * 2;
    let data = buf.get(2..2 + byte_len).ok_or(ProtocolError::Incomplete { needed: byte_len, have: buf.len() })?;
    Ok((utf16le_to_string(data), 2 + byte_len))
}

/// A decoded parameter/column type token plus the value width rule needed
/// to read its wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamType {
    Int,
    TinyInt,
    SmallInt,
    BigInt,
    NVarChar,
}

fn read_type_info(buf: &[u8]) -> ProtocolResult<(ParamType, usize, u16)> {
    let type_byte = *buf.first().ok_or(ProtocolError::Incomplete { needed: 1, have: 0 })?;
    match type_byte {
        TYPE_INT => Ok((ParamType::Int, 1, 0)),
        TYPE_TINYINT => Ok((ParamType::TinyInt, 1, 0)),
        TYPE_SMALLINT => Ok((ParamType::SmallInt, 1, 0)),
        TYPE_BIGINT => Ok((ParamType::BigInt, 1, 0)),
        TYPE_NVARCHAR => {
            let max_len = u16::from_le_bytes(buf.get(1..3).ok_or(ProtocolError::Incomplete { needed: 3, have: buf.len() })?.try_into().unwrap());
            // type byte + 2-byte max length + 5-byte collation
            Ok((ParamType::NVarChar, 1 + 2 + 5, max_len))
        }
        other => Err(ProtocolError::Malformed { message: format!("unsupported TDS type 0x{other:02x}") }),
    }
}

/// Reads one typed value (parameter or row column). `0xffff` on a
/// variable-length type is the NULL sentinel (§8 boundary behavior).
fn read_value(param_type: ParamType, buf: &[u8]) -> ProtocolResult<(serde_json::Value, usize)> {
    match param_type {
        ParamType::Int => {
            let len = *buf.first().ok_or(ProtocolError::Incomplete { needed: 1, have: 0 })? as usize;
            if len == 0 {
                return Ok((serde_json::Value::Null, 1));
            }
            let data = buf.get(1..1 + len).ok_or(ProtocolError::Incomplete { needed: len, have: buf.len() })?;
            let mut padded = [0u8; 8];
            padded[..data.len()].copy_from_slice(data);
            Ok((serde_json::json!(i64::from_le_bytes(padded)), 1 + len))
        }
        ParamType::TinyInt => {
            let b = *buf.first().ok_or(ProtocolError::Incomplete { needed: 1, have: 0 })?;
            Ok((serde_json::json!(b), 1))
        }
        ParamType::SmallInt => {
            let bytes = buf.get(0..2).ok_or(ProtocolError::Incomplete { needed: 2, have: buf.len() })?;
            Ok((serde_json::json!(i16::from_le_bytes(bytes.try_into().unwrap())), 2))
        }
        ParamType::BigInt => {
            let bytes = buf.get(0..8).ok_or(ProtocolError::Incomplete { needed: 8, have: buf.len() })?;
            Ok((serde_json::json!(i64::from_le_bytes(bytes.try_into().unwrap())), 8))
        }
        ParamType::NVarChar => {
            let actual_len = u16::from_le_bytes(buf.get(0..2).ok_or(ProtocolError::Incomplete { needed: 2, have: buf.len() })?.try_into().unwrap());
            if actual_len == 0xffff {
                return Ok((serde_json::Value::Null, 2));
            }
            let data = buf.get(2..2 + actual_len as usize).ok_or(ProtocolError::Incomplete { needed: actual_len as usize, have: buf.len() })?;
            Ok((serde_json::json!(utf16le_to_string(data)), 2 + actual_len as usize))
        }
    }
}

struct Param {
    name: String,
    value: serde_json::Value,
}

fn decode_params(buf: &[u8]) -> ProtocolResult<Vec<Param>> {
    let mut params = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (name, name_len) = read_b_varchar(&buf[offset..])?;
        offset += name_len;
        offset += 1; // status flags byte
        let (param_type, type_info_len, _max_len) = read_type_info(&buf[offset..])?;
        offset += type_info_len;
        let (value, value_len) = read_value(param_type, &buf[offset..])?;
        offset += value_len;
        params.push(Param { name, value });
    }
    Ok(params)
}

/// Fallback heuristic: scan raw UTF-16LE bytes for a leading SQL keyword.
fn raw_keyword_scan(payload: &[u8]) -> Option<String> {
    let text = utf16le_to_string(payload);
    let trimmed = text.trim_start();
    let upper = trimmed.to_uppercase();
    const KEYWORDS: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE"];
    if KEYWORDS.iter().any(|k| upper.starts_with(k)) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// Extract the batch SQL text from an `sp_executesql` RPC call. Tries the
/// parameter-driven path (the `@stmt`/first NVARCHAR parameter) before
/// falling back to a raw keyword scan over the undecoded payload.
fn extract_sp_executesql_sql(params: &[Param], raw_payload: &[u8]) -> Option<String> {
    if let Some(p) = params.first() {
        if let serde_json::Value::String(s) = &p.value {
            return Some(s.clone());
        }
    }
    raw_keyword_scan(raw_payload)
}

fn decode_rpc(payload: &[u8]) -> ProtocolResult<ParsedOp> {
    let mut offset = 0;
    let (proc_name, name_len) = if payload.get(0..2) == Some(&[0xff, 0xff]) {
        let proc_id = u16::from_le_bytes(payload.get(2..4).ok_or(ProtocolError::Incomplete { needed: 4, have: payload.len() })?.try_into().unwrap());
        (if proc_id == 10 { "sp_executesql".to_string() } else { format!("proc-{proc_id}") }, 4)
    } else {
        read_us_varchar(payload)?
    };
    offset += name_len;
    offset += 2; // option flags

    let params = decode_params(&payload[offset..])?;

    if proc_name.eq_ignore_ascii_case("sp_executesql") {
        let sql = extract_sp_executesql_sql(&params, &payload[offset..]).unwrap_or_default();
        let fingerprint = sniffler_core::fingerprint::sql(&sql);
        return Ok(ParsedOp {
            op_type: sniffler_core::fingerprint::classify_sql(&fingerprint),
            fingerprint,
            params: serde_json::json!({ "sql": sql, "rpc": "sp_executesql" }),
            request_id: None,
            is_auth: false,
        });
    }

    Ok(ParsedOp {
        fingerprint: format!("rpc:{proc_name}"),
        op_type: OperationType::Server,
        params: serde_json::json!({ "proc": proc_name, "params": params.iter().map(|p| (p.name.clone(), p.value.clone())).collect::<std::collections::HashMap<_, _>>() }),
        request_id: None,
        is_auth: false,
    })
}

/// Parse as many complete client packets as `buf` contains.
pub fn parse_client(buf: &[u8]) -> (Vec<ParsedOp>, usize) {
    let mut ops = Vec::new();
    let mut offset = 0;

    loop {
        let remaining = &buf[offset..];
        let Some(header) = read_packet_header(remaining) else { break };
        if remaining.len() < header.length {
            break;
        }
        let payload = &remaining[8..header.length];

        let op = match header.packet_type {
            PKT_SQL_BATCH => {
                let start = skip_all_headers(payload);
                let sql = utf16le_to_string(&payload[start..]);
                let fingerprint = sniffler_core::fingerprint::sql(&sql);
                ParsedOp {
                    op_type: sniffler_core::fingerprint::classify_sql(&fingerprint),
                    fingerprint,
                    params: serde_json::json!({ "sql": sql }),
                    request_id: None,
                    is_auth: false,
                }
            }
            PKT_RPC => {
                let start = skip_all_headers(payload);
                match decode_rpc(&payload[start..]) {
                    Ok(op) => op,
                    Err(_) => crate::common::parse_error_op(payload),
                }
            }
            _ => ParsedOp {
                fingerprint: format!("CONNECTION pkt-0x{:02x}", header.packet_type),
                op_type: OperationType::Connection,
                params: serde_json::json!({}),
                request_id: None,
                is_auth: true,
            },
        };
        ops.push(op);
        offset += header.length;
    }
    (ops, offset)
}

struct ColumnMeta {
    name: String,
    param_type: ParamType,
}

fn decode_colmetadata(buf: &[u8]) -> ProtocolResult<(Vec<ColumnMeta>, usize)> {
    let count = u16::from_le_bytes(buf.get(0..2).ok_or(ProtocolError::Incomplete { needed: 2, have: buf.len() })?.try_into().unwrap());
    let mut offset = 2;
    let mut columns = Vec::new();
    for _ in 0..count {
        offset += 4; // user type
        offset += 2; // flags
        let (param_type, type_info_len, _) = read_type_info(&buf[offset..])?;
        offset += type_info_len;
        let (name, name_len) = read_b_varchar(&buf[offset..])?;
        offset += name_len;
        columns.push(ColumnMeta { name, param_type });
    }
    Ok((columns, offset))
}

/// Parse as many complete server token streams as `buf` contains, emitting
/// one `ParsedResponse` per TDS packet.
pub fn parse_server(buf: &[u8]) -> (Vec<ParsedResponse>, usize) {
    let mut responses = Vec::new();
    let mut offset = 0;

    loop {
        let remaining = &buf[offset..];
        let Some(header) = read_packet_header(remaining) else { break };
        if remaining.len() < header.length || header.packet_type != PKT_TABULAR_RESULT {
            if remaining.len() < header.length {
                break;
            }
            offset += header.length;
            continue;
        }
        let payload = &remaining[8..header.length];
        match decode_token_stream(payload) {
            Ok(response) => responses.push(response),
            Err(_) => {}
        }
        offset += header.length;
    }
    (responses, offset)
}

fn decode_token_stream(payload: &[u8]) -> ProtocolResult<ParsedResponse> {
    let mut offset = 0;
    let mut columns: Vec<ColumnMeta> = Vec::new();
    let mut rows = Vec::new();
    let mut is_error = false;
    let mut error_message = String::new();

    while offset < payload.len() {
        let token = payload[offset];
        offset += 1;
        match token {
            TOKEN_COLMETADATA => {
                let (cols, consumed) = decode_colmetadata(&payload[offset..])?;
                columns = cols;
                offset += consumed;
            }
            TOKEN_ROW => {
                let mut row = serde_json::Map::new();
                for col in &columns {
                    let (value, consumed) = read_value(col.param_type, &payload[offset..])?;
                    offset += consumed;
                    row.insert(col.name.clone(), value);
                }
                rows.push(serde_json::Value::Object(row));
            }
            TOKEN_ERROR => {
                is_error = true;
                let token_len = u16::from_le_bytes(payload.get(offset..offset + 2).ok_or(ProtocolError::Incomplete { needed: 2, have: 0 })?.try_into().unwrap()) as usize;
                let body_start = offset + 2;
                let _number = u32::from_le_bytes(payload[body_start..body_start + 4].try_into().unwrap());
                let mut p = body_start + 4;
                p += 1; // state
                p += 1; // class
                let (message, msg_len) = read_us_varchar(&payload[p..])?;
                error_message = message;
                p += msg_len;
                let _ = p;
                offset = body_start + token_len;
            }
            TOKEN_LOGINACK => {
                let token_len = u16::from_le_bytes(payload.get(offset..offset + 2).ok_or(ProtocolError::Incomplete { needed: 2, have: 0 })?.try_into().unwrap()) as usize;
                offset += 2 + token_len;
            }
            0xfd | 0xfe | 0xff => {
                // DONE / DONEPROC / DONEINPROC: status(2) curcmd(2) rowcount(8)
                offset += 12;
            }
            _ => return Err(ProtocolError::Malformed { message: format!("unknown TDS token 0x{token:02x}") }),
        }
    }

    let payload_value = if is_error {
        serde_json::json!({ "error": { "message": error_message } })
    } else {
        serde_json::json!({ "rows": rows })
    };
    Ok(ParsedResponse { payload: payload_value, is_error, response_to: None })
}

fn write_token_row(out: &mut Vec<u8>, columns: &[(String, ParamType)], row: &serde_json::Value) {
    out.push(TOKEN_ROW);
    for (name, param_type) in columns {
        let value = row.get(name).cloned().unwrap_or(serde_json::Value::Null);
        write_value(out, *param_type, &value);
    }
}

fn write_value(out: &mut Vec<u8>, param_type: ParamType, value: &serde_json::Value) {
    match param_type {
        ParamType::NVarChar => match value.as_str() {
            Some(s) => {
                let bytes = string_to_utf16le(s);
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(&bytes);
            }
            None => out.extend_from_slice(&0xffffu16.to_le_bytes()),
        },
        ParamType::Int => match value.as_i64() {
            Some(v) => {
                out.push(8);
                out.extend_from_slice(&v.to_le_bytes());
            }
            None => out.push(0),
        },
        ParamType::TinyInt => out.push(value.as_u64().unwrap_or(0) as u8),
        ParamType::SmallInt => out.extend_from_slice(&(value.as_i64().unwrap_or(0) as i16).to_le_bytes()),
        ParamType::BigInt => out.extend_from_slice(&value.as_i64().unwrap_or(0).to_le_bytes()),
    }
}

fn write_type_info(out: &mut Vec<u8>, param_type: ParamType) {
    match param_type {
        ParamType::Int => out.push(TYPE_INT),
        ParamType::TinyInt => out.push(TYPE_TINYINT),
        ParamType::SmallInt => out.push(TYPE_SMALLINT),
        ParamType::BigInt => out.push(TYPE_BIGINT),
        ParamType::NVarChar => {
            out.push(TYPE_NVARCHAR);
            out.extend_from_slice(&8000u16.to_le_bytes());
            out.extend_from_slice(&[0; 5]); // collation
        }
    }
}

fn write_b_varchar(out: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    out.push(units.len() as u8);
    for u in units {
        out.extend_from_slice(&u.to_le_bytes());
    }
}

fn infer_column_type(value: &serde_json::Value) -> ParamType {
    match value {
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => ParamType::BigInt,
        _ => ParamType::NVarChar,
    }
}

/// Synthesize a tabular-result token stream for `mock` (§4.1.4 synthesis),
/// wrapped in a single packet-type `0x04` packet with end-of-message
/// status. `mock.response` is `{"rows": [...]}` or `{"error": {"message": "..."}}`.
pub fn synthesize_response(mock: &Mock) -> Vec<u8> {
    let mut body = Vec::new();

    if let Some(error) = mock.response.get("error").filter(|e| !e.is_null()) {
        let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("mocked error");
        let msg_bytes = string_to_utf16le(message);
        let mut token_body = Vec::new();
        token_body.extend_from_slice(&50000u32.to_le_bytes()); // number
        token_body.push(1); // state
        token_body.push(16); // class
        token_body.extend_from_slice(&(msg_bytes.len() as u16 / 2).to_le_bytes());
        token_body.extend_from_slice(&msg_bytes);
        write_b_varchar(&mut token_body, "sniffler");
        write_b_varchar(&mut token_body, "");
        token_body.extend_from_slice(&0u32.to_le_bytes()); // line number

        body.push(TOKEN_ERROR);
        body.extend_from_slice(&(token_body.len() as u16).to_le_bytes());
        body.extend_from_slice(&token_body);
    } else {
        let rows = mock.response.get("rows").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let column_names: Vec<String> = rows.first().and_then(|r| r.as_object()).map(|o| o.keys().cloned().collect()).unwrap_or_default();
        let columns: Vec<(String, ParamType)> = column_names
            .iter()
            .map(|name| {
                let ty = rows.first().and_then(|r| r.get(name)).map(infer_column_type).unwrap_or(ParamType::NVarChar);
                (name.clone(), ty)
            })
            .collect();

        body.push(TOKEN_COLMETADATA);
        body.extend_from_slice(&(columns.len() as u16).to_le_bytes());
        for (name, param_type) in &columns {
            body.extend_from_slice(&0u32.to_le_bytes()); // user type
            body.extend_from_slice(&0u16.to_le_bytes()); // flags
            write_type_info(&mut body, *param_type);
            write_b_varchar(&mut body, name);
        }

        for row in &rows {
            write_token_row(&mut body, &columns, row);
        }

        body.push(0xfd); // DONE
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    }

    let total_length = (8 + body.len()) as u16;
    let mut out = Vec::with_capacity(total_length as usize);
    write_packet_header(&mut out, PKT_TABULAR_RESULT, STATUS_EOM, total_length);
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_batch(sql: &str) -> Vec<u8> {
        let sql_bytes = string_to_utf16le(sql);
        let mut all_headers = Vec::new();
        all_headers.extend_from_slice(&4u32.to_le_bytes()); // empty ALL_HEADERS (length covers only itself)
        let mut payload = all_headers;
        payload.extend_from_slice(&sql_bytes);
        let total_length = (8 + payload.len()) as u16;
        let mut out = Vec::new();
        write_packet_header(&mut out, PKT_SQL_BATCH, STATUS_EOM, total_length);
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn parses_sql_batch() {
        let buf = sql_batch("SELECT * FROM users");
        let (ops, consumed) = parse_client(&buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(ops[0].fingerprint, "select * from users");
    }

    #[test]
    fn partial_delivery_in_n_chunks() {
        let full = sql_batch("SELECT 1");
        let (ops_whole, _) = parse_client(&full);

        let mut buf = Vec::new();
        let mut ops_chunked = Vec::new();
        for chunk in full.chunks(3) {
            buf.extend_from_slice(chunk);
            let (mut ops, consumed) = parse_client(&buf);
            ops_chunked.append(&mut ops);
            buf.drain(..consumed);
        }
        assert_eq!(ops_whole, ops_chunked);
    }

    fn rpc_sp_executesql(sql: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u32.to_le_bytes()); // empty ALL_HEADERS
        let mut rpc = Vec::new();
        rpc.extend_from_slice(&[0xff, 0xff]);
        rpc.extend_from_slice(&10u16.to_le_bytes()); // ProcID 10 = sp_executesql
        rpc.extend_from_slice(&0u16.to_le_bytes()); // option flags
        write_b_varchar(&mut rpc, "@stmt");
        rpc.push(0); // status flags
        write_type_info(&mut rpc, ParamType::NVarChar);
        write_value(&mut rpc, ParamType::NVarChar, &serde_json::json!(sql));
        payload.extend_from_slice(&rpc);

        let total_length = (8 + payload.len()) as u16;
        let mut out = Vec::new();
        write_packet_header(&mut out, PKT_RPC, STATUS_EOM, total_length);
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn sp_executesql_extracts_sql_from_parameter() {
        let buf = rpc_sp_executesql("SELECT * FROM orders WHERE id = @p1");
        let (ops, _) = parse_client(&buf);
        assert_eq!(ops[0].fingerprint, "select * from orders where id = @p1");
    }

    #[test]
    fn nvarchar_null_sentinel_decodes_to_null() {
        let mut buf = Vec::new();
        write_value(&mut buf, ParamType::NVarChar, &serde_json::Value::Null);
        let (value, consumed) = read_value(ParamType::NVarChar, &buf).unwrap();
        assert_eq!(value, serde_json::Value::Null);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn synthesize_and_parse_result_set() {
        let mock = Mock::new(
            "m1".into(),
            1433,
            "select * from users".into(),
            serde_json::json!({ "rows": [{"id": 1, "name": "a"}] }),
            true,
        );
        let bytes = synthesize_response(&mock);
        let (responses, consumed) = parse_server(&bytes);
        assert_eq!(consumed, bytes.len());
        assert!(!responses[0].is_error);
        assert_eq!(responses[0].payload["rows"][0]["name"], "a");
    }

    #[test]
    fn synthesize_error() {
        let mock = Mock::new(
            "m2".into(),
            1433,
            "select boom".into(),
            serde_json::json!({ "error": {"message": "Invalid column name"} }),
            true,
        );
        let bytes = synthesize_response(&mock);
        let (responses, _) = parse_server(&bytes);
        assert!(responses[0].is_error);
    }
}
