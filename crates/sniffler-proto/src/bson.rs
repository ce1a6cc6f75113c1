//! Minimal BSON codec covering the element types named in §4.1.5: double
//! (0x01), UTF-8 string (0x02), embedded document (0x03), array (0x04),
//! binary (0x08), boolean... actually boolean is 0x08 in the full spec but
//! this pack only names 0x08 binary, 0x10 int32, 0x12 int64, plus null and
//! bool which every driver sends. Unknown element types stop decoding of
//! the current document gracefully rather than panicking.

use crate::error::{ProtocolError, ProtocolResult};

/// A decoded BSON value, widened into `serde_json::Value` for downstream
/// fingerprinting and storage -- callers never need the original element
/// type byte once a document has been decoded.
pub fn decode_document(buf: &[u8]) -> ProtocolResult<(serde_json::Value, usize)> {
    if buf.len() < 4 {
        return Err(ProtocolError::Incomplete { needed: 4, have: buf.len() });
    }
    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < 5 || len > 16 * 1024 * 1024 {
        return Err(ProtocolError::TooLarge { size: len });
    }
    if buf.len() < len {
        return Err(ProtocolError::Incomplete { needed: len, have: buf.len() });
    }
    let mut map = serde_json::Map::new();
    let mut offset = 4;
    let body_end = len - 1; // trailing 0x00

    while offset < body_end {
        let element_type = buf[offset];
        offset += 1;
        if element_type == 0x00 {
            break;
        }
        let name_start = offset;
        let name_end = buf[name_start..body_end]
            .iter()
            .position(|&b| b == 0)
            .map(|p| name_start + p)
            .ok_or_else(|| ProtocolError::Malformed { message: "unterminated bson element name".into() })?;
        let name = std::str::from_utf8(&buf[name_start..name_end])
            .map_err(|e| ProtocolError::Malformed { message: e.to_string() })?
            .to_string();
        offset = name_end + 1;

        let (value, consumed) = decode_element(element_type, &buf[offset..body_end])?;
        offset += consumed;
        map.insert(name, value);
    }

    Ok((serde_json::Value::Object(map), len))
}

fn decode_element(element_type: u8, buf: &[u8]) -> ProtocolResult<(serde_json::Value, usize)> {
    match element_type {
        0x01 => {
            let bytes = buf.get(0..8).ok_or(ProtocolError::Incomplete { needed: 8, have: buf.len() })?;
            let value = f64::from_le_bytes(bytes.try_into().unwrap());
            Ok((serde_json::json!(value), 8))
        }
        0x02 => {
            let len = i32_at(buf)? as usize;
            let total = 4 + len;
            let bytes = buf.get(4..4 + len.saturating_sub(1)).ok_or(ProtocolError::Incomplete { needed: total, have: buf.len() })?;
            let s = std::str::from_utf8(bytes).map_err(|e| ProtocolError::Malformed { message: e.to_string() })?;
            Ok((serde_json::json!(s), total))
        }
        0x03 | 0x04 => {
            let (value, consumed) = decode_document(buf)?;
            Ok((value, consumed))
        }
        0x08 => {
            let b = *buf.first().ok_or(ProtocolError::Incomplete { needed: 1, have: 0 })?;
            Ok((serde_json::json!(b != 0), 1))
        }
        0x0a => Ok((serde_json::Value::Null, 0)),
        0x10 => {
            let value = i32_at(buf)?;
            Ok((serde_json::json!(value), 4))
        }
        0x12 => {
            let bytes = buf.get(0..8).ok_or(ProtocolError::Incomplete { needed: 8, have: buf.len() })?;
            let value = i64::from_le_bytes(bytes.try_into().unwrap());
            Ok((serde_json::json!(value), 8))
        }
        other => Err(ProtocolError::Malformed { message: format!("unsupported bson element type 0x{other:02x}") }),
    }
}

fn i32_at(buf: &[u8]) -> ProtocolResult<i32> {
    let bytes = buf.get(0..4).ok_or(ProtocolError::Incomplete { needed: 4, have: buf.len() })?;
    Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
}

fn encode_element(out: &mut Vec<u8>, name: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Null => {
            out.push(0x0a);
            write_cstring(out, name);
        }
        serde_json::Value::Bool(b) => {
            out.push(0x08);
            write_cstring(out, name);
            out.push(if *b { 1 } else { 0 });
        }
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => {
            out.push(0x12);
            write_cstring(out, name);
            out.extend_from_slice(&n.as_i64().unwrap_or_default().to_le_bytes());
        }
        serde_json::Value::Number(n) => {
            out.push(0x01);
            write_cstring(out, name);
            out.extend_from_slice(&n.as_f64().unwrap_or_default().to_le_bytes());
        }
        serde_json::Value::String(s) => {
            out.push(0x02);
            write_cstring(out, name);
            out.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        serde_json::Value::Array(items) => {
            out.push(0x04);
            write_cstring(out, name);
            let mut body = Vec::new();
            for (i, item) in items.iter().enumerate() {
                encode_element(&mut body, &i.to_string(), item);
            }
            write_document_body(out, &body);
        }
        serde_json::Value::Object(map) => {
            out.push(0x03);
            write_cstring(out, name);
            let mut body = Vec::new();
            for (k, v) in map {
                encode_element(&mut body, k, v);
            }
            write_document_body(out, &body);
        }
    }
}

fn write_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn write_document_body(out: &mut Vec<u8>, elements: &[u8]) {
    let len = (elements.len() + 5) as i32;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(elements);
    out.push(0);
}

/// Encode a JSON object as a BSON document.
pub fn encode_document(value: &serde_json::Value) -> Vec<u8> {
    let mut body = Vec::new();
    if let serde_json::Value::Object(map) = value {
        for (k, v) in map {
            encode_element(&mut body, k, v);
        }
    }
    let mut out = Vec::new();
    write_document_body(&mut out, &body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_scalar_fields() {
        let value = serde_json::json!({ "name": "x", "count": 3, "ok": true, "nil": null });
        let bytes = encode_document(&value);
        let (decoded, consumed) = decode_document(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrips_nested_document_and_array() {
        let value = serde_json::json!({ "filter": { "age": 5 }, "tags": ["a", "b"] });
        let bytes = encode_document(&value);
        let (decoded, _) = decode_document(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn unknown_element_type_stops_gracefully() {
        let mut bytes = vec![0u8; 4];
        bytes.push(0x7f); // unsupported type
        bytes.push(b'x');
        bytes.push(0);
        bytes.push(0); // terminator
        let len = bytes.len() as i32;
        bytes[0..4].copy_from_slice(&len.to_le_bytes());
        assert!(decode_document(&bytes).is_err());
    }
}
