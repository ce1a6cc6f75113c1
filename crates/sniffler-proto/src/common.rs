//! Types shared by every protocol engine's `parse_client`/`parse_server`
//! contract (§4.1).

use sniffler_core::OperationType;

/// A client-originated operation extracted from one or more frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOp {
    /// Normalized fingerprint (§3 derivation rules).
    pub fingerprint: String,
    /// Coarse classifier.
    pub op_type: OperationType,
    /// Structured parameters extracted from the request.
    pub params: serde_json::Value,
    /// Explicit request id, when the protocol provides one (Mongo).
    pub request_id: Option<u32>,
    /// True if this frame should never be looked up in the mock store
    /// (authentication / connection-setup traffic).
    pub is_auth: bool,
}

/// A server-originated response extracted from one or more frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    /// Structured response payload, in the same shape `Mock::response`
    /// uses for this protocol.
    pub payload: serde_json::Value,
    /// True if the response represents a protocol-level error.
    pub is_error: bool,
    /// Explicit correlation id, when the protocol provides one (Mongo
    /// `response_to`). `None` means "correlate by FIFO".
    pub response_to: Option<u32>,
}

/// Build the hex-prefix used on `parse_error` operations (§4.1, §7).
pub fn hex_prefix(bytes: &[u8]) -> String {
    let take = bytes.len().min(16);
    hex::encode(&bytes[..take])
}

/// A `parse_error` pseudo-operation, emitted instead of throwing when an
/// engine hits malformed input, per the common contract: "never throws on
/// malformed input -- instead emits an operation of kind `parse_error` with
/// a hex prefix and continues from the next resynchronization point."
pub fn parse_error_op(bytes: &[u8]) -> ParsedOp {
    ParsedOp {
        fingerprint: format!("parse_error:{}", hex_prefix(bytes)),
        op_type: OperationType::ParseError,
        params: serde_json::json!({ "hex_prefix": hex_prefix(bytes) }),
        request_id: None,
        is_auth: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_prefix_caps_at_16_bytes() {
        let bytes = vec![0xAB; 32];
        assert_eq!(hex_prefix(&bytes).len(), 32); // 16 bytes -> 32 hex chars
    }
}
