//! Dispatches the per-connection duplex pump to the right protocol engine
//! in `sniffler-proto`, and owns whatever per-connection state an engine
//! needs threaded across calls (§4.1: "state that must persist is owned by
//! the interceptor runtime and passed in").

use sniffler_core::model::{Mock, OperationType, Protocol};
use sniffler_proto::{ParsedOp, ParsedResponse};

/// Per-connection engine state. Only PostgreSQL needs to remember whether
/// the untagged startup message has already been consumed; every other
/// engine is fully stateless.
pub enum ClientState {
    /// PostgreSQL startup-handshake tracking.
    Postgres(sniffler_proto::postgres::ClientState),
    /// No persistent state required.
    Stateless,
}

impl ClientState {
    /// Build the right state holder for `protocol`.
    pub fn new(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Postgresql => Self::Postgres(sniffler_proto::postgres::ClientState::default()),
            _ => Self::Stateless,
        }
    }
}

/// Parse as many complete client frames as `buf` contains for `protocol`.
/// HTTP is not dispatched here -- it is handled by `sniffler-http`'s own
/// request/response pump, not the raw duplex byte pump this crate drives.
pub fn parse_client(protocol: Protocol, buf: &[u8], state: &mut ClientState) -> (Vec<ParsedOp>, usize) {
    match protocol {
        Protocol::Postgresql => match state {
            ClientState::Postgres(s) => sniffler_proto::postgres::parse_client(buf, s),
            ClientState::Stateless => (Vec::new(), 0),
        },
        Protocol::Mysql => sniffler_proto::mysql::parse_client(buf),
        Protocol::Sqlserver => sniffler_proto::tds::parse_client(buf),
        Protocol::Mongodb => sniffler_proto::mongo::parse_client(buf),
        Protocol::Redis => sniffler_proto::redis::parse_client(buf),
        Protocol::Http => (Vec::new(), 0),
    }
}

/// Parse as many complete server frames as `buf` contains for `protocol`.
pub fn parse_server(protocol: Protocol, buf: &[u8]) -> (Vec<ParsedResponse>, usize) {
    match protocol {
        Protocol::Postgresql => sniffler_proto::postgres::parse_server(buf),
        Protocol::Mysql => sniffler_proto::mysql::parse_server(buf),
        Protocol::Sqlserver => sniffler_proto::tds::parse_server(buf),
        Protocol::Mongodb => sniffler_proto::mongo::parse_server(buf),
        Protocol::Redis => sniffler_proto::redis::parse_server(buf),
        Protocol::Http => (Vec::new(), 0),
    }
}

/// Build the on-wire bytes for `mock` in reply to the request that
/// produced `op_type`/`request_id`.
pub fn synthesize_response(protocol: Protocol, mock: &Mock, op_type: OperationType, request_id: Option<u32>) -> Vec<u8> {
    match protocol {
        Protocol::Postgresql => sniffler_proto::postgres::synthesize_response(mock, op_type),
        Protocol::Mysql => sniffler_proto::mysql::synthesize_response(mock),
        Protocol::Sqlserver => sniffler_proto::tds::synthesize_response(mock),
        Protocol::Mongodb => sniffler_proto::mongo::synthesize_response(mock, rand::random(), request_id.unwrap_or(0)),
        Protocol::Redis => sniffler_proto::redis::synthesize_response(mock),
        Protocol::Http => Vec::new(),
    }
}
