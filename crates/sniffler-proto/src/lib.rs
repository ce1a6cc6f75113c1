//! Stateless wire-protocol engines for the five raw-TCP listeners and the
//! shared types they all speak in terms of.
//!
//! Every engine exposes the same shape: `parse_client`/`parse_server`
//! functions that consume as many complete frames as a buffer contains and
//! report how many bytes they used, plus a `synthesize_response` function
//! that turns a stored [`sniffler_core::Mock`] back into wire bytes. State
//! that must outlive a single call (PostgreSQL's startup handshake) is
//! owned by the caller and threaded through by `&mut` reference -- these
//! modules never hold session state themselves.

pub mod bson;
pub mod common;
pub mod error;
pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod redis;
pub mod tds;

pub use common::{hex_prefix, parse_error_op, ParsedOp, ParsedResponse};
pub use error::{ProtocolError, ProtocolResult};
