//! HTTP/1.1 reverse-proxy listener (§4.1.1).
//!
//! Unlike the five raw-TCP listeners in `sniffler-interceptor`, HTTP
//! already comes with request/response framing, so this crate fronts the
//! listener's port with `axum` instead of driving a byte-level duplex pump,
//! and forwards to upstream with `reqwest` instead of a raw `TcpStream`
//! half. It shares `sniffler-interceptor`'s [`sniffler_interceptor::Registry`]
//! / [`sniffler_interceptor::ListenerState`] and operation pipeline, so a
//! mock hit, a deduplicated request, and a stale-pending sweep all behave
//! identically to the other five protocols from the outside.

pub mod proxy;

pub use proxy::start;
