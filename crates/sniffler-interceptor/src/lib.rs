//! Listener lifecycle and the per-connection duplex pipeline for the five
//! raw-TCP database listeners (PostgreSQL, MySQL, TDS, MongoDB, Redis).
//! The HTTP reverse-proxy listener is driven by `sniffler-http` instead,
//! since it speaks request/response framing rather than a raw byte pump --
//! both crates share the same [`sniffler_core::model::Listener`] type,
//! mock store, and event bus shapes.

pub mod connection;
pub mod engine;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;

pub use registry::{ListenerState, Registry};
