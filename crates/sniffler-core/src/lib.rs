//! # Sniffler Core
//!
//! Shared data model, fingerprinting, mock store, event bus, and
//! persistence for the Sniffler intercepting proxy. Protocol-specific wire
//! codecs live in `sniffler-proto`; the TCP/HTTP connection pumps live in
//! `sniffler-interceptor` and `sniffler-http`.
//!
//! ## Quick start
//!
//! ```no_run
//! use sniffler_core::model::{Listener, Protocol};
//!
//! let listener = Listener::new(
//!     "1".to_string(),
//!     "local postgres".to_string(),
//!     5432,
//!     "127.0.0.1".to_string(),
//!     5433,
//!     Protocol::Postgresql,
//! );
//! assert!(!listener.is_self_loop());
//! ```

pub mod error;
pub mod events;
pub mod fingerprint;
pub mod mock_store;
pub mod model;
pub mod persistence;
pub mod settings;

pub use error::{Error, Result, UpstreamErrorType};
pub use events::{Event, EventBus};
pub use mock_store::MockStore;
pub use model::{
    compare_responses, now_millis, ConnectionInfo, Listener, Mock, MockComparison, Operation,
    OperationStatus, OperationType, Protocol, RunState,
};
pub use persistence::Store;
pub use settings::Settings;
