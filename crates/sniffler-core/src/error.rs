//! Error types shared across the proxy core.

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an upstream connection failure, surfaced by
/// `test_connection()` and attached to `UpstreamError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpstreamErrorType {
    /// TCP connect was refused.
    ServiceNotRunning,
    /// DNS resolution for the upstream host failed.
    HostnameNotFound,
    /// The connect attempt did not complete within its deadline.
    Timeout,
    /// Any other connection-level failure.
    ConnectionError,
}

/// Core error type. Variant names follow the error *kinds* named in the
/// design (not implementation-internal type names).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid port, duplicate listener, self-loop, unknown protocol, or a
    /// mutation of a non-name field on a running listener.
    #[error("config error: {message}")]
    ConfigError {
        /// Human-readable description.
        message: String,
    },

    /// The listener socket could not be bound.
    #[error("bind error on port {port}: {message}")]
    BindError {
        /// Local port that failed to bind.
        port: u16,
        /// Underlying OS error text.
        message: String,
    },

    /// Could not connect to the configured upstream.
    #[error("upstream error ({error_type:?}): {message}")]
    UpstreamError {
        /// Classification of the failure.
        error_type: UpstreamErrorType,
        /// Human-readable description.
        message: String,
    },

    /// Malformed wire bytes. This variant never escapes an engine; it is
    /// caught and converted into a `parse_error` operation instead.
    #[error("parse error: {message}")]
    ParseError {
        /// Human-readable description.
        message: String,
    },

    /// A per-operation or per-connect deadline was exceeded.
    #[error("timeout error: {message}")]
    TimeoutError {
        /// Human-readable description.
        message: String,
    },

    /// File I/O or JSON decode failure in the persistence layer.
    #[error("persistence error: {message}")]
    PersistenceError {
        /// Human-readable description.
        message: String,
    },

    /// An invariant was violated (e.g. a buffer consumed past its length).
    /// Only the affected connection is terminated.
    #[error("fatal error: {message}")]
    FatalError {
        /// Human-readable description.
        message: String,
    },

    /// Wrapped I/O error, converted to `FatalError` semantics at call sites
    /// that need a typed variant to match on.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for errors that do not need a dedicated variant.
    #[error("error: {0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Generic(message)
    }
}

impl Error {
    /// Build a `ConfigError`.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Build a `BindError`.
    pub fn bind<S: Into<String>>(port: u16, message: S) -> Self {
        Self::BindError {
            port,
            message: message.into(),
        }
    }

    /// Build an `UpstreamError`.
    pub fn upstream<S: Into<String>>(error_type: UpstreamErrorType, message: S) -> Self {
        Self::UpstreamError {
            error_type,
            message: message.into(),
        }
    }

    /// Build a `ParseError`.
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::ParseError {
            message: message.into(),
        }
    }

    /// Build a `TimeoutError`.
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::TimeoutError {
            message: message.into(),
        }
    }

    /// Build a `PersistenceError`.
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::PersistenceError {
            message: message.into(),
        }
    }

    /// Build a `FatalError`.
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::FatalError {
            message: message.into(),
        }
    }

    /// Build a generic error.
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }

    /// The error kind name, used when building structured `{kind, message}`
    /// command-surface errors (see the external interface command table).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigError { .. } => "ConfigError",
            Self::BindError { .. } => "BindError",
            Self::UpstreamError { .. } => "UpstreamError",
            Self::ParseError { .. } => "ParseError",
            Self::TimeoutError { .. } => "TimeoutError",
            Self::PersistenceError { .. } => "PersistenceError",
            Self::FatalError { .. } => "FatalError",
            Self::Io(_) | Self::Json(_) | Self::Generic(_) => "FatalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_kind() {
        let err = Error::config("duplicate listener on port 5432");
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn upstream_error_carries_type() {
        let err = Error::upstream(UpstreamErrorType::HostnameNotFound, "no such host");
        match err {
            Error::UpstreamError { error_type, .. } => {
                assert_eq!(error_type, UpstreamErrorType::HostnameNotFound);
            }
            _ => panic!("expected UpstreamError"),
        }
    }

    #[test]
    fn generic_from_string() {
        let err: Error = "boom".to_string().into();
        assert_eq!(err.kind(), "FatalError");
    }
}
