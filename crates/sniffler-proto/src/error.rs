//! Protocol engine error type, modeled on the decode-error enums used by
//! the other binary-protocol engines in this workspace.

/// Errors an engine's decoder can raise internally. Never escapes
/// `parse_client`/`parse_server` — callers convert these into a
/// `parse_error` operation and resynchronize instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The buffer does not yet contain a complete frame.
    #[error("incomplete frame: need {needed} bytes, have {have}")]
    Incomplete {
        /// Bytes required to complete the frame, if known.
        needed: usize,
        /// Bytes currently available.
        have: usize,
    },
    /// The frame violates the wire format in a way that cannot be
    /// resynchronized from at this position.
    #[error("malformed frame: {message}")]
    Malformed {
        /// Human-readable description.
        message: String,
    },
    /// A declared length or count is implausibly large, treated as
    /// malformed rather than trusted.
    #[error("frame too large: {size} bytes")]
    TooLarge {
        /// The rejected size.
        size: usize,
    },
}

/// Result type for protocol decoders.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
