//! Error types for the control protocol.
//!
//! Covers both framing failures (malformed heads, oversized content) and
//! control-plane misuse reported by the session layer (a message kind that is
//! illegal in the current state, a NOTIFY for an unknown barrier).

use thiserror::Error;

/// Result alias for control protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or interpreting control messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Framing errors
    /// The kind line was empty
    #[error("missing message kind")]
    MissingKind,

    /// The kind line named no known message kind
    #[error("unknown message kind: {0:?}")]
    UnknownKind(String),

    /// A header line had no `:` separator or an empty name
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// A header name or value contains a character the format cannot carry
    #[error("header {name:?} cannot be encoded: {reason}")]
    InvalidHeader {
        /// Header name
        name: String,
        /// Why the header was rejected
        reason: &'static str,
    },

    /// The `content-length` header was not a decimal integer
    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    /// The message head is not valid UTF-8
    #[error("message head is not valid UTF-8")]
    InvalidUtf8,

    /// Head exceeds [`crate::ControlMessage::MAX_HEAD_SIZE`]
    #[error("message head too large: {size} bytes exceeds maximum {max}")]
    HeadTooLarge {
        /// Bytes buffered without finding the end of the head
        size: usize,
        /// Maximum allowed head size
        max: usize,
    },

    /// Content exceeds [`crate::ControlMessage::MAX_CONTENT_SIZE`]
    #[error("content too large: {size} bytes exceeds maximum {max}")]
    ContentTooLarge {
        /// Declared content length
        size: usize,
        /// Maximum allowed content length
        max: usize,
    },

    // Session errors
    /// A required header was absent
    #[error("missing required header {0:?}")]
    MissingHeader(&'static str),

    /// The message kind is not accepted in the current session state
    #[error("unexpected {kind} message in state {state}")]
    UnexpectedKind {
        /// Kind of the offending message
        kind: String,
        /// Session state when it arrived
        state: String,
    },

    /// NOTIFY named a barrier the prepared script does not expose
    #[error("unknown barrier: {0}")]
    UnknownBarrier(String),
}
