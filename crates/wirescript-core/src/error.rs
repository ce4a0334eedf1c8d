//! Error types for the wirescript core.
//!
//! One enum per failure class, mirroring where the failure is detected:
//! parsing ([`ParseError`]), semantic passes ([`ValidationError`]), live
//! reads ([`ProgressError`]), transports ([`ConnectionError`]) and control
//! plane misuse ([`LifecycleError`]). [`ScriptError`] is the cloneable union
//! carried by completion futures and run outcomes.

use std::io;

use thiserror::Error;

use crate::{ast::Region, control::ControlState};

/// Malformed script text. Fails before any transformation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{region}: {message}")]
pub struct ParseError {
    /// Where the text stopped making sense
    pub region: Region,
    /// What was wrong
    pub message: String,
}

impl ParseError {
    /// Create a parse error at `region`.
    pub fn new(region: Region, message: impl Into<String>) -> Self {
        Self { region, message: message.into() }
    }
}

/// Structural defect detected by the semantic passes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A barrier is awaited but no stream notifies it
    #[error("{region}: barrier `{name}` is awaited but never notified")]
    UnresolvedBarrier {
        /// Barrier name
        name: String,
        /// First await of the barrier
        region: Region,
    },

    /// A barrier is notified by more than one operation
    #[error("{region}: barrier `{name}` is notified more than once")]
    DuplicateNotify {
        /// Barrier name
        name: String,
        /// Second notify of the barrier
        region: Region,
    },

    /// Awaits that can never be satisfied (wait cycle or notify behind its
    /// own await)
    #[error("{region}: barrier `{name}` can never be notified: waits form a cycle")]
    UnsatisfiableWait {
        /// Barrier the first stuck stream waits on
        name: String,
        /// The stuck await
        region: Region,
    },

    /// An accept or connect stream has no partner where one is required
    #[error("{region}: {role} stream at {location} has no matching peer")]
    UnassociatedStream {
        /// `accept` or `connect`
        role: &'static str,
        /// Stream location
        location: String,
        /// Stream declaration
        region: Region,
    },

    /// A stream names an accept peer that the script does not declare
    #[error("{region}: unknown accept peer `{name}`")]
    UnknownPeer {
        /// Peer name
        name: String,
        /// Stream declaration
        region: Region,
    },

    /// An operation is not legal at its position
    #[error("{region}: {message}")]
    IllegalOperation {
        /// Offending operation
        region: Region,
        /// What rule it breaks
        message: String,
    },
}

impl ValidationError {
    /// Barrier named by this error, if any.
    pub fn barrier(&self) -> Option<&str> {
        match self {
            Self::UnresolvedBarrier { name, .. }
            | Self::DuplicateNotify { name, .. }
            | Self::UnsatisfiableWait { name, .. } => Some(name),
            Self::UnassociatedStream { .. }
            | Self::UnknownPeer { .. }
            | Self::IllegalOperation { .. } => None,
        }
    }
}

/// A live read did not match, or a decode step failed. Fatal to its stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{region}: expected {expected}, observed {observed}")]
pub struct ProgressError {
    /// Operation that failed
    pub region: Region,
    /// Rendered expectation
    pub expected: String,
    /// Rendered bytes or event actually observed
    pub observed: String,
}

/// Transport-level failure surfaced by a channel provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The provider has no transport for this scheme
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The provider or channel rejected an option
    #[error("unsupported option `{name}`")]
    UnsupportedOption {
        /// Option name
        name: String,
    },

    /// Option value could not be interpreted
    #[error("invalid value {value:?} for option `{name}`")]
    InvalidOption {
        /// Option name
        name: String,
        /// Rejected value
        value: String,
    },

    /// Nothing is listening at the location
    #[error("connection refused: {0}")]
    Refused(String),

    /// Another acceptor is already bound at the location
    #[error("address in use: {0}")]
    AddressInUse(String),

    /// The acceptor stopped producing channels
    #[error("acceptor closed: {0}")]
    AcceptorClosed(String),

    /// Underlying I/O error
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Control-plane misuse of the lifecycle state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Invalid state transition attempted
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    IllegalState {
        /// Current state when the error occurred
        state: ControlState,
        /// Operation that was attempted
        operation: &'static str,
    },
}

/// Any failure that can end a handler, a stream or a run.
///
/// Cloneable so that one cause can be delivered to every listener of a
/// completion future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Script text did not parse
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Script failed a semantic pass
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A live read did not match
    #[error("progress error: {0}")]
    Progress(#[from] ProgressError),

    /// The transport failed
    #[error("connection error at {region}: {source}")]
    Connection {
        /// Operation that observed the failure
        region: Region,
        /// Transport failure
        source: ConnectionError,
    },

    /// Lifecycle misuse
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// The operation never ran because the pipeline before it failed
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The run was aborted by the controller
    #[error("aborted")]
    Aborted,

    /// A barrier's only notifier failed before notifying
    #[error("barrier `{name}` abandoned: {cause}")]
    BarrierAbandoned {
        /// Barrier name
        name: String,
        /// Rendered failure of the notifying stream
        cause: String,
    },

    /// Unexpected fault inside handler code, converted rather than escaping
    #[error("internal fault: {0}")]
    Fault(String),

    /// Script source could not be loaded
    #[error("script source error: {0}")]
    Source(String),
}

impl ScriptError {
    /// Wrap a transport failure observed at `region`.
    pub fn connection(region: Region, source: ConnectionError) -> Self {
        Self::Connection { region, source }
    }

    /// One-line summary used in control-plane ERROR messages.
    pub fn summary(&self) -> String {
        match self {
            Self::Parse(_) => "parse error".to_string(),
            Self::Validation(err) => match err.barrier() {
                Some(name) => format!("validation error: barrier {name}"),
                None => "validation error".to_string(),
            },
            Self::Progress(_) => "progress error".to_string(),
            Self::Connection { .. } => "connection error".to_string(),
            Self::Lifecycle(_) => "illegal state".to_string(),
            Self::Cancelled(_) => "cancelled".to_string(),
            Self::Aborted => "aborted".to_string(),
            Self::BarrierAbandoned { name, .. } => format!("barrier {name} abandoned"),
            Self::Fault(_) => "internal fault".to_string(),
            Self::Source(_) => "script source error".to_string(),
        }
    }

    /// True for failures that are a consequence of another failure rather
    /// than a root cause.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Aborted | Self::BarrierAbandoned { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_names_the_barrier() {
        let err = ScriptError::from(ValidationError::UnresolvedBarrier {
            name: "b1".to_string(),
            region: Region::new(3, 5),
        });

        insta::assert_snapshot!(err.summary(), @"validation error: barrier b1");
        insta::assert_snapshot!(
            err.to_string(),
            @"validation error: 3:5: barrier `b1` is awaited but never notified"
        );
    }

    #[test]
    fn consequences_are_secondary() {
        assert!(ScriptError::Aborted.is_secondary());
        assert!(ScriptError::Cancelled("prior failure".to_string()).is_secondary());
        assert!(!ScriptError::Fault("boom".to_string()).is_secondary());
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let err = ConnectionError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        assert_eq!(err, ConnectionError::Transport("pipe closed".to_string()));
    }
}
