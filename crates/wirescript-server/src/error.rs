//! Server error types.

use std::fmt;

use wirescript_proto::ProtocolError;

/// Errors that end the robot or one controller session.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid control address, missing script root).
    ///
    /// Fatal at startup.
    Config(String),

    /// Transport error on the control connection.
    Transport(String),

    /// The controller sent bytes that do not frame as a control message.
    ///
    /// Fatal for that session; the robot keeps serving others.
    Protocol(ProtocolError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(err) => Some(err),
            Self::Config(_) | Self::Transport(_) => None,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn protocol_errors_keep_their_source() {
        let err = ServerError::from(ProtocolError::UnknownKind("BOGUS".to_string()));
        assert_eq!(err.to_string(), "protocol error: unknown message kind: \"BOGUS\"");
        assert!(err.source().is_some());
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let err = ServerError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, ServerError::Transport(_)));
        assert!(err.source().is_none());
    }
}
