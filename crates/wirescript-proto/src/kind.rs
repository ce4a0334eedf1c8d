//! Control message kinds.
//!
//! Requests flow from the controller to the robot (`PREPARE`, `START`,
//! `ABORT`, `NOTIFY`); responses and events flow back (`PREPARED`,
//! `STARTED`, `NOTIFIED`, `FINISHED`, `ERROR`).

use std::fmt;

/// Kind of a control message, carried on the first line of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Controller asks the robot to resolve a script and bind its acceptors
    Prepare,
    /// Robot reports the script is resolved and bound
    Prepared,
    /// Controller releases execution
    Start,
    /// Robot reports execution was released
    Started,
    /// Controller cancels the run
    Abort,
    /// Controller notifies a barrier
    Notify,
    /// Robot reports a barrier reached the notified state
    Notified,
    /// Robot reports the run completed
    Finished,
    /// Robot reports a failure outside normal script completion
    Error,
}

impl MessageKind {
    /// All kinds, in wire-documentation order.
    pub const ALL: [Self; 9] = [
        Self::Prepare,
        Self::Prepared,
        Self::Start,
        Self::Started,
        Self::Abort,
        Self::Notify,
        Self::Notified,
        Self::Finished,
        Self::Error,
    ];

    /// Name as written on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "PREPARE",
            Self::Prepared => "PREPARED",
            Self::Start => "START",
            Self::Started => "STARTED",
            Self::Abort => "ABORT",
            Self::Notify => "NOTIFY",
            Self::Notified => "NOTIFIED",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
        }
    }

    /// Parse a wire name. `None` if unrecognized.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// True for kinds a controller sends to the robot.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(self, Self::Prepare | Self::Start | Self::Abort | Self::Notify)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
