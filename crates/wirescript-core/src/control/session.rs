//! Control session state machine.
//!
//! Sans-IO driver for one controller connection. Inbound control messages
//! and engine events go in through [`ControlSession::handle`]; the actions
//! that come out are executed by the runtime (send a message, prepare or
//! start the run, abort it, notify a barrier). Lifecycle transitions are
//! delegated to [`Lifecycle`].

use std::collections::BTreeSet;

use bytes::Bytes;
use tracing::{debug, warn};
use wirescript_proto::{ControlMessage, MessageKind, ProtocolError, headers};

use super::lifecycle::{ControlState, FaultOrigin, Lifecycle};
use crate::{ast::is_internal, engine::RunOutcome, error::ScriptError};

/// Summary header of ERROR replies to malformed or ill-timed requests.
pub const PROTOCOL_ERROR: &str = "protocol error";

/// Inputs to the session.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// A message arrived from the controller
    MessageReceived(ControlMessage),

    /// The run requested by a `Prepare` action is ready
    Prepared {
        /// User-visible barriers of the run
        barriers: Vec<String>,
        /// Script text the run was prepared from
        script: Bytes,
    },

    /// The run requested by a `Prepare` action could not be prepared
    PrepareFailed(ScriptError),

    /// A user-visible barrier reached the notified state
    BarrierNotified(String),

    /// Every stream of the run ended
    Finished(RunOutcome),

    /// A worker task failed outside handler code
    Fault(ScriptError),
}

/// Outputs of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Send this message to the controller
    Send(ControlMessage),

    /// Load, resolve and prepare a script
    Prepare {
        /// Inline script text
        script: Option<Bytes>,
        /// Script names to load when there is no inline text
        names: Vec<String>,
    },

    /// Release the prepared run
    Start,

    /// Cancel the run
    Abort,

    /// Notify a barrier on behalf of the controller
    NotifyBarrier(String),
}

/// Control-plane state of one controller connection.
#[derive(Debug, Default)]
pub struct ControlSession {
    lifecycle: Lifecycle,
    preparing: bool,
    barriers: BTreeSet<String>,
    reported: BTreeSet<String>,
}

impl ControlSession {
    /// Session in [`ControlState::Init`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControlState {
        self.lifecycle.state()
    }

    /// Shared lifecycle handle.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Process one event and return the actions to execute, in order.
    pub fn handle(&mut self, event: ControlEvent) -> Vec<ControlAction> {
        match event {
            ControlEvent::MessageReceived(message) => self.handle_message(&message),
            ControlEvent::Prepared { barriers, script } => self.handle_prepared(barriers, script),
            ControlEvent::PrepareFailed(cause) => self.handle_prepare_failed(&cause),
            ControlEvent::BarrierNotified(name) => self.handle_barrier_notified(name),
            ControlEvent::Finished(outcome) => self.handle_finished(&outcome),
            ControlEvent::Fault(cause) => self.handle_fault(cause),
        }
    }

    fn handle_message(&mut self, message: &ControlMessage) -> Vec<ControlAction> {
        debug!(kind = %message.kind, state = ?self.state(), "control message");
        match message.kind {
            MessageKind::Prepare => self.handle_prepare(message),
            MessageKind::Start => self.handle_start(),
            MessageKind::Abort => self.handle_abort(),
            MessageKind::Notify => self.handle_notify(message),
            MessageKind::Prepared
            | MessageKind::Started
            | MessageKind::Notified
            | MessageKind::Finished
            | MessageKind::Error => self.unexpected(message.kind),
        }
    }

    fn handle_prepare(&mut self, message: &ControlMessage) -> Vec<ControlAction> {
        if self.preparing || !self.lifecycle.can_prepare() {
            return self.unexpected(MessageKind::Prepare);
        }
        self.preparing = true;
        let names = message.header_values(headers::NAME).map(str::to_string).collect();
        vec![ControlAction::Prepare { script: message.content.clone(), names }]
    }

    fn handle_start(&mut self) -> Vec<ControlAction> {
        match self.state() {
            ControlState::Prepared => {
                if self.lifecycle.notify_startable().is_err() {
                    return self.unexpected(MessageKind::Start);
                }
                vec![ControlAction::Start, ControlAction::Send(ControlMessage::started())]
            },
            ControlState::Startable | ControlState::Finished => Vec::new(),
            ControlState::Init => self.unexpected(MessageKind::Start),
        }
    }

    fn handle_abort(&mut self) -> Vec<ControlAction> {
        let from = self.lifecycle.notify_abort();
        match from {
            ControlState::Init if !self.preparing => {
                self.finish_lifecycle();
                vec![ControlAction::Send(ControlMessage::finished(
                    Vec::<String>::new(),
                    Vec::<String>::new(),
                    None,
                ))]
            },
            ControlState::Finished => Vec::new(),
            _ => vec![ControlAction::Abort],
        }
    }

    fn handle_notify(&mut self, message: &ControlMessage) -> Vec<ControlAction> {
        if !matches!(self.state(), ControlState::Prepared | ControlState::Startable) {
            return self.unexpected(MessageKind::Notify);
        }
        let Some(name) = message.header(headers::BARRIER) else {
            return protocol_error(&ProtocolError::MissingHeader(headers::BARRIER));
        };
        if is_internal(name) || !self.barriers.contains(name) {
            return protocol_error(&ProtocolError::UnknownBarrier(name.to_string()));
        }
        vec![ControlAction::NotifyBarrier(name.to_string())]
    }

    fn handle_prepared(&mut self, barriers: Vec<String>, script: Bytes) -> Vec<ControlAction> {
        self.preparing = false;
        if let Err(err) = self.lifecycle.notify_prepared() {
            warn!(%err, "prepared run rejected by lifecycle");
            return vec![ControlAction::Abort, error_message(&ScriptError::Lifecycle(err))];
        }
        self.barriers = barriers.into_iter().filter(|name| !is_internal(name)).collect();
        self.reported.clear();
        let visible: Vec<&String> = self.barriers.iter().collect();
        vec![ControlAction::Send(ControlMessage::prepared(visible, Some(script)))]
    }

    fn handle_prepare_failed(&mut self, cause: &ScriptError) -> Vec<ControlAction> {
        self.preparing = false;
        warn!(%cause, "prepare failed");
        if self.lifecycle.notify_abort() != ControlState::Finished {
            self.finish_lifecycle();
        }
        vec![error_message(cause)]
    }

    fn handle_barrier_notified(&mut self, name: String) -> Vec<ControlAction> {
        if is_internal(&name)
            || !self.barriers.contains(&name)
            || !self.reported.insert(name.clone())
        {
            return Vec::new();
        }
        vec![ControlAction::Send(ControlMessage::notified(name))]
    }

    fn handle_finished(&mut self, outcome: &RunOutcome) -> Vec<ControlAction> {
        self.finish_lifecycle();
        if let Some(cause) = outcome.root_cause() {
            debug!(%cause, "run failed");
        }
        vec![ControlAction::Send(ControlMessage::finished(
            &outcome.notified,
            &outcome.awaiting,
            Some(Bytes::from(outcome.observed_script())),
        ))]
    }

    fn handle_fault(&mut self, cause: ScriptError) -> Vec<ControlAction> {
        let report = error_message(&cause);
        self.lifecycle.capture_fault(FaultOrigin::Worker, cause);
        vec![ControlAction::Abort, report]
    }

    fn unexpected(&self, kind: MessageKind) -> Vec<ControlAction> {
        protocol_error(&ProtocolError::UnexpectedKind {
            kind: kind.to_string(),
            state: format!("{:?}", self.state()),
        })
    }

    fn finish_lifecycle(&self) {
        if self.lifecycle.state() != ControlState::Finished {
            if let Err(err) = self.lifecycle.notify_finished() {
                warn!(%err, "finish rejected by lifecycle");
            }
        }
    }
}

fn error_message(cause: &ScriptError) -> ControlAction {
    ControlAction::Send(ControlMessage::error(cause.summary(), cause.to_string()))
}

fn protocol_error(cause: &ProtocolError) -> Vec<ControlAction> {
    warn!(%cause, "protocol error");
    vec![ControlAction::Send(ControlMessage::error(PROTOCOL_ERROR, cause.to_string()))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::Region,
        engine::StreamOutcome,
        error::ValidationError,
    };

    fn sent(actions: &[ControlAction]) -> Vec<MessageKind> {
        actions
            .iter()
            .filter_map(|action| match action {
                ControlAction::Send(message) => Some(message.kind),
                _ => None,
            })
            .collect()
    }

    fn received(session: &mut ControlSession, message: ControlMessage) -> Vec<ControlAction> {
        session.handle(ControlEvent::MessageReceived(message))
    }

    fn prepared_session(barriers: &[&str]) -> ControlSession {
        let mut session = ControlSession::new();
        let actions = received(&mut session, ControlMessage::prepare("script"));
        assert!(matches!(actions.as_slice(), [ControlAction::Prepare { .. }]));
        let actions = session.handle(ControlEvent::Prepared {
            barriers: barriers.iter().map(ToString::to_string).collect(),
            script: Bytes::from_static(b"script"),
        });
        assert_eq!(sent(&actions), vec![MessageKind::Prepared]);
        session
    }

    fn outcome(notified: &[&str], awaiting: &[&str]) -> RunOutcome {
        RunOutcome {
            streams: vec![StreamOutcome {
                label: "accept tcp://localhost:9000 (1:1)".to_string(),
                region: Region::new(1, 1),
                completed: 3,
                result: Ok(()),
                observed: "accept \"tcp://localhost:9000\"\n".to_string(),
            }],
            notified: notified.iter().map(ToString::to_string).collect(),
            awaiting: awaiting.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn prepare_forwards_inline_script_and_names() {
        let mut session = ControlSession::new();
        let actions = received(&mut session, ControlMessage::prepare_named(["a.ws", "b.ws"]));
        assert_eq!(actions, vec![ControlAction::Prepare {
            script: None,
            names: vec!["a.ws".to_string(), "b.ws".to_string()],
        }]);
    }

    #[test]
    fn prepared_hides_internal_barriers() {
        let session = prepared_session(&["b1", "~bound~0"]);
        assert_eq!(session.barriers.iter().collect::<Vec<_>>(), vec!["b1"]);
        assert_eq!(session.state(), ControlState::Prepared);
    }

    #[test]
    fn start_sends_started_once() {
        let mut session = prepared_session(&[]);
        let actions = received(&mut session, ControlMessage::start());
        assert_eq!(actions[0], ControlAction::Start);
        assert_eq!(sent(&actions), vec![MessageKind::Started]);

        let again = received(&mut session, ControlMessage::start());
        assert!(again.is_empty());
    }

    #[test]
    fn start_before_prepare_is_a_protocol_error() {
        let mut session = ControlSession::new();
        let actions = received(&mut session, ControlMessage::start());
        let [ControlAction::Send(message)] = actions.as_slice() else {
            panic!("expected one ERROR, got {actions:?}");
        };
        assert_eq!(message.header(headers::SUMMARY), Some(PROTOCOL_ERROR));
        insta::assert_snapshot!(
            message.content_str().unwrap(),
            @"unexpected START message in state Init"
        );
    }

    #[test]
    fn notify_requires_known_user_barrier() {
        let mut session = prepared_session(&["b1", "~bound~0"]);

        let ok = received(&mut session, ControlMessage::notify("b1"));
        assert_eq!(ok, vec![ControlAction::NotifyBarrier("b1".to_string())]);

        for name in ["nope", "~bound~0"] {
            let rejected = received(&mut session, ControlMessage::notify(name));
            let [ControlAction::Send(message)] = rejected.as_slice() else {
                panic!("expected one ERROR, got {rejected:?}");
            };
            let expected = ProtocolError::UnknownBarrier(name.to_string()).to_string();
            assert_eq!(message.content_str(), Some(expected.as_str()));
        }
    }

    #[test]
    fn notify_without_barrier_header_is_rejected() {
        let mut session = prepared_session(&["b1"]);
        let mut message = ControlMessage::notify("b1");
        message.headers.clear();

        let rejected = received(&mut session, message);
        let [ControlAction::Send(error)] = rejected.as_slice() else {
            panic!("expected one ERROR, got {rejected:?}");
        };
        let expected = ProtocolError::MissingHeader(headers::BARRIER).to_string();
        assert_eq!(error.content_str(), Some(expected.as_str()));
    }

    #[test]
    fn barrier_notifications_are_reported_once() {
        let mut session = prepared_session(&["b1"]);
        let first = session.handle(ControlEvent::BarrierNotified("b1".to_string()));
        let second = session.handle(ControlEvent::BarrierNotified("b1".to_string()));
        let internal = session.handle(ControlEvent::BarrierNotified("~bound~0".to_string()));

        assert_eq!(sent(&first), vec![MessageKind::Notified]);
        assert!(second.is_empty());
        assert!(internal.is_empty());
    }

    #[test]
    fn abort_before_prepare_finishes_immediately() {
        let mut session = ControlSession::new();
        let actions = received(&mut session, ControlMessage::abort());
        assert_eq!(sent(&actions), vec![MessageKind::Finished]);
        assert_eq!(session.state(), ControlState::Finished);

        let retry = received(&mut session, ControlMessage::prepare("script"));
        assert!(matches!(retry.as_slice(), [ControlAction::Prepare { .. }]));
    }

    #[test]
    fn abort_after_start_forbids_prepare() {
        let mut session = prepared_session(&[]);
        received(&mut session, ControlMessage::start());
        let actions = received(&mut session, ControlMessage::abort());
        assert_eq!(actions, vec![ControlAction::Abort]);

        let finished = session.handle(ControlEvent::Finished(outcome(&[], &[])));
        assert_eq!(sent(&finished), vec![MessageKind::Finished]);

        let retry = received(&mut session, ControlMessage::prepare("script"));
        assert_eq!(sent(&retry), vec![MessageKind::Error]);
    }

    #[test]
    fn prepare_failure_reports_error_and_permits_retry() {
        let mut session = ControlSession::new();
        received(&mut session, ControlMessage::prepare("script"));
        let cause = ScriptError::from(ValidationError::UnresolvedBarrier {
            name: "b1".to_string(),
            region: Region::new(2, 1),
        });
        let actions = session.handle(ControlEvent::PrepareFailed(cause));

        let [ControlAction::Send(message)] = actions.as_slice() else {
            panic!("expected one ERROR, got {actions:?}");
        };
        assert_eq!(message.kind, MessageKind::Error);
        assert_eq!(message.header(headers::SUMMARY), Some("validation error: barrier b1"));

        let retry = received(&mut session, ControlMessage::prepare("script"));
        assert!(matches!(retry.as_slice(), [ControlAction::Prepare { .. }]));
    }

    #[test]
    fn finished_lists_barriers() {
        let mut session = prepared_session(&["b1", "b2"]);
        received(&mut session, ControlMessage::start());
        let actions = session.handle(ControlEvent::Finished(outcome(&["b1"], &["b2"])));

        let [ControlAction::Send(message)] = actions.as_slice() else {
            panic!("expected FINISHED, got {actions:?}");
        };
        assert_eq!(message.header_values(headers::NOTIFIED).collect::<Vec<_>>(), vec!["b1"]);
        assert_eq!(message.header_values(headers::AWAITING).collect::<Vec<_>>(), vec!["b2"]);
        assert_eq!(session.state(), ControlState::Finished);
    }

    #[test]
    fn fault_aborts_and_reports() {
        let mut session = prepared_session(&[]);
        let cause = ScriptError::Fault("worker died".to_string());
        let actions = session.handle(ControlEvent::Fault(cause));
        assert_eq!(actions[0], ControlAction::Abort);
        assert_eq!(sent(&actions), vec![MessageKind::Error]);
        assert!(session.lifecycle().fault().is_some());
    }

    #[test]
    fn robot_kinds_from_controller_are_rejected() {
        let mut session = ControlSession::new();
        let actions = received(&mut session, ControlMessage::started());
        assert_eq!(sent(&actions), vec![MessageKind::Error]);
    }
}
