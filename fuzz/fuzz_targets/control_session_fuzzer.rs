//! Fuzz target for the control session state machine
//!
//! Drives a ControlSession with arbitrary interleavings of controller
//! messages and engine events.
//!
//! # Invariants
//!
//! - The session never panics
//! - START is acknowledged with STARTED at most once per prepared run

#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use wirescript_core::{ControlAction, ControlEvent, ControlSession, ScriptError};
use wirescript_proto::{ControlMessage, MessageKind};

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Prepare,
    Start,
    Abort,
    Notify(u8),
    Prepared(Vec<u8>),
    PrepareFailed,
    BarrierNotified(u8),
    Fault,
}

fn barrier(n: u8) -> String {
    format!("b{}", n % 4)
}

fuzz_target!(|steps: Vec<Step>| {
    let mut session = ControlSession::new();
    let mut started = 0usize;

    for step in steps {
        let event = match step {
            Step::Prepare => {
                ControlEvent::MessageReceived(ControlMessage::prepare("accept tcp://h:1\n"))
            },
            Step::Start => ControlEvent::MessageReceived(ControlMessage::start()),
            Step::Abort => ControlEvent::MessageReceived(ControlMessage::abort()),
            Step::Notify(n) => ControlEvent::MessageReceived(ControlMessage::notify(barrier(n))),
            Step::Prepared(names) => {
                started = 0;
                ControlEvent::Prepared {
                    barriers: names.into_iter().map(barrier).collect(),
                    script: Bytes::from_static(b"accept tcp://h:1\n"),
                }
            },
            Step::PrepareFailed => {
                ControlEvent::PrepareFailed(ScriptError::Source("missing".to_string()))
            },
            Step::BarrierNotified(n) => ControlEvent::BarrierNotified(barrier(n)),
            Step::Fault => ControlEvent::Fault(ScriptError::Fault("worker".to_string())),
        };

        for action in session.handle(event) {
            if let ControlAction::Send(message) = action {
                if message.kind == MessageKind::Started {
                    started += 1;
                    assert!(started <= 1, "START acknowledged twice");
                }
            }
        }
    }
});
