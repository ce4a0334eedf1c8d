//! Execution engine.
//!
//! The engine runs a resolved [`Script`](crate::ast::Script) against a
//! [`ChannelProvider`]. It owns no sockets itself: transports plug in at the
//! provider seam, so the same engine drives TCP in the robot and in-memory
//! duplex channels in tests.

mod barrier;
mod channel;
mod future;
mod handler;
mod matcher;
mod run;

pub use barrier::{Barrier, BarrierMap};
pub use channel::{Acceptor, BoxedIo, Channel, ChannelIo, ChannelProvider, parse_bool};
pub use future::{CompletionFuture, Outcome};
pub use handler::Handler;
pub use matcher::{MAX_HTTP_HEAD, Matched, Variables, render, try_match};
pub use run::{RunHandle, RunOutcome, ScriptRun, StreamOutcome};
