//! # wirescript core
//!
//! Script model, semantic passes, execution engine and control lifecycle of
//! a network test robot. A script declares accept and connect streams, the
//! bytes each must read and write, and named barriers that order operations
//! across streams. The robot enacts the script against a live peer and
//! reports which barriers were reached.
//!
//! # Architecture
//!
//! ```text
//! text ──parse──> Script ──resolve──> Script ──ScriptRun::prepare──> RunHandle
//!                                                                     │
//!                   ControlSession <──── RunOutcome <──── start ──────┘
//! ```
//!
//! - [`ast`]: closed tagged variants for streams, operations, matchers and
//!   value generators, each carrying its source [`Region`](ast::Region).
//! - [`parser`]: line-oriented script text parser.
//! - [`passes`]: pure passes that inject implicit operations, associate
//!   streams and validate barriers.
//! - [`engine`]: per-stream handler pipelines over a pluggable
//!   [`ChannelProvider`](engine::ChannelProvider).
//! - [`control`]: the run lifecycle and a sans-IO control session driver.
//!
//! The control session follows the action pattern: it consumes events and
//! returns actions for the runtime to execute, so it can be driven by a TCP
//! server or directly from tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ast;
pub mod control;
pub mod engine;
pub mod error;
pub mod parser;
pub mod passes;

use std::sync::Arc;

pub use control::{ControlAction, ControlEvent, ControlSession, ControlState, Lifecycle};
pub use engine::{ChannelProvider, RunHandle, RunOutcome, ScriptRun};
pub use error::{
    ConnectionError, LifecycleError, ParseError, ProgressError, ScriptError, ValidationError,
};
pub use parser::parse;
pub use passes::resolve;

/// Parse and resolve script text.
///
/// # Errors
///
/// `ScriptError::Parse` or `ScriptError::Validation`.
pub fn compile(text: &str) -> Result<ast::Script, ScriptError> {
    let parsed = parse(text)?;
    Ok(resolve(parsed)?)
}

/// Parse, resolve and prepare script text.
///
/// # Errors
///
/// Any error of [`compile`], or `ScriptError::Connection` if an acceptor
/// cannot be bound.
pub async fn prepare_script(
    text: &str,
    provider: Arc<dyn ChannelProvider>,
) -> Result<ScriptRun, ScriptError> {
    let script = compile(text)?;
    ScriptRun::prepare(script, provider).await
}
