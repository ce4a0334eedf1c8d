//! One-shot completion promise with listeners.
//!
//! A [`CompletionFuture`] starts pending and completes exactly once, either
//! succeeded or failed with a cause. Listeners run in attachment order, after
//! the internal lock is released, so a listener may attach further listeners
//! or complete other futures. A listener attached after completion runs
//! immediately on the attaching thread.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::sync::oneshot;

use crate::error::ScriptError;

/// Result delivered to listeners.
pub type Outcome = Result<(), ScriptError>;

type Listener = Box<dyn FnOnce(&Outcome) + Send>;

enum State {
    Pending(Vec<Listener>),
    Complete(Outcome),
}

/// Shared, cloneable completion promise.
#[derive(Clone)]
pub struct CompletionFuture {
    state: Arc<Mutex<State>>,
}

impl Default for CompletionFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionFuture").field("outcome", &self.outcome()).finish()
    }
}

impl CompletionFuture {
    /// Pending future.
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(State::Pending(Vec::new()))) }
    }

    /// Complete with `outcome`. Returns `false` if already complete, in which
    /// case nothing changes.
    pub fn complete(&self, outcome: Outcome) -> bool {
        let listeners = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *state {
                State::Complete(_) => return false,
                State::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = State::Complete(outcome.clone());
                    listeners
                },
            }
        };

        for listener in listeners {
            listener(&outcome);
        }
        true
    }

    /// Complete successfully.
    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Complete with a failure.
    pub fn fail(&self, cause: ScriptError) -> bool {
        self.complete(Err(cause))
    }

    /// Outcome if complete.
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Pending(_) => None,
            State::Complete(outcome) => Some(outcome.clone()),
        }
    }

    /// True once completed either way.
    pub fn is_done(&self) -> bool {
        self.outcome().is_some()
    }

    /// Run `listener` on completion, or now if already complete.
    pub fn add_listener(&self, listener: impl FnOnce(&Outcome) + Send + 'static) {
        let completed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                },
                State::Complete(outcome) => outcome.clone(),
            }
        };
        listener(&completed);
    }

    /// Wait for completion.
    pub async fn wait(&self) -> Outcome {
        let (tx, rx) = oneshot::channel();
        self.add_listener(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        rx.await
            .unwrap_or_else(|_| Err(ScriptError::Fault("completion listener dropped".to_string())))
    }

    /// Conjunction: succeeds once every input succeeds, fails as soon as any
    /// input fails (with that input's cause). Succeeds immediately for an
    /// empty input.
    pub fn all<'a>(futures: impl IntoIterator<Item = &'a CompletionFuture>) -> CompletionFuture {
        let result = CompletionFuture::new();
        let futures: Vec<&CompletionFuture> = futures.into_iter().collect();
        if futures.is_empty() {
            result.succeed();
            return result;
        }

        let remaining = Arc::new(AtomicUsize::new(futures.len()));
        for future in futures {
            let result = result.clone();
            let remaining = Arc::clone(&remaining);
            future.add_listener(move |outcome| match outcome {
                Ok(()) => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        result.succeed();
                    }
                },
                Err(cause) => {
                    result.fail(cause.clone());
                },
            });
        }
        result
    }
}
