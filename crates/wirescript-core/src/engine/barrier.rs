//! Named synchronization barriers.
//!
//! A barrier moves once from pending to either notified or abandoned. The
//! transition is a compare-and-swap on an atomic state byte; the winner
//! completes the barrier's [`CompletionFuture`], which wakes every awaiter.
//! Losers observe `false` and change nothing, so notify is idempotent.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tracing::debug;

use super::future::{CompletionFuture, Outcome};
use crate::{
    ast::{Script, is_internal},
    error::ScriptError,
};

const PENDING: u8 = 0;
const NOTIFIED: u8 = 1;
const ABANDONED: u8 = 2;

/// One named barrier.
#[derive(Debug)]
pub struct Barrier {
    name: String,
    state: AtomicU8,
    completion: CompletionFuture,
}

impl Barrier {
    /// Pending barrier.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(PENDING),
            completion: CompletionFuture::new(),
        }
    }

    fn leave_pending(&self, to: u8) -> bool {
        self.state.compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Barrier name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for synthesized barriers hidden from the controller.
    pub fn is_internal(&self) -> bool {
        is_internal(&self.name)
    }

    /// Move to notified. Returns `true` only for the call that made the
    /// transition.
    pub fn notify(&self) -> bool {
        if !self.leave_pending(NOTIFIED) {
            return false;
        }
        debug!(barrier = %self.name, "barrier notified");
        self.completion.succeed();
        true
    }

    /// Fail every awaiter because the only notifier failed with `cause`.
    /// Returns `false` if the barrier already left the pending state.
    pub fn abandon(&self, cause: &ScriptError) -> bool {
        if !self.leave_pending(ABANDONED) {
            return false;
        }
        debug!(barrier = %self.name, %cause, "barrier abandoned");
        self.completion.fail(ScriptError::BarrierAbandoned {
            name: self.name.clone(),
            cause: cause.to_string(),
        });
        true
    }

    /// True once notified.
    pub fn is_notified(&self) -> bool {
        self.state.load(Ordering::Acquire) == NOTIFIED
    }

    /// Run `listener` when the barrier leaves the pending state.
    pub fn add_listener(&self, listener: impl FnOnce(&Outcome) + Send + 'static) {
        self.completion.add_listener(listener);
    }

    /// Wait until notified. Fails if the barrier is abandoned.
    pub async fn wait(&self) -> Outcome {
        self.completion.wait().await
    }
}

/// Every barrier of one run, keyed by name.
#[derive(Debug, Default)]
pub struct BarrierMap {
    barriers: BTreeMap<String, Arc<Barrier>>,
}

impl BarrierMap {
    /// One pending barrier per name awaited or notified in `script`.
    pub fn for_script(script: &Script) -> Self {
        let barriers = script
            .barrier_names()
            .into_iter()
            .map(|name| (name.clone(), Arc::new(Barrier::new(name))))
            .collect();
        Self { barriers }
    }

    /// Barrier by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Barrier>> {
        self.barriers.get(name)
    }

    /// Barrier by name, excluding synthesized barriers.
    pub fn user_visible(&self, name: &str) -> Option<&Arc<Barrier>> {
        self.get(name).filter(|barrier| !barrier.is_internal())
    }

    /// User-visible barriers, sorted by name.
    pub fn user_barriers(&self) -> impl Iterator<Item = &Arc<Barrier>> {
        self.barriers.values().filter(|barrier| !barrier.is_internal())
    }

    /// Names of user-visible barriers that were notified.
    pub fn notified_names(&self) -> Vec<String> {
        self.user_barriers().filter(|b| b.is_notified()).map(|b| b.name.clone()).collect()
    }

    /// Names of user-visible barriers that were not notified.
    pub fn awaiting_names(&self) -> Vec<String> {
        self.user_barriers().filter(|b| !b.is_notified()).map(|b| b.name.clone()).collect()
    }
}
