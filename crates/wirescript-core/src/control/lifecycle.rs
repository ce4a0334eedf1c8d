//! Run lifecycle state machine.
//!
//! ```text
//! ┌──────┐ prepared ┌──────────┐ startable ┌───────────┐ finished ┌──────────┐
//! │ Init │─────────>│ Prepared │──────────>│ Startable │─────────>│ Finished │
//! └──────┘          └──────────┘           └───────────┘          └──────────┘
//!    │                   │                                             ↑
//!    └───────────────────┴──────────────── finished ───────────────────┘
//! ```
//!
//! Each transition completes a latch that controller-side waiters can await.
//! Latches are completed after the state lock is released, so their listeners
//! may call back into the lifecycle. Abort drives the machine through the
//! latches it has not reached yet so that no waiter blocks on a run that
//! will never start. A fault captured from a worker fails every pending latch
//! exactly once.
//!
//! PREPARE may be repeated after an abort issued from `Init` (a failed
//! prepare may be retried) but not after an abort from `Prepared` or
//! `Startable`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::{
    engine::{CompletionFuture, Outcome},
    error::{LifecycleError, ScriptError},
};

/// Lifecycle state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlState {
    /// Nothing prepared yet
    Init,
    /// Script resolved, channels bound, barriers created
    Prepared,
    /// Execution released
    Startable,
    /// Run over
    Finished,
}

/// Where a captured fault happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// The controlling task itself; nothing to interrupt
    Controller,
    /// A worker task; pending controller waiters are interrupted
    Worker,
}

#[derive(Debug, Default)]
struct Latches {
    prepared: CompletionFuture,
    startable: CompletionFuture,
    finished: CompletionFuture,
}

impl Latches {
    fn all(&self) -> Vec<CompletionFuture> {
        vec![self.prepared.clone(), self.startable.clone(), self.finished.clone()]
    }
}

fn release(latches: Vec<CompletionFuture>, outcome: &Outcome) {
    for latch in latches {
        latch.complete(outcome.clone());
    }
}

#[derive(Debug)]
struct Inner {
    state: ControlState,
    aborted_from: Option<ControlState>,
    fault: Option<ScriptError>,
    interrupted: bool,
    latches: Latches,
}

/// Shared handle to a run's lifecycle.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Lifecycle in [`ControlState::Init`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ControlState::Init,
                aborted_from: None,
                fault: None,
                interrupted: false,
                latches: Latches::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> ControlState {
        self.lock().state
    }

    /// State the first abort was issued from, if any.
    pub fn aborted_from(&self) -> Option<ControlState> {
        self.lock().aborted_from
    }

    /// First captured fault, if any.
    pub fn fault(&self) -> Option<ScriptError> {
        self.lock().fault.clone()
    }

    /// True if PREPARE is legal now.
    pub fn can_prepare(&self) -> bool {
        let inner = self.lock();
        inner.state == ControlState::Init || inner.aborted_from == Some(ControlState::Init)
    }

    /// `Init → Prepared`. Also legal after an abort issued from `Init`, in
    /// which case the lifecycle starts over with fresh latches.
    ///
    /// # Errors
    ///
    /// `LifecycleError::IllegalState` from any other state.
    pub fn notify_prepared(&self) -> Result<(), LifecycleError> {
        let latch = {
            let mut inner = self.lock();
            if inner.state != ControlState::Init {
                if inner.aborted_from != Some(ControlState::Init) {
                    return Err(LifecycleError::IllegalState {
                        state: inner.state,
                        operation: "prepare",
                    });
                }
                debug!(from = ?inner.state, "lifecycle reset for prepare retry");
                inner.latches = Latches::default();
                inner.aborted_from = None;
                inner.fault = None;
                inner.interrupted = false;
            }
            inner.state = ControlState::Prepared;
            inner.latches.prepared.clone()
        };
        debug!("lifecycle prepared");
        latch.succeed();
        Ok(())
    }

    /// `Prepared → Startable`. A no-op once `Startable` or `Finished`.
    ///
    /// # Errors
    ///
    /// `LifecycleError::IllegalState` from `Init`.
    pub fn notify_startable(&self) -> Result<(), LifecycleError> {
        let latch = {
            let mut inner = self.lock();
            match inner.state {
                ControlState::Init => {
                    return Err(LifecycleError::IllegalState {
                        state: inner.state,
                        operation: "start",
                    });
                },
                ControlState::Prepared => {
                    inner.state = ControlState::Startable;
                    inner.latches.startable.clone()
                },
                ControlState::Startable | ControlState::Finished => return Ok(()),
            }
        };
        debug!("lifecycle startable");
        latch.succeed();
        Ok(())
    }

    /// `Prepared | Startable → Finished`. From `Init` the machine passes
    /// through `Prepared` first.
    ///
    /// # Errors
    ///
    /// `LifecycleError::IllegalState` if already `Finished`.
    pub fn notify_finished(&self) -> Result<(), LifecycleError> {
        let latches = {
            let mut inner = self.lock();
            let mut latches = Vec::with_capacity(2);
            match inner.state {
                ControlState::Finished => {
                    return Err(LifecycleError::IllegalState {
                        state: inner.state,
                        operation: "finish",
                    });
                },
                ControlState::Init => latches.push(inner.latches.prepared.clone()),
                ControlState::Prepared | ControlState::Startable => {},
            }
            inner.state = ControlState::Finished;
            latches.push(inner.latches.finished.clone());
            latches
        };
        debug!("lifecycle finished");
        release(latches, &Ok(()));
        Ok(())
    }

    /// Drive the machine to `Startable` without running anything. Only the
    /// first abort is recorded. Returns the state the abort was issued from.
    pub fn notify_abort(&self) -> ControlState {
        let (from, latches) = {
            let mut inner = self.lock();
            let from = inner.state;
            if inner.aborted_from.is_none() {
                inner.aborted_from = Some(from);
            }
            let mut latches = Vec::new();
            if matches!(from, ControlState::Init | ControlState::Prepared) {
                latches.push(inner.latches.prepared.clone());
                latches.push(inner.latches.startable.clone());
                inner.state = ControlState::Startable;
            }
            (from, latches)
        };
        debug!(?from, "lifecycle aborted");
        release(latches, &Ok(()));
        from
    }

    /// Record a fault. The first worker fault fails every latch still
    /// pending; later faults are recorded only if none was recorded before.
    /// Returns `true` if this call interrupted the waiters.
    pub fn capture_fault(&self, origin: FaultOrigin, cause: ScriptError) -> bool {
        let latches = {
            let mut inner = self.lock();
            if inner.fault.is_none() {
                inner.fault = Some(cause.clone());
            }
            if origin == FaultOrigin::Controller || inner.interrupted {
                return false;
            }
            inner.interrupted = true;
            inner.latches.all()
        };
        debug!(%cause, "lifecycle interrupted by worker fault");
        release(latches, &Err(cause));
        true
    }

    /// Capture the first failure of `faults` as a worker fault.
    pub fn capture_worker_faults(&self, faults: &CompletionFuture) {
        let lifecycle = self.clone();
        faults.add_listener(move |outcome| {
            if let Err(cause) = outcome {
                lifecycle.capture_fault(FaultOrigin::Worker, cause.clone());
            }
        });
    }

    /// Wait for `Prepared`.
    pub async fn prepared(&self) -> Outcome {
        let latch = self.lock().latches.prepared.clone();
        latch.wait().await
    }

    /// Wait for `Startable`.
    pub async fn startable(&self) -> Outcome {
        let latch = self.lock().latches.startable.clone();
        latch.wait().await
    }

    /// Wait for `Finished`.
    pub async fn finished(&self) -> Outcome {
        let latch = self.lock().latches.finished.clone();
        latch.wait().await
    }
}
