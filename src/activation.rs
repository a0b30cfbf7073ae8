//! Deferred, lock-safe wake-up of jobs.
//!
//! Code holding one thread's lock never activates a job directly. It adds the
//! job to an [`ActivationBatch`], and the batch is dispatched once the lock is
//! released, each activation taking only the target job's own thread lock.
//!
//! While a job step runs on an OS thread, that OS thread has an open step
//! scope. Any batch dispatched inside it (for example by a resource
//! integration signalling readiness from inside a job behavior) is folded
//! into the step's batch instead of running under the held lock.

use std::cell::RefCell;

use crate::error::Failure;
use crate::state_machine::Job;

thread_local! {
    static STEP_BATCH: RefCell<Option<ActivationBatch>> = const { RefCell::new(None) };
}

/// Collects jobs to activate after the current lock is released.
#[derive(Default)]
pub struct ActivationBatch {
    entries: Vec<(Job, Option<Failure>)>,
}

impl ActivationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, job: Job) {
        self.entries.push((job, None));
    }

    /// Adds `job` with a failure to deposit on its thread right before it is
    /// activated.
    pub fn add_failure(&mut self, job: Job, failure: Failure) {
        self.entries.push((job, Some(failure)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, other: ActivationBatch) {
        self.entries.extend(other.entries);
    }

    /// Activates every collected job, or hands them to the enclosing step.
    pub fn activate_all(self) {
        if self.entries.is_empty() {
            return;
        }
        let deferred = STEP_BATCH.with(|cell| match cell.borrow_mut().as_mut() {
            Some(step) => {
                step.entries.extend(self.entries);
                None
            }
            None => Some(self.entries),
        });
        let Some(entries) = deferred else {
            return;
        };
        for (job, failure) in entries {
            log::trace!("activating {job}");
            job.activate_now(failure);
        }
    }
}

/// Marks the current OS thread as running a job step.
///
/// Scopes nest; dropping a scope without [`finish`](StepScope::finish)
/// discards nothing, the collected entries move to the outer scope.
pub(crate) struct StepScope {
    outer: Option<ActivationBatch>,
    finished: bool,
}

impl StepScope {
    pub(crate) fn enter() -> Self {
        let outer = STEP_BATCH.with(|cell| cell.borrow_mut().replace(ActivationBatch::new()));
        Self {
            outer,
            finished: false,
        }
    }

    /// Closes the scope and returns what was deferred into it.
    pub(crate) fn finish(mut self) -> ActivationBatch {
        self.finished = true;
        let outer = self.outer.take();
        STEP_BATCH
            .with(|cell| std::mem::replace(&mut *cell.borrow_mut(), outer))
            .unwrap_or_default()
    }
}

impl Drop for StepScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let outer = self.outer.take();
        let pending = STEP_BATCH.with(|cell| std::mem::replace(&mut *cell.borrow_mut(), outer));
        if let Some(pending) = pending {
            // Unwinding out of a step: keep the wake-ups for whoever is outside.
            pending.activate_all();
        }
    }
}
