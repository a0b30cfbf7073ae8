//! Waits and their timeouts.
//!
//! Every suspension on something outside the job (a resource becoming ready,
//! a joined flow completing, an async signal) is a [`Wait`]. A wait settles
//! exactly once, either resolved by whatever it waited on or failed, and
//! settling wakes the waiting job through an [`ActivationBatch`].
//!
//! The [`Monitor`] holds deadlines for waits that can time out and fails them
//! with their typed failure when [`Monitor::check_at`] passes the deadline.
//! A ticking monitor starts its own checker thread with the first deadline.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::activation::ActivationBatch;
use crate::error::Failure;
use crate::state_machine::Job;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WaitOutcome {
    Pending,
    Resolved,
    Failed(Failure),
}

pub(crate) struct Wait {
    job: Job,
    outcome: Mutex<WaitOutcome>,
}

impl Wait {
    pub(crate) fn new(job: Job) -> Arc<Self> {
        Arc::new(Self {
            job,
            outcome: Mutex::new(WaitOutcome::Pending),
        })
    }

    /// Settles the wait as resolved. Returns false if it was already settled.
    pub(crate) fn resolve(&self, batch: &mut ActivationBatch) -> bool {
        self.settle(WaitOutcome::Resolved, batch)
    }

    pub(crate) fn fail(&self, failure: Failure, batch: &mut ActivationBatch) -> bool {
        self.settle(WaitOutcome::Failed(failure), batch)
    }

    fn settle(&self, outcome: WaitOutcome, batch: &mut ActivationBatch) -> bool {
        {
            let mut current = self.outcome.lock();
            if *current != WaitOutcome::Pending {
                return false;
            }
            *current = outcome;
        }
        batch.add(self.job.clone());
        true
    }

    pub(crate) fn outcome(&self) -> WaitOutcome {
        self.outcome.lock().clone()
    }

    pub(crate) fn is_pending(&self) -> bool {
        *self.outcome.lock() == WaitOutcome::Pending
    }

    pub(crate) fn failure(&self) -> Option<Failure> {
        match &*self.outcome.lock() {
            WaitOutcome::Failed(f) => Some(f.clone()),
            _ => None,
        }
    }
}

struct Deadline {
    at: Instant,
    wait: Arc<Wait>,
    failure: Failure,
}

struct Ticker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Deadline tracker shared by all processes of an engine.
pub struct Monitor {
    this: Weak<Monitor>,
    deadlines: Mutex<Vec<Deadline>>,
    /// Set for monitors that tick on their own.
    interval: Option<Duration>,
    ticker: Mutex<Option<Ticker>>,
}

impl Monitor {
    /// A monitor that only expires waits when [`check`](Self::check) or
    /// [`check_at`](Self::check_at) is called.
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// A monitor that starts checking every `interval` once the first
    /// deadline is registered.
    pub fn ticking(interval: Duration) -> Arc<Self> {
        Self::build(Some(interval))
    }

    fn build(interval: Option<Duration>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            deadlines: Mutex::new(Vec::new()),
            interval,
            ticker: Mutex::new(None),
        })
    }

    pub(crate) fn register(&self, at: Instant, wait: Arc<Wait>, failure: Failure) {
        {
            let mut deadlines = self.deadlines.lock();
            deadlines.retain(|d| d.wait.is_pending());
            deadlines.push(Deadline { at, wait, failure });
        }
        if let Some(interval) = self.interval
            && let Err(e) = self.start_ticker(interval)
        {
            log::error!("failed to start monitor ticker: {e}");
        }
    }

    /// Number of deadlines still tracked, settled or not.
    pub fn tracked(&self) -> usize {
        self.deadlines.lock().len()
    }

    pub fn is_ticking(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Starts a thread calling [`check`](Self::check) every `interval`.
    /// Does nothing when one is already running. The thread exits once the
    /// monitor is dropped.
    pub fn start_ticker(&self, interval: Duration) -> io::Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let monitor = self.this.clone();
        let handle = thread::Builder::new()
            .name("jobkernel-monitor".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    let Some(monitor) = monitor.upgrade() else {
                        return;
                    };
                    monitor.check();
                }
            })?;
        log::debug!("monitor ticker started ({interval:?})");
        *ticker = Some(Ticker { stop, handle });
        Ok(())
    }

    /// Stops the ticker, if any. A later deadline starts it again on a
    /// ticking monitor.
    pub fn stop_ticker(&self) {
        let Some(ticker) = self.ticker.lock().take() else {
            return;
        };
        ticker.stop.store(true, Ordering::Release);
        ticker.handle.thread().unpark();
        // The last reference may be dropped by the ticker itself.
        if ticker.handle.thread().id() != thread::current().id() {
            let _ = ticker.handle.join();
        }
    }

    pub fn check(&self) -> usize {
        self.check_at(Instant::now())
    }

    /// Fails every pending wait whose deadline is at or before `now` and
    /// wakes its job. Returns how many waits timed out.
    pub fn check_at(&self, now: Instant) -> usize {
        let expired: Vec<Deadline> = {
            let mut deadlines = self.deadlines.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = deadlines
                .drain(..)
                .filter(|d| d.wait.is_pending())
                .partition(|d| d.at <= now);
            *deadlines = keep;
            expired
        };

        let mut batch = ActivationBatch::new();
        let mut timed_out = 0;
        for deadline in expired {
            if deadline.wait.fail(deadline.failure, &mut batch) {
                timed_out += 1;
            }
        }
        if timed_out > 0 {
            log::debug!("monitor expired {timed_out} wait(s)");
        }
        batch.activate_all();
        timed_out
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
