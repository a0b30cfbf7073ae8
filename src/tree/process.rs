use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Failure, FailureKind};
use crate::escalation::EscalationTable;
use crate::graph::{FailureSink, JobIndex, Parameter, ProcessGraph, ResourceIndex};
use crate::monitor::Monitor;
use crate::resource::{BindingMap, ResourceContainer, release_all};

use super::thread::ThreadShared;

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "failure", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Completed,
    /// A failure matched no handler at any level.
    Fatal(Failure),
    /// A failure escaped an escalation handler.
    Unrecoverable(Failure),
}

impl ProcessOutcome {
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ProcessOutcome::Completed => None,
            ProcessOutcome::Fatal(f) | ProcessOutcome::Unrecoverable(f) => Some(f),
        }
    }
}

/// Summary published once per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    pub process_id: Uuid,
    pub outcome: ProcessOutcome,
    /// Threads spawned so far, the initial one included.
    pub threads: usize,
    /// Behavior executions on threads that had finished when the report was made.
    pub jobs_executed: usize,
    /// Result of the initial thread.
    pub result: Parameter,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProcessReport {
    pub fn is_success(&self) -> bool {
        self.outcome == ProcessOutcome::Completed
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

struct ProcessState {
    bindings: BindingMap,
    source_escalations: HashMap<ResourceIndex, EscalationTable>,
    threads: Vec<Weak<ThreadShared>>,
    active_threads: usize,
    jobs_executed: usize,
    result: Parameter,
    outcome: Option<ProcessOutcome>,
}

pub(crate) struct ProcessShared {
    pub(crate) id: Uuid,
    pub(crate) graph: Arc<ProcessGraph>,
    pub(crate) monitor: Arc<Monitor>,
    state: Mutex<ProcessState>,
    failed: AtomicBool,
    report: Mutex<Option<ProcessReport>>,
    reported: Condvar,
    started_at: DateTime<Utc>,
}

impl ProcessShared {
    pub(crate) fn new(graph: Arc<ProcessGraph>, monitor: Arc<Monitor>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            graph,
            monitor,
            state: Mutex::new(ProcessState {
                bindings: HashMap::new(),
                source_escalations: HashMap::new(),
                threads: Vec::new(),
                active_threads: 0,
                jobs_executed: 0,
                result: Parameter::None,
                outcome: None,
            }),
            failed: AtomicBool::new(false),
            report: Mutex::new(None),
            reported: Condvar::new(),
            started_at: Utc::now(),
        })
    }

    /// Process-scoped binding of `index`, allocated on first use.
    pub(crate) fn binding(&self, index: ResourceIndex) -> Arc<ResourceContainer> {
        self.state
            .lock()
            .bindings
            .entry(index)
            .or_insert_with(|| ResourceContainer::new(index))
            .clone()
    }

    pub(crate) fn register_source_escalation(
        &self,
        resource: ResourceIndex,
        kind: FailureKind,
        handler: JobIndex,
    ) {
        self.state
            .lock()
            .source_escalations
            .entry(resource)
            .or_default()
            .push(kind, handler);
    }

    pub(crate) fn source_escalations(&self, resource: ResourceIndex) -> Option<EscalationTable> {
        self.state.lock().source_escalations.get(&resource).cloned()
    }

    /// Adds a thread and returns its id.
    pub(crate) fn attach_thread(&self, thread: Weak<ThreadShared>) -> u64 {
        let mut state = self.state.lock();
        state.threads.push(thread);
        state.active_threads += 1;
        (state.threads.len() - 1) as u64
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.state.lock().threads.len()
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Called once by each thread when its last flow completes. The last
    /// thread releases the process-scoped resources and publishes the report.
    pub(crate) fn thread_finished(&self, thread: u64, jobs_executed: usize, result: Parameter) {
        let finished = {
            let mut state = self.state.lock();
            state.jobs_executed += jobs_executed;
            if thread == 0 {
                state.result = result;
            }
            state.active_threads -= 1;
            if state.active_threads > 0 {
                None
            } else {
                let outcome = state.outcome.clone().unwrap_or(ProcessOutcome::Completed);
                Some((std::mem::take(&mut state.bindings), self.make_report(&state, outcome)))
            }
        };
        if let Some((bindings, report)) = finished {
            release_all(self, bindings);
            log::debug!("process {} finished: {:?}", self.id, report.outcome);
            self.publish(report);
        }
    }

    /// Fails the process. Only the first failure is delivered to a sink and
    /// reported; later ones are logged.
    pub(crate) fn fail(&self, outcome: ProcessOutcome) {
        let Some(failure) = outcome.failure().cloned() else {
            return;
        };
        if self.failed.swap(true, Ordering::AcqRel) {
            log::warn!("process {} already failed, dropping {failure}", self.id);
            return;
        }
        let (sink, label) = match outcome {
            ProcessOutcome::Unrecoverable(_) => (self.graph.last_resort.clone(), "unrecoverable"),
            _ => (self.graph.fatal_sink.clone(), "fatal"),
        };
        deliver(sink, &failure, label, self.id);

        let report = {
            let mut state = self.state.lock();
            state.outcome = Some(outcome.clone());
            self.make_report(&state, outcome)
        };
        self.publish(report);
    }

    /// Threads of this process other than `except`, still alive.
    pub(crate) fn live_threads(&self, except: u64) -> Vec<Arc<ThreadShared>> {
        self.state
            .lock()
            .threads
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.id != except)
            .collect()
    }

    fn make_report(&self, state: &ProcessState, outcome: ProcessOutcome) -> ProcessReport {
        ProcessReport {
            process_id: self.id,
            outcome,
            threads: state.threads.len(),
            jobs_executed: state.jobs_executed,
            result: state.result.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    fn publish(&self, report: ProcessReport) {
        let mut slot = self.report.lock();
        if slot.is_none() {
            *slot = Some(report);
            self.reported.notify_all();
        }
    }
}

fn deliver(sink: Option<FailureSink>, failure: &Failure, label: &str, process: Uuid) {
    match sink {
        Some(sink) => {
            if catch_unwind(AssertUnwindSafe(|| sink(failure))).is_err() {
                log::error!("{label} sink panicked; process {process} failed with {failure}");
            }
        }
        None => log::error!("{label} failure in process {process}: {failure}"),
    }
}

/// Caller-side view of a running process.
#[derive(Clone)]
pub struct ProcessHandle {
    pub(crate) process: Arc<ProcessShared>,
}

impl ProcessHandle {
    pub fn id(&self) -> Uuid {
        self.process.id
    }

    pub fn is_failed(&self) -> bool {
        self.process.is_failed()
    }

    pub fn threads(&self) -> usize {
        self.process.thread_count()
    }

    pub fn report(&self) -> Option<ProcessReport> {
        self.process.report.lock().clone()
    }

    /// Blocks until the process reports.
    pub fn wait(&self) -> ProcessReport {
        let mut slot = self.process.report.lock();
        loop {
            if let Some(report) = slot.as_ref() {
                return report.clone();
            }
            self.process.reported.wait(&mut slot);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcessReport> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.process.report.lock();
        while slot.is_none() {
            if self.process.reported.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}
