use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;

use crate::activation::ActivationBatch;
use crate::error::Failure;
use crate::escalation::EscalationLevel;
use crate::graph::{JobIndex, Parameter};
use crate::resource::{BindingMap, release_all};
use crate::state_machine::{Job, NodeId, NodeRecord};

use super::flow::{Completion, FlowFuture, wait_on_completion};
use super::process::ProcessShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FlowId(pub(crate) usize);

pub(crate) struct FlowRecord {
    pub(crate) completion: Arc<Completion>,
    open: bool,
}

/// Everything a thread's jobs share, guarded by the thread lock.
pub(crate) struct ThreadInner {
    /// Node arena. Cleared when the thread finishes; stale ids then read as
    /// complete.
    pub(crate) nodes: Vec<NodeRecord>,
    pub(crate) flows: Vec<FlowRecord>,
    pub(crate) active_flows: usize,
    /// Highest level a handler was found at. Reaching a level aborts the
    /// whole owner chain, and whatever runs afterwards belongs to a handler
    /// flow whose failures are unrecoverable, so this only keeps a search
    /// from consulting a level twice.
    pub(crate) escalation_level: EscalationLevel,
    pub(crate) bindings: BindingMap,
    /// Failures delivered by activation batches, picked up on the next step.
    pub(crate) deposited: Vec<(NodeId, Failure)>,
    pub(crate) finished: bool,
    pub(crate) jobs_executed: usize,
    /// Result of the last flow that completed normally.
    pub(crate) result: Parameter,
}

impl ThreadInner {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            flows: Vec::new(),
            active_flows: 0,
            escalation_level: EscalationLevel::Flow,
            bindings: BindingMap::new(),
            deposited: Vec::new(),
            finished: false,
            jobs_executed: 0,
            result: Parameter::None,
        }
    }

    pub(crate) fn open_flow(&mut self, completion: Arc<Completion>) -> FlowId {
        self.flows.push(FlowRecord {
            completion,
            open: true,
        });
        self.active_flows += 1;
        FlowId(self.flows.len() - 1)
    }

    /// Resolves the flow's joiners. Each flow closes once.
    pub(crate) fn close_flow(&mut self, flow: FlowId, result: Parameter, batch: &mut ActivationBatch) {
        let Some(record) = self.flows.get_mut(flow.0) else {
            return;
        };
        if !record.open {
            return;
        }
        record.open = false;
        record.completion.complete(result, batch);
        self.active_flows -= 1;
    }

    /// Completes every job and closes every flow without running anything.
    pub(crate) fn abort_all(&mut self, process: &ProcessShared, batch: &mut ActivationBatch) {
        for node in self.nodes.iter_mut() {
            release_all(process, node.abandon());
        }
        for flow in 0..self.flows.len() {
            self.close_flow(FlowId(flow), Parameter::None, batch);
        }
    }

    pub(crate) fn push_node(&mut self, node: NodeRecord) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn take_deposited(&mut self, id: NodeId) -> Option<Failure> {
        let position = self.deposited.iter().position(|(n, _)| *n == id)?;
        Some(self.deposited.remove(position).1)
    }
}

/// A strand of execution: the unit of mutual exclusion.
pub(crate) struct ThreadShared {
    pub(crate) id: u64,
    pub(crate) process: Arc<ProcessShared>,
    pub(crate) inner: Mutex<ThreadInner>,
    pub(crate) completion: Arc<Completion>,
    /// A job step holds `inner`.
    stepping: AtomicBool,
    /// Jobs that found a step running and left it to resubmit them.
    deferred: Mutex<Vec<NodeId>>,
}

impl ThreadShared {
    /// Creates a thread whose first flow starts at `job`. The returned job is
    /// not activated.
    pub(crate) fn spawn(process: &Arc<ProcessShared>, job: JobIndex, parameter: Parameter) -> Job {
        let mut inner = ThreadInner::new();
        let flow = inner.open_flow(Completion::new());
        let first = inner.push_node(NodeRecord::new(job, flow, parameter, None, false));
        let thread = Arc::new_cyclic(|weak| ThreadShared {
            id: process.attach_thread(weak.clone()),
            process: process.clone(),
            inner: Mutex::new(inner),
            completion: Completion::new(),
            stepping: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
        });
        log::debug!(
            "process {} spawned thread {} at `{}`",
            process.id,
            thread.id,
            process.graph.job(job).name()
        );
        Job::new(thread, first)
    }

    /// Takes the thread lock for a step of `id`. While another step holds it,
    /// `id` is left for that step to resubmit and `None` is returned at
    /// once; other holders are short and are waited for.
    pub(crate) fn enter_step(&self, id: NodeId) -> Option<MutexGuard<'_, ThreadInner>> {
        if let Some(inner) = self.inner.try_lock() {
            self.stepping.store(true, Ordering::SeqCst);
            return Some(inner);
        }
        self.deferred.lock().push(id);
        if self.stepping.load(Ordering::SeqCst) {
            return None;
        }
        {
            let mut deferred = self.deferred.lock();
            // Already handed back by a step that just ended.
            let position = deferred.iter().position(|d| *d == id)?;
            deferred.remove(position);
        }
        let inner = self.inner.lock();
        self.stepping.store(true, Ordering::SeqCst);
        Some(inner)
    }

    /// Ends the current step. Must be called before its guard is dropped.
    /// Returns the jobs deferred while it ran, ready to be resubmitted.
    pub(crate) fn leave_step(&self, inner: &mut ThreadInner) -> Vec<NodeId> {
        self.stepping.store(false, Ordering::SeqCst);
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for id in &deferred {
            if let Some(node) = inner.nodes.get_mut(id.0) {
                node.queued = false;
            }
        }
        deferred
    }

    /// Ends the thread once its last flow closed: releases thread-scoped
    /// resources, resolves joiners and tells the process.
    pub(crate) fn finish(&self, inner: &mut ThreadInner, batch: &mut ActivationBatch) {
        if inner.finished {
            return;
        }
        inner.finished = true;
        inner.nodes.clear();
        inner.deposited.clear();
        release_all(&self.process, std::mem::take(&mut inner.bindings));
        let result = std::mem::take(&mut inner.result);
        log::debug!("thread {} of process {} finished", self.id, self.process.id);
        self.completion.complete(result.clone(), batch);
        self.process
            .thread_finished(self.id, inner.jobs_executed, result);
    }

    /// Aborts every job still on the thread. Used once the process failed.
    pub(crate) fn abort(self: &Arc<Self>) {
        let mut batch = ActivationBatch::new();
        {
            let mut inner = self.inner.lock();
            if inner.finished {
                return;
            }
            log::debug!("aborting thread {} of process {}", self.id, self.process.id);
            inner.abort_all(&self.process, &mut batch);
            self.finish(&mut inner, &mut batch);
        }
        batch.activate_all();
    }
}

/// Join handle of a thread created by an asynchronous instigation, or of a
/// process's initial thread.
#[derive(Clone)]
pub struct ThreadHandle {
    pub(crate) thread: Arc<ThreadShared>,
}

impl ThreadHandle {
    pub fn id(&self) -> u64 {
        self.thread.id
    }
}

impl FlowFuture for ThreadHandle {
    fn is_complete(&self) -> bool {
        self.thread.completion.is_complete()
    }

    fn result(&self) -> Option<Parameter> {
        self.thread.completion.result()
    }

    fn wait_on_flow(
        &self,
        waiter: &Job,
        timeout: Option<Duration>,
        token: Option<Value>,
        batch: &mut ActivationBatch,
    ) -> bool {
        wait_on_completion(
            &self.thread.completion,
            &self.thread.process.monitor,
            waiter,
            timeout,
            token,
            batch,
        )
    }
}
