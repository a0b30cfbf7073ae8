use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::activation::{ActivationBatch, StepScope};
use crate::error::Failure;
use crate::graph::{JobIndex, Parameter, ResourceIndex};
use crate::monitor::Wait;
use crate::resource::BindingMap;
use crate::tree::{FlowId, ThreadHandle, ThreadShared};

use super::context::AsyncSignal;
use super::state::JobState;
use super::step::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub(crate) usize);

/// One job in a thread's node arena. Links are ids into the same arena.
pub(crate) struct NodeRecord {
    pub(crate) job: JobIndex,
    pub(crate) flow: FlowId,
    pub(crate) state: JobState,
    pub(crate) history: Vec<JobState>,
    pub(crate) parameter: Parameter,
    pub(crate) result: Parameter,
    /// Sequential successor in the same flow.
    pub(crate) next: Option<NodeId>,
    /// Parallel child currently gating completion: the running job of the
    /// child flow.
    pub(crate) parallel: Option<NodeId>,
    /// Parallel children instigated but not yet activated, in order.
    pub(crate) pending_parallel: VecDeque<NodeId>,
    /// The job this one's flow must rejoin when it ends.
    pub(crate) owner: Option<NodeId>,
    pub(crate) joins: Vec<Arc<Wait>>,
    pub(crate) resource_waits: Vec<(ResourceIndex, Arc<Wait>)>,
    pub(crate) signal: Option<AsyncSignal>,
    pub(crate) resumed: Option<Parameter>,
    pub(crate) bindings: BindingMap,
    /// Runs as part of an escalation handler flow.
    pub(crate) within_handler: bool,
    /// The static next was already considered.
    pub(crate) next_instigated: bool,
    /// Submitted to its team and not yet stepped.
    pub(crate) queued: bool,
    pub(crate) complete: bool,
}

impl NodeRecord {
    pub(crate) fn new(
        job: JobIndex,
        flow: FlowId,
        parameter: Parameter,
        owner: Option<NodeId>,
        within_handler: bool,
    ) -> Self {
        Self {
            job,
            flow,
            state: JobState::LoadResources,
            history: Vec::new(),
            parameter,
            result: Parameter::None,
            next: None,
            parallel: None,
            pending_parallel: VecDeque::new(),
            owner,
            joins: Vec::new(),
            resource_waits: Vec::new(),
            signal: None,
            resumed: None,
            bindings: BindingMap::new(),
            within_handler,
            next_instigated: false,
            queued: false,
            complete: false,
        }
    }

    pub(crate) fn transition(&mut self, to: JobState) {
        self.history.push(self.state);
        self.state = to;
    }

    /// Marks the job complete without running it further. Returns its
    /// bindings for release.
    pub(crate) fn abandon(&mut self) -> BindingMap {
        self.complete = true;
        self.queued = false;
        self.joins.clear();
        self.resource_waits.clear();
        self.signal = None;
        self.pending_parallel.clear();
        std::mem::take(&mut self.bindings)
    }
}

/// Point-in-time view of a job, for callers and tests.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub state: JobState,
    pub history: Vec<JobState>,
    pub complete: bool,
    pub result: Parameter,
}

/// Handle to one job node. Cheap to clone; every operation takes the
/// owning thread's lock.
#[derive(Clone)]
pub struct Job {
    pub(crate) thread: Arc<ThreadShared>,
    pub(crate) id: NodeId,
}

impl Job {
    pub(crate) fn new(thread: Arc<ThreadShared>, id: NodeId) -> Self {
        Self { thread, id }
    }

    pub(crate) fn sibling(&self, id: NodeId) -> Self {
        Self::new(self.thread.clone(), id)
    }

    pub fn thread_handle(&self) -> ThreadHandle {
        ThreadHandle {
            thread: self.thread.clone(),
        }
    }

    /// Requests the job be submitted to its team. Does nothing when the job
    /// is complete or already queued. Inside a job step the submission is
    /// deferred until the step releases its lock.
    pub fn activate_job(&self) {
        let mut batch = ActivationBatch::new();
        batch.add(self.clone());
        batch.activate_all();
    }

    /// Submits the job to its team right away, depositing `failure` first.
    /// Must not be called under any thread lock.
    pub(crate) fn activate_now(&self, failure: Option<Failure>) {
        let team = {
            let mut inner = self.thread.inner.lock();
            if let Some(failure) = failure {
                match inner.nodes.get(self.id.0) {
                    Some(node) if !node.complete => inner.deposited.push((self.id, failure)),
                    _ => {
                        log::warn!("{self} is already complete, dropping late failure: {failure}");
                        return;
                    }
                }
            }
            let Some(node) = inner.nodes.get_mut(self.id.0) else {
                return;
            };
            if node.complete || node.queued {
                return;
            }
            node.queued = true;
            self.thread.process.graph.team_for(node.job)
        };
        team.assign(self.clone());
    }

    /// Runs one state-machine step. Returns whether the job is complete.
    ///
    /// Safe to call any number of times from any OS thread: steps of jobs on
    /// the same thread never overlap, and a complete job returns at once.
    /// When another step of the same thread is running, this returns `false`
    /// at once and that step submits the job again when it ends.
    pub fn do_job(&self) -> bool {
        let Some(mut inner) = self.thread.enter_step(self.id) else {
            log::trace!("{self} deferred behind a running step");
            return false;
        };
        let scope = StepScope::enter();
        let mut batch = ActivationBatch::new();
        let complete = Step::new(self, &mut inner, &mut batch).run();
        for id in self.thread.leave_step(&mut inner) {
            batch.add(self.sibling(id));
        }
        let process_failed = self.thread.process.is_failed();
        drop(inner);
        batch.append(scope.finish());
        batch.activate_all();
        if process_failed {
            for thread in self.thread.process.live_threads(self.thread.id) {
                thread.abort();
            }
        }
        complete
    }

    /// Gives the job back when a team cannot run it, so a later activation
    /// submits it again.
    pub fn reject(&self) {
        let mut inner = self.thread.inner.lock();
        if let Some(node) = inner.nodes.get_mut(self.id.0) {
            node.queued = false;
        }
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.thread.inner.lock();
        inner.nodes.get(self.id.0).is_none_or(|node| node.complete)
    }

    /// `None` once the thread finished and reclaimed its nodes.
    pub fn snapshot(&self) -> Option<JobSnapshot> {
        let inner = self.thread.inner.lock();
        let node = inner.nodes.get(self.id.0)?;
        Some(JobSnapshot {
            name: self.thread.process.graph.job(node.job).name().to_string(),
            state: node.state,
            history: node.history.clone(),
            complete: node.complete,
            result: node.result.clone(),
        })
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {}/{}", self.thread.id, self.id.0)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("process", &self.thread.process.id)
            .field("thread", &self.thread.id)
            .field("node", &self.id.0)
            .finish()
    }
}
