//! One pass of the job container, run under the thread lock.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::activation::ActivationBatch;
use crate::error::{Failure, kinds};
use crate::escalation::{ChainLink, LevelTables, Resolution, resolve};
use crate::graph::{JobIndex, Outcome, Parameter, ProcessGraph};
use crate::monitor::WaitOutcome;
use crate::resource::{Bindings, ResourceCoordinator, release_all};
use crate::tree::{Completion, ProcessOutcome, ProcessShared, ThreadInner};

use super::context::{JobContext, Requests};
use super::job::{Job, NodeId, NodeRecord};
use super::state::JobState;

/// What ACTIVATE_PARALLEL decided.
enum Gate {
    /// Something is still outstanding; suspend.
    Wait,
    /// The async signal resolved; execute again.
    Resume,
    Fail(Failure),
    Proceed,
}

pub(crate) struct Step<'a> {
    job: &'a Job,
    process: Arc<ProcessShared>,
    graph: Arc<ProcessGraph>,
    inner: &'a mut ThreadInner,
    batch: &'a mut ActivationBatch,
}

impl<'a> Step<'a> {
    pub(crate) fn new(job: &'a Job, inner: &'a mut ThreadInner, batch: &'a mut ActivationBatch) -> Self {
        let process = job.thread.process.clone();
        let graph = process.graph.clone();
        Self {
            job,
            process,
            graph,
            inner,
            batch,
        }
    }

    pub(crate) fn run(mut self) -> bool {
        let complete = self.step(self.job.id);
        if self.inner.active_flows == 0 && !self.inner.finished {
            self.job.thread.finish(self.inner, self.batch);
        }
        complete
    }

    fn node(&mut self, id: NodeId) -> &mut NodeRecord {
        &mut self.inner.nodes[id.0]
    }

    fn sibling(&self, id: NodeId) -> Job {
        self.job.sibling(id)
    }

    fn enter(&mut self, id: NodeId, state: JobState) {
        let job = self.job.to_string();
        let node = self.node(id);
        log::debug!("{job}: {} -> {state}", node.state);
        node.transition(state);
    }

    fn coordinator(&mut self, id: NodeId) -> ResourceCoordinator<'_> {
        let ThreadInner {
            bindings, nodes, ..
        } = &mut *self.inner;
        ResourceCoordinator::new(
            &self.process,
            Bindings {
                thread: bindings,
                node: &mut nodes[id.0].bindings,
            },
        )
    }

    fn step(&mut self, id: NodeId) -> bool {
        if self.inner.finished {
            return true;
        }
        let Some(node) = self.inner.nodes.get_mut(id.0) else {
            return true;
        };
        node.queued = false;
        if node.complete {
            return true;
        }
        if self.process.is_failed() {
            self.abort_thread();
            return true;
        }
        if let Some(failure) = self.inner.take_deposited(id) {
            return self.fail(id, failure);
        }

        let graph = self.graph.clone();
        let meta = graph.job(self.node(id).job);
        loop {
            match self.node(id).state {
                JobState::LoadResources => {
                    if meta.resources.is_empty() {
                        self.enter(id, JobState::Execute);
                        continue;
                    }
                    match self.coordinator(id).load(&meta.resources) {
                        Ok(_) => self.enter(id, JobState::EnsureResourcesReady),
                        Err(failure) => return self.fail(id, failure),
                    }
                }
                JobState::EnsureResourcesReady => {
                    let job = self.job;
                    let mut waits = std::mem::take(&mut self.node(id).resource_waits);
                    let ready = self.coordinator(id).is_ready(&meta.resources, &mut waits, job);
                    self.node(id).resource_waits = waits;
                    match ready {
                        Ok(true) => match self.coordinator(id).coordinate(&meta.resources) {
                            Ok(()) => {
                                self.node(id).resource_waits.clear();
                                self.enter(id, JobState::Execute);
                            }
                            Err(failure) => return self.fail(id, failure),
                        },
                        Ok(false) => return false,
                        Err(failure) => return self.fail(id, failure),
                    }
                }
                JobState::Execute => match self.execute(id) {
                    Ok(()) => {
                        let node = self.node(id);
                        let waiting = node.parallel.is_some()
                            || !node.pending_parallel.is_empty()
                            || !node.joins.is_empty()
                            || node.signal.is_some();
                        let next = if waiting {
                            JobState::ActivateParallel
                        } else {
                            JobState::ActivateNextInFlow
                        };
                        self.enter(id, next);
                    }
                    Err(failure) => return self.fail(id, failure),
                },
                JobState::ActivateParallel => match self.activate_parallel(id) {
                    Gate::Wait => return false,
                    Gate::Resume => self.enter(id, JobState::Execute),
                    Gate::Fail(failure) => return self.fail(id, failure),
                    Gate::Proceed => self.enter(id, JobState::ActivateNextInFlow),
                },
                JobState::ActivateNextInFlow => {
                    let node = self.node(id);
                    if !node.next_instigated {
                        node.next_instigated = true;
                        if let Some(next) = meta.next {
                            let parameter = node.result.clone();
                            self.chain_sequential(id, vec![(next, parameter)]);
                        }
                    }
                    if self.node(id).parallel.is_some() {
                        return false;
                    }
                    if let Some(child) = self.node(id).pending_parallel.pop_front() {
                        self.start_parallel(id, child);
                        return false;
                    }
                    self.complete_node(id);
                    return true;
                }
                JobState::Completed | JobState::Failed => return true,
            }
        }
    }

    fn execute(&mut self, id: NodeId) -> Result<(), Failure> {
        let graph = self.graph.clone();
        let (index, parameter, resumed) = {
            let node = self.node(id);
            (node.job, node.parameter.clone(), node.resumed.take())
        };
        let meta = graph.job(index);
        let resources = self.coordinator(id).objects(&meta.resources);
        let mut ctx = JobContext::new(
            self.job.clone(),
            self.process.clone(),
            meta.name.clone(),
            parameter,
            resumed,
            resources,
        );
        self.inner.jobs_executed += 1;
        log::debug!("{} executing `{}`", self.job, meta.name);

        let outcome = catch_unwind(AssertUnwindSafe(|| meta.behavior.execute(&mut ctx)))
            .unwrap_or_else(|panic| Err(Failure::panic(panic_message(panic.as_ref()))));
        let requests = ctx.into_requests();
        // Spawned threads run whatever this behavior did.
        for first in &requests.asynchronous {
            self.batch.add(first.clone());
        }

        match outcome {
            Ok(Outcome::Complete(result)) => {
                self.node(id).result = result;
                self.apply(id, requests, false);
                Ok(())
            }
            Ok(Outcome::Suspended) if requests.signal.is_some() => {
                self.apply(id, requests, true);
                Ok(())
            }
            Ok(Outcome::Suspended) => {
                self.discard(requests);
                Err(Failure::new(
                    kinds::JOB_SUSPEND,
                    format!("`{}` suspended without an async signal", meta.name),
                ))
            }
            Err(failure) => {
                self.discard(requests);
                Err(failure)
            }
        }
    }

    fn apply(&mut self, id: NodeId, requests: Requests, suspended: bool) {
        let Requests {
            sequential,
            parallel,
            joins,
            signal,
            ..
        } = requests;
        if !sequential.is_empty() {
            self.chain_sequential(id, sequential);
            self.node(id).next_instigated = true;
        }
        let within_handler = self.node(id).within_handler;
        for (job, parameter, completion) in parallel {
            let flow = self.inner.open_flow(completion);
            let child = self
                .inner
                .push_node(NodeRecord::new(job, flow, parameter, Some(id), within_handler));
            self.node(id).pending_parallel.push_back(child);
        }
        let node = self.node(id);
        node.joins.extend(joins);
        if suspended {
            node.signal = signal;
        }
    }

    /// Drops what a failed behavior asked for. Parallel flows it was handed
    /// resolve empty.
    fn discard(&mut self, requests: Requests) {
        for (_, _, completion) in requests.parallel {
            completion.complete(Parameter::None, self.batch);
        }
    }

    /// Inserts `jobs` between `id` and its current next, in order.
    fn chain_sequential(&mut self, id: NodeId, jobs: Vec<(JobIndex, Parameter)>) {
        let (flow, owner, within_handler, mut next) = {
            let node = self.node(id);
            (node.flow, node.owner, node.within_handler, node.next)
        };
        for (job, parameter) in jobs.into_iter().rev() {
            let mut record = NodeRecord::new(job, flow, parameter, owner, within_handler);
            record.next = next;
            next = Some(self.inner.push_node(record));
        }
        self.node(id).next = next;
    }

    fn start_parallel(&mut self, id: NodeId, child: NodeId) {
        self.node(id).parallel = Some(child);
        let child = self.sibling(child);
        self.batch.add(child);
    }

    fn activate_parallel(&mut self, id: NodeId) -> Gate {
        let node = self.node(id);
        if let Some(failure) = node.joins.iter().find_map(|w| w.failure()) {
            return Gate::Fail(failure);
        }
        if let Some(WaitOutcome::Failed(failure)) = node.signal.as_ref().map(|s| s.outcome()) {
            node.signal = None;
            return Gate::Fail(failure);
        }
        if node.parallel.is_some() {
            return Gate::Wait;
        }
        if let Some(child) = node.pending_parallel.pop_front() {
            self.start_parallel(id, child);
            return Gate::Wait;
        }
        if node.joins.iter().any(|w| w.is_pending()) {
            return Gate::Wait;
        }
        node.joins.clear();
        if let Some(signal) = node.signal.take() {
            if signal.outcome() == WaitOutcome::Pending {
                node.signal = Some(signal);
                return Gate::Wait;
            }
            node.resumed = Some(signal.take_value());
            return Gate::Resume;
        }
        Gate::Proceed
    }

    /// Marks `id` complete and hands off: to its next job, or, at the end of
    /// the flow, back to the owner.
    fn complete_node(&mut self, id: NodeId) {
        let job = self.job.to_string();
        let (bindings, next, owner, flow, result) = {
            let node = self.node(id);
            node.complete = true;
            node.transition(JobState::Completed);
            (
                std::mem::take(&mut node.bindings),
                node.next,
                node.owner,
                node.flow,
                node.result.clone(),
            )
        };
        log::debug!("{job}: completed");
        release_all(&self.process, bindings);

        match next {
            Some(next) => {
                self.node(next).owner = owner;
                if let Some(owner) = owner
                    && self.node(owner).parallel == Some(id)
                {
                    self.node(owner).parallel = Some(next);
                }
                let next = self.sibling(next);
                self.batch.add(next);
            }
            None => {
                self.inner.result = result.clone();
                self.inner.close_flow(flow, result, self.batch);
                self.release_owner(id, owner);
            }
        }
    }

    /// The flow ending at `id` is done; let its owner continue.
    fn release_owner(&mut self, id: NodeId, owner: Option<NodeId>) {
        let Some(owner) = owner else {
            return;
        };
        let record = self.node(owner);
        if record.parallel == Some(id) {
            record.parallel = None;
            let owner = self.sibling(owner);
            self.batch.add(owner);
        }
    }

    fn fail(&mut self, id: NodeId, failure: Failure) -> bool {
        log::debug!("{} failed: {failure}", self.job);
        self.node(id).transition(JobState::Failed);
        self.escalate(id, failure);
        true
    }

    fn escalate(&mut self, id: NodeId, failure: Failure) {
        let graph = self.graph.clone();
        let runtime = failure
            .resource
            .and_then(|r| self.process.source_escalations(r));
        let mut resource_source = Vec::new();
        if let Some(resource) = failure.resource {
            resource_source.extend(runtime.as_ref());
            resource_source.push(&graph.resource(resource).escalations);
        }
        resource_source.push(&graph.source_escalations);
        let levels = LevelTables {
            office: &graph.thread.escalations,
            resource_source,
            process: &graph.process_escalations,
        };

        let nodes = &self.inner.nodes;
        let resolution = resolve(
            id,
            &failure,
            |n: NodeId| {
                let record = &nodes[n.0];
                ChainLink {
                    table: &graph.job(record.job).escalations,
                    owner: record.owner,
                    handler_root: record.within_handler
                        && record.owner.is_none_or(|o| !nodes[o.0].within_handler),
                }
            },
            &levels,
            self.inner.escalation_level,
        );

        match resolution {
            Resolution::Chain {
                handler,
                path,
                owner,
            } => {
                log::debug!(
                    "{} escalating `{}` to `{}`",
                    self.job,
                    failure.kind,
                    graph.job(handler).name()
                );
                let handler = self.spawn_handler(handler, failure, owner);
                if let (Some(owner), Some(escalated)) = (owner, path.last().copied())
                    && self.node(owner).parallel == Some(escalated)
                {
                    self.node(owner).parallel = Some(handler);
                }
                self.abort_path(&path);
                let handler = self.sibling(handler);
                self.batch.add(handler);
            }
            Resolution::Level {
                handler,
                level,
                path,
            } => {
                log::debug!(
                    "{} escalating `{}` to `{}` at {level} level",
                    self.job,
                    failure.kind,
                    graph.job(handler).name()
                );
                self.inner.escalation_level = level;
                let handler = self.spawn_handler(handler, failure, None);
                self.abort_path(&path);
                let handler = self.sibling(handler);
                self.batch.add(handler);
            }
            Resolution::Unrecoverable { .. } => {
                self.process
                    .fail(ProcessOutcome::Unrecoverable(failure.unhandled()));
                self.abort_thread();
            }
            Resolution::Fatal { .. } => {
                self.process.fail(ProcessOutcome::Fatal(failure.unhandled()));
                self.abort_thread();
            }
        }
    }

    /// Opens the handler flow before anything is aborted, so the thread
    /// cannot run out of flows in between.
    fn spawn_handler(&mut self, job: JobIndex, failure: Failure, owner: Option<NodeId>) -> NodeId {
        let flow = self.inner.open_flow(Completion::new());
        self.inner.push_node(NodeRecord::new(
            job,
            flow,
            Parameter::Failure(failure),
            owner,
            true,
        ))
    }

    fn abort_path(&mut self, path: &[NodeId]) {
        for id in path {
            self.abort_node(*id);
        }
    }

    /// Completes `id` and everything it gates (its next chain, its parallel
    /// children) without running them.
    fn abort_node(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node(current);
            if node.complete {
                continue;
            }
            stack.extend(node.next);
            stack.extend(node.parallel);
            stack.extend(node.pending_parallel.iter().copied());
            let (flow, owner, terminal) = (node.flow, node.owner, node.next.is_none());
            let bindings = node.abandon();
            release_all(&self.process, bindings);
            if terminal {
                self.inner.close_flow(flow, Parameter::None, self.batch);
                self.release_owner(current, owner);
            }
        }
    }

    fn abort_thread(&mut self) {
        self.inner.abort_all(&self.process, self.batch);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job behavior panicked".to_string()
    }
}
