use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::activation::ActivationBatch;
use crate::error::Failure;
use crate::graph::Parameter;
use crate::monitor::{Monitor, Wait};
use crate::state_machine::Job;

use super::thread::ThreadHandle;

struct CompletionState {
    result: Option<Parameter>,
    waiters: Vec<Arc<Wait>>,
}

/// Settle-once completion of a flow or thread, with its joiners.
pub(crate) struct Completion {
    state: Mutex<CompletionState>,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CompletionState {
                result: None,
                waiters: Vec::new(),
            }),
        })
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.lock().result.is_some()
    }

    pub(crate) fn result(&self) -> Option<Parameter> {
        self.state.lock().result.clone()
    }

    /// Registers `wait` unless already complete. Returns whether it was
    /// registered.
    fn register(&self, wait: &Arc<Wait>) -> bool {
        let mut state = self.state.lock();
        if state.result.is_some() {
            return false;
        }
        state.waiters.push(wait.clone());
        true
    }

    /// Completes once; later calls are ignored.
    pub(crate) fn complete(&self, result: Parameter, batch: &mut ActivationBatch) {
        let waiters = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.resolve(batch);
        }
    }
}

/// Registers `waiter` on `completion`, with a deadline when `timeout` is set.
/// `None` when the completion already resolved.
pub(crate) fn join(
    completion: &Completion,
    monitor: &Monitor,
    waiter: &Job,
    timeout: Option<Duration>,
    token: Option<Value>,
) -> Option<Arc<Wait>> {
    let wait = Wait::new(waiter.clone());
    if !completion.register(&wait) {
        return None;
    }
    if let Some(timeout) = timeout {
        monitor.register(Instant::now() + timeout, wait.clone(), Failure::join_timeout(token));
    }
    Some(wait)
}

/// Something a job can wait on until it resolves.
pub trait FlowFuture {
    fn is_complete(&self) -> bool;

    /// Result of the flow's last job, once complete. Aborted flows resolve
    /// with [`Parameter::None`].
    fn result(&self) -> Option<Parameter>;

    /// Reactivates `waiter` once this resolves, or fails it with
    /// `join.timeout` carrying `token` after `timeout`. Returns true, and
    /// registers nothing, when already resolved. A zero timeout on an
    /// unresolved future fails the waiter through `batch` at once.
    fn wait_on_flow(
        &self,
        waiter: &Job,
        timeout: Option<Duration>,
        token: Option<Value>,
        batch: &mut ActivationBatch,
    ) -> bool;
}

pub(crate) fn wait_on_completion(
    completion: &Completion,
    monitor: &Monitor,
    waiter: &Job,
    timeout: Option<Duration>,
    token: Option<Value>,
    batch: &mut ActivationBatch,
) -> bool {
    if timeout == Some(Duration::ZERO) {
        if completion.is_complete() {
            return true;
        }
        batch.add_failure(waiter.clone(), Failure::join_timeout(token));
        return false;
    }
    join(completion, monitor, waiter, timeout, token).is_none()
}

/// Join handle of a flow created by a parallel instigation.
#[derive(Clone)]
pub struct FlowHandle {
    pub(crate) completion: Arc<Completion>,
    pub(crate) monitor: Arc<Monitor>,
}

impl FlowFuture for FlowHandle {
    fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    fn result(&self) -> Option<Parameter> {
        self.completion.result()
    }

    fn wait_on_flow(
        &self,
        waiter: &Job,
        timeout: Option<Duration>,
        token: Option<Value>,
        batch: &mut ActivationBatch,
    ) -> bool {
        wait_on_completion(&self.completion, &self.monitor, waiter, timeout, token, batch)
    }
}

/// Anything [`JobContext::join`](crate::state_machine::JobContext::join)
/// accepts.
#[derive(Clone)]
pub enum JoinTarget {
    Flow(FlowHandle),
    Thread(ThreadHandle),
}

impl JoinTarget {
    pub(crate) fn parts(&self) -> (&Completion, &Monitor) {
        match self {
            JoinTarget::Flow(flow) => (&flow.completion, &flow.monitor),
            JoinTarget::Thread(thread) => (&thread.thread.completion, &thread.thread.process.monitor),
        }
    }
}

impl From<FlowHandle> for JoinTarget {
    fn from(flow: FlowHandle) -> Self {
        JoinTarget::Flow(flow)
    }
}

impl From<&FlowHandle> for JoinTarget {
    fn from(flow: &FlowHandle) -> Self {
        JoinTarget::Flow(flow.clone())
    }
}

impl From<ThreadHandle> for JoinTarget {
    fn from(thread: ThreadHandle) -> Self {
        JoinTarget::Thread(thread)
    }
}

impl From<&ThreadHandle> for JoinTarget {
    fn from(thread: &ThreadHandle) -> Self {
        JoinTarget::Thread(thread.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{JobSpec, Outcome, ProcessGraph};
    use crate::orchestrator::Engine;
    use crate::state_machine::JobContext;
    use serde_json::json;

    fn waiter() -> Job {
        let graph = ProcessGraph::builder()
            .job(JobSpec::new("idle", |_: &mut JobContext| Ok(Outcome::done())))
            .build()
            .unwrap();
        Engine::default()
            .create_process(&graph, "idle", Parameter::None)
            .unwrap()
            .0
    }

    #[test]
    fn completion_keeps_first_result() {
        let completion = Completion::new();
        let mut batch = ActivationBatch::new();
        completion.complete(json!(1).into(), &mut batch);
        completion.complete(json!(2).into(), &mut batch);
        assert!(completion.is_complete());
        assert_eq!(completion.result().unwrap().value(), Some(&json!(1)));
    }

    #[test]
    fn joiners_wake_on_completion() {
        let completion = Completion::new();
        let monitor = Monitor::new();
        let job = waiter();

        let wait = join(&completion, &monitor, &job, Some(Duration::from_secs(60)), None).unwrap();
        assert_eq!(monitor.tracked(), 1);

        let mut batch = ActivationBatch::new();
        completion.complete(Parameter::None, &mut batch);
        assert!(!wait.is_pending());
        assert_eq!(batch.len(), 1);
        assert!(join(&completion, &monitor, &job, None, None).is_none());
    }

    #[test]
    fn zero_timeout_on_open_flow_fails_at_once() {
        let completion = Completion::new();
        let monitor = Monitor::new();
        let mut batch = ActivationBatch::new();
        let resolved = wait_on_completion(
            &completion,
            &monitor,
            &waiter(),
            Some(Duration::ZERO),
            Some(json!("t")),
            &mut batch,
        );
        assert!(!resolved);
        assert_eq!(batch.len(), 1);
        assert_eq!(monitor.tracked(), 0);
    }
}
