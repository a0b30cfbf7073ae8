use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::activation::ActivationBatch;
use crate::error::{Failure, kinds};
use crate::graph::{JobIndex, Parameter, ResourceIndex};
use crate::monitor::{Wait, WaitOutcome};
use crate::resource::{ResourceObject, downcast};
use crate::tree::{Completion, FlowHandle, JoinTarget, ProcessShared, ThreadHandle, ThreadShared, join};

use super::job::Job;

/// Instigations and waits a behavior requested, applied by the job
/// container once the behavior returns.
#[derive(Default)]
pub(crate) struct Requests {
    pub sequential: Vec<(JobIndex, Parameter)>,
    pub parallel: Vec<(JobIndex, Parameter, Arc<Completion>)>,
    pub asynchronous: Vec<Job>,
    pub joins: Vec<Arc<Wait>>,
    pub signal: Option<AsyncSignal>,
}

/// What a job behavior sees while it runs.
pub struct JobContext {
    job: Job,
    process: Arc<ProcessShared>,
    name: String,
    parameter: Parameter,
    resumed: Option<Parameter>,
    resources: Vec<(ResourceIndex, ResourceObject)>,
    requests: Requests,
}

impl JobContext {
    pub(crate) fn new(
        job: Job,
        process: Arc<ProcessShared>,
        name: String,
        parameter: Parameter,
        resumed: Option<Parameter>,
        resources: Vec<(ResourceIndex, ResourceObject)>,
    ) -> Self {
        Self {
            job,
            process,
            name,
            parameter,
            resumed,
            resources,
            requests: Requests::default(),
        }
    }

    pub(crate) fn into_requests(self) -> Requests {
        self.requests
    }

    pub fn job_name(&self) -> &str {
        &self.name
    }

    pub fn process_id(&self) -> Uuid {
        self.process.id
    }

    pub fn parameter(&self) -> &Parameter {
        &self.parameter
    }

    /// The failure an escalation handler was instigated for.
    pub fn failure(&self) -> Option<&Failure> {
        self.parameter.failure()
    }

    /// Value the async signal was resumed with, when this execution follows
    /// a suspension.
    pub fn resumed(&self) -> Option<&Parameter> {
        self.resumed.as_ref()
    }

    /// Object of a ready resource this job requires, directly or through a
    /// dependency.
    pub fn resource<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, Failure> {
        let unknown = || Failure::new(kinds::RESOURCE_UNKNOWN, format!("job `{}` has no resource `{name}`", self.name));
        let index = self.process.graph.resource_index(name).ok_or_else(unknown)?;
        let (_, object) = self
            .resources
            .iter()
            .find(|(i, _)| *i == index)
            .ok_or_else(unknown)?;
        downcast(object, index, name)
    }

    fn job_index(&self, job: &str) -> Result<JobIndex, Failure> {
        self.process.graph.job_index(job).ok_or_else(|| {
            Failure::new(kinds::FLOW_UNKNOWN_JOB, format!("no job named `{job}`"))
        })
    }

    /// Runs `job` after this one in the same flow, ahead of the static next.
    pub fn sequential(&mut self, job: &str, parameter: impl Into<Parameter>) -> Result<(), Failure> {
        let index = self.job_index(job)?;
        self.requests.sequential.push((index, parameter.into()));
        Ok(())
    }

    /// Starts `job` in a new flow on this thread. This job does not complete
    /// before that flow does.
    pub fn parallel(&mut self, job: &str, parameter: impl Into<Parameter>) -> Result<FlowHandle, Failure> {
        let index = self.job_index(job)?;
        let completion = Completion::new();
        self.requests
            .parallel
            .push((index, parameter.into(), completion.clone()));
        Ok(FlowHandle {
            completion,
            monitor: self.process.monitor.clone(),
        })
    }

    /// Starts `job` on a new thread of this process. The thread runs even if
    /// this behavior then fails.
    pub fn asynchronous(
        &mut self,
        job: &str,
        parameter: impl Into<Parameter>,
    ) -> Result<ThreadHandle, Failure> {
        let index = self.job_index(job)?;
        let first = ThreadShared::spawn(&self.process, index, parameter.into());
        let handle = first.thread_handle();
        self.requests.asynchronous.push(first);
        Ok(handle)
    }

    /// Keeps this job from finishing until `target` resolves. Any number of
    /// joins may be outstanding; the first one that times out, in the order
    /// they were requested, fails the job with `join.timeout` and its token.
    /// A zero timeout on an unresolved target fails the job right away.
    pub fn join(&mut self, target: impl Into<JoinTarget>, timeout: Option<Duration>, token: Option<Value>) {
        let target = target.into();
        let (completion, monitor) = target.parts();
        if timeout == Some(Duration::ZERO) {
            if !completion.is_complete() {
                let wait = Wait::new(self.job.clone());
                let mut batch = ActivationBatch::new();
                wait.fail(Failure::join_timeout(token), &mut batch);
                batch.activate_all();
                self.requests.joins.push(wait);
            }
            return;
        }
        if let Some(wait) = join(completion, monitor, &self.job, timeout, token) {
            self.requests.joins.push(wait);
        }
    }

    /// Obtains the signal to resume this job with. Return
    /// [`Outcome::Suspended`](crate::graph::Outcome::Suspended) to wait for
    /// it. Repeated calls in one execution return the same signal.
    pub fn suspend(&mut self, timeout: Option<Duration>) -> AsyncSignal {
        if let Some(signal) = &self.requests.signal {
            return signal.clone();
        }
        let signal = AsyncSignal::new(Wait::new(self.job.clone()));
        if let Some(timeout) = timeout {
            self.process.monitor.register(
                Instant::now() + timeout,
                signal.shared.wait.clone(),
                Failure::signal_timeout(),
            );
        }
        self.requests.signal = Some(signal.clone());
        signal
    }
}

struct SignalShared {
    wait: Arc<Wait>,
    value: Mutex<Option<Parameter>>,
}

/// Resumes a suspended job from outside, once.
#[derive(Clone)]
pub struct AsyncSignal {
    shared: Arc<SignalShared>,
}

impl AsyncSignal {
    fn new(wait: Arc<Wait>) -> Self {
        Self {
            shared: Arc::new(SignalShared {
                wait,
                value: Mutex::new(None),
            }),
        }
    }

    /// Resumes the job; it executes again with `value` as
    /// [`JobContext::resumed`]. False if the signal already settled.
    pub fn resume(&self, value: impl Into<Parameter>) -> bool {
        let mut batch = ActivationBatch::new();
        let resumed = {
            let mut slot = self.shared.value.lock();
            if !self.shared.wait.is_pending() {
                return false;
            }
            *slot = Some(value.into());
            self.shared.wait.resolve(&mut batch)
        };
        batch.activate_all();
        resumed
    }

    /// Fails the suspended job with `failure`.
    pub fn fail(&self, failure: Failure) -> bool {
        let mut batch = ActivationBatch::new();
        let failed = self.shared.wait.fail(failure, &mut batch);
        batch.activate_all();
        failed
    }

    pub fn is_pending(&self) -> bool {
        self.shared.wait.is_pending()
    }

    pub(crate) fn outcome(&self) -> WaitOutcome {
        self.shared.wait.outcome()
    }

    pub(crate) fn take_value(&self) -> Parameter {
        self.shared.value.lock().take().unwrap_or_default()
    }
}
