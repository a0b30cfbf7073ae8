use std::sync::Arc;

use parking_lot::Mutex;

use crate::activation::ActivationBatch;
use crate::error::{EngineError, Failure, FailureKind, kinds};
use crate::graph::ResourceIndex;
use crate::monitor::Wait;
use crate::tree::ProcessShared;

use super::ResourceObject;

enum Phase {
    Unloaded,
    Loading,
    Ready(ResourceObject),
    /// Loaded but temporarily unusable, e.g. an operation in flight.
    Busy(ResourceObject),
    Failed(Failure),
    Released,
}

struct ContainerState {
    phase: Phase,
    waiters: Vec<Arc<Wait>>,
}

pub(crate) enum Readiness {
    Ready,
    NotReady,
    Failed(Failure),
}

/// One binding of a resource within its scope.
pub(crate) struct ResourceContainer {
    pub(crate) index: ResourceIndex,
    state: Mutex<ContainerState>,
    coordinated: Mutex<bool>,
}

impl ResourceContainer {
    pub(crate) fn new(index: ResourceIndex) -> Arc<Self> {
        Arc::new(Self {
            index,
            state: Mutex::new(ContainerState {
                phase: Phase::Unloaded,
                waiters: Vec::new(),
            }),
            coordinated: Mutex::new(false),
        })
    }

    /// Claims the load. True exactly once, for the caller that must load.
    pub(crate) fn begin_load(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Unloaded) {
            state.phase = Phase::Loading;
            true
        } else {
            false
        }
    }

    /// Stores the object and wakes waiters. Returns the object back when the
    /// binding was already released or failed, so the caller can release it.
    pub(crate) fn set_ready(
        &self,
        object: ResourceObject,
        batch: &mut ActivationBatch,
    ) -> Option<ResourceObject> {
        let waiters = {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Released | Phase::Failed(_)) {
                return Some(object);
            }
            state.phase = Phase::Ready(object);
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.resolve(batch);
        }
        None
    }

    pub(crate) fn set_busy(&self) {
        let mut state = self.state.lock();
        if let Phase::Ready(object) = &state.phase {
            state.phase = Phase::Busy(object.clone());
        }
    }

    /// Ready again after [`set_busy`](Self::set_busy).
    pub(crate) fn clear_busy(&self, batch: &mut ActivationBatch) {
        let waiters = {
            let mut state = self.state.lock();
            let Phase::Busy(object) = &state.phase else {
                return;
            };
            state.phase = Phase::Ready(object.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.resolve(batch);
        }
    }

    /// Fails the binding and every waiter. Returns the object it held, for
    /// the caller to release, and whether any job was waiting.
    pub(crate) fn set_failed(
        &self,
        failure: Failure,
        batch: &mut ActivationBatch,
    ) -> (Option<ResourceObject>, bool) {
        let (object, waiters) = {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Released | Phase::Failed(_)) {
                return (None, false);
            }
            let previous = std::mem::replace(&mut state.phase, Phase::Failed(failure.clone()));
            let object = match previous {
                Phase::Ready(o) | Phase::Busy(o) => Some(o),
                _ => None,
            };
            (object, std::mem::take(&mut state.waiters))
        };
        let waited = !waiters.is_empty();
        for waiter in waiters {
            waiter.fail(failure.clone(), batch);
        }
        (object, waited)
    }

    /// Readiness check; `waiter` is registered atomically if not ready.
    pub(crate) fn check(&self, waiter: Option<&Arc<Wait>>) -> Readiness {
        let mut state = self.state.lock();
        match &state.phase {
            Phase::Ready(_) => Readiness::Ready,
            Phase::Failed(f) => Readiness::Failed(f.clone()),
            Phase::Released => Readiness::Failed(Failure::resource(
                kinds::RESOURCE_LOAD,
                self.index,
                "resource was released",
            )),
            Phase::Unloaded | Phase::Loading | Phase::Busy(_) => {
                if let Some(waiter) = waiter {
                    state.waiters.push(waiter.clone());
                }
                Readiness::NotReady
            }
        }
    }

    pub(crate) fn object(&self) -> Option<ResourceObject> {
        match &self.state.lock().phase {
            Phase::Ready(o) | Phase::Busy(o) => Some(o.clone()),
            _ => None,
        }
    }

    /// Runs `coordinate` the first time only.
    pub(crate) fn coordinate_once(
        &self,
        coordinate: impl FnOnce() -> Result<(), Failure>,
    ) -> Result<(), Failure> {
        let mut done = self.coordinated.lock();
        if *done {
            return Ok(());
        }
        coordinate()?;
        *done = true;
        Ok(())
    }

    /// Ends the binding, returning the object for the source to release.
    pub(crate) fn release(&self) -> Option<ResourceObject> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.phase, Phase::Released);
        state.waiters.clear();
        match previous {
            Phase::Ready(o) | Phase::Busy(o) => Some(o),
            _ => None,
        }
    }
}

/// Handed to a [`ResourceSource`](super::ResourceSource) on load so the
/// integration can report readiness from any OS thread, at any later time.
#[derive(Clone)]
pub struct ResourceHandle {
    container: Arc<ResourceContainer>,
    process: Arc<ProcessShared>,
}

impl ResourceHandle {
    pub(crate) fn new(container: Arc<ResourceContainer>, process: Arc<ProcessShared>) -> Self {
        Self { container, process }
    }

    pub fn name(&self) -> &str {
        self.process.graph.resource(self.container.index).name()
    }

    pub fn ready<T: std::any::Any + Send + Sync>(&self, value: T) {
        self.ready_object(Arc::new(value));
    }

    /// Reports the loaded object and wakes every job waiting on it.
    pub fn ready_object(&self, object: ResourceObject) {
        let mut batch = ActivationBatch::new();
        if let Some(late) = self.container.set_ready(object, &mut batch) {
            log::debug!("resource `{}` became ready after its binding ended", self.name());
            self.process
                .graph
                .resource(self.container.index)
                .source
                .release(late);
        }
        batch.activate_all();
    }

    /// Marks the loaded resource as not usable until [`idle`](Self::idle).
    pub fn busy(&self) {
        self.container.set_busy();
    }

    pub fn idle(&self) {
        let mut batch = ActivationBatch::new();
        self.container.clear_busy(&mut batch);
        batch.activate_all();
    }

    /// Fails the resource; every job waiting on it escalates `failure`. A
    /// loaded object is released, and later jobs requiring the resource in
    /// this binding fail with `failure`.
    pub fn fail(&self, failure: Failure) {
        let failure = Failure {
            category: crate::error::FailureCategory::Resource,
            ..failure.with_resource(self.container.index)
        };
        let mut batch = ActivationBatch::new();
        let (object, waited) = self.container.set_failed(failure.clone(), &mut batch);
        if !waited {
            log::warn!("resource `{}` failed with no job waiting on it: {failure}", self.name());
        }
        if let Some(object) = object {
            log::debug!("releasing failed resource `{}`", self.name());
            self.process
                .graph
                .resource(self.container.index)
                .source
                .release(object);
        }
        batch.activate_all();
    }

    /// Registers a resource-source level handler for failures this resource
    /// causes in the current process.
    pub fn register_escalation(
        &self,
        kind: impl Into<FailureKind>,
        handler: &str,
    ) -> Result<(), EngineError> {
        let job = self
            .process
            .graph
            .job_index(handler)
            .ok_or_else(|| EngineError::JobNotFound(handler.to_string()))?;
        self.process
            .register_source_escalation(self.container.index, kind.into(), job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{JobSpec, Outcome, Parameter, ProcessGraph};
    use crate::orchestrator::Engine;
    use crate::state_machine::{Job, JobContext};

    fn waiter() -> Arc<Wait> {
        let graph = ProcessGraph::builder()
            .job(JobSpec::new("idle", |_: &mut JobContext| Ok(Outcome::done())))
            .build()
            .unwrap();
        let (job, _): (Job, _) = Engine::default()
            .create_process(&graph, "idle", Parameter::None)
            .unwrap();
        Wait::new(job)
    }

    fn object(value: u32) -> ResourceObject {
        Arc::new(value)
    }

    #[test]
    fn load_is_claimed_once() {
        let container = ResourceContainer::new(ResourceIndex(0));
        assert!(container.begin_load());
        assert!(!container.begin_load());
    }

    #[test]
    fn ready_wakes_registered_waiter() {
        let container = ResourceContainer::new(ResourceIndex(0));
        let wait = waiter();
        assert!(matches!(container.check(Some(&wait)), Readiness::NotReady));

        let mut batch = ActivationBatch::new();
        assert!(container.set_ready(object(7), &mut batch).is_none());
        assert_eq!(batch.len(), 1);
        assert!(!wait.is_pending());
        assert!(matches!(container.check(None), Readiness::Ready));
        assert!(container.object().is_some());
    }

    #[test]
    fn busy_is_not_ready_until_idle() {
        let container = ResourceContainer::new(ResourceIndex(0));
        container.set_ready(object(1), &mut ActivationBatch::new());
        container.set_busy();

        let wait = waiter();
        assert!(matches!(container.check(Some(&wait)), Readiness::NotReady));
        assert!(container.object().is_some());

        let mut batch = ActivationBatch::new();
        container.clear_busy(&mut batch);
        assert_eq!(batch.len(), 1);
        assert!(matches!(container.check(None), Readiness::Ready));
    }

    #[test]
    fn failure_reaches_waiters() {
        let container = ResourceContainer::new(ResourceIndex(2));
        let wait = waiter();
        container.check(Some(&wait));

        let failure = Failure::resource(kinds::RESOURCE_LOAD, ResourceIndex(2), "refused");
        let mut batch = ActivationBatch::new();
        let (object_back, waited) = container.set_failed(failure.clone(), &mut batch);
        assert!(object_back.is_none());
        assert!(waited);
        assert_eq!(wait.failure(), Some(failure));
        assert!(matches!(container.check(None), Readiness::Failed(_)));

        // A late object goes back to the caller for release.
        assert!(container.set_ready(object(1), &mut batch).is_some());
        assert!(container.object().is_none());
    }

    #[test]
    fn failing_a_ready_resource_hands_back_its_object() {
        let container = ResourceContainer::new(ResourceIndex(0));
        container.set_ready(object(4), &mut ActivationBatch::new());
        container.set_busy();

        let failure = Failure::resource(kinds::RESOURCE_LOAD, ResourceIndex(0), "connection lost");
        let (object_back, waited) = container.set_failed(failure, &mut ActivationBatch::new());
        assert!(!waited);
        let object_back = object_back.unwrap();
        assert_eq!(object_back.downcast_ref::<u32>(), Some(&4));
        assert!(container.object().is_none());
        assert!(container.release().is_none());
    }

    #[test]
    fn late_object_is_handed_back_after_release() {
        let container = ResourceContainer::new(ResourceIndex(0));
        assert!(container.release().is_none());
        assert!(container.set_ready(object(3), &mut ActivationBatch::new()).is_some());
        assert!(matches!(container.check(None), Readiness::Failed(_)));
    }

    #[test]
    fn coordinate_runs_once() {
        let container = ResourceContainer::new(ResourceIndex(0));
        let mut calls = 0;
        container.coordinate_once(|| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        container.coordinate_once(|| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn failed_coordination_is_retried() {
        let container = ResourceContainer::new(ResourceIndex(0));
        let failed = container.coordinate_once(|| Err(Failure::new(kinds::RESOURCE_COORDINATE, "not wired")));
        assert!(failed.is_err());
        assert!(container.coordinate_once(|| Ok(())).is_ok());
    }
}
