use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::activation::ActivationBatch;
use crate::error::{Failure, FailureCategory, kinds};
use crate::graph::ResourceIndex;
use crate::monitor::Wait;
use crate::state_machine::Job;
use crate::tree::ProcessShared;

use super::container::{Readiness, ResourceContainer, ResourceHandle};
use super::{Dependencies, Loaded, ResourceObject, ResourceScope};

pub(crate) type BindingMap = HashMap<ResourceIndex, Arc<ResourceContainer>>;

/// Thread-scoped and invocation-scoped bindings visible to one job.
/// Process-scoped bindings live on the process.
pub(crate) struct Bindings<'a> {
    pub thread: &'a mut BindingMap,
    pub node: &'a mut BindingMap,
}

/// Loads, readiness-checks and coordinates the resources of one job step.
/// Runs under the job's thread lock.
pub(crate) struct ResourceCoordinator<'a> {
    process: &'a Arc<ProcessShared>,
    bindings: Bindings<'a>,
}

impl<'a> ResourceCoordinator<'a> {
    pub(crate) fn new(process: &'a Arc<ProcessShared>, bindings: Bindings<'a>) -> Self {
        Self { process, bindings }
    }

    fn container(&mut self, index: ResourceIndex) -> Arc<ResourceContainer> {
        match self.process.graph.resource(index).scope {
            ResourceScope::Process => self.process.binding(index),
            ResourceScope::Thread => self
                .bindings
                .thread
                .entry(index)
                .or_insert_with(|| ResourceContainer::new(index))
                .clone(),
            ResourceScope::Invocation => self
                .bindings
                .node
                .entry(index)
                .or_insert_with(|| ResourceContainer::new(index))
                .clone(),
        }
    }

    /// Starts loading every resource not yet claimed. True when all of them
    /// are already usable.
    pub(crate) fn load(&mut self, indices: &[ResourceIndex]) -> Result<bool, Failure> {
        let mut all_ready = true;
        for &index in indices {
            let container = self.container(index);
            if container.begin_load() {
                let meta = self.process.graph.resource(index);
                log::debug!("loading resource `{}`", meta.name());
                let handle = ResourceHandle::new(container.clone(), self.process.clone());
                let mut batch = ActivationBatch::new();
                match meta.source.load(handle) {
                    Ok(Loaded::Ready(object)) => {
                        if let Some(late) = container.set_ready(object, &mut batch) {
                            meta.source.release(late);
                        }
                    }
                    Ok(Loaded::Pending) => {}
                    Err(failure) => {
                        let failure = attribute(failure, index);
                        container.set_failed(failure.clone(), &mut batch);
                        batch.activate_all();
                        return Err(failure);
                    }
                }
                batch.activate_all();
            }
            if let Readiness::Failed(failure) = container.check(None) {
                return Err(failure);
            }
            all_ready &= container.object().is_some();
        }
        Ok(all_ready)
    }

    /// Non-blocking readiness check. For every resource not yet usable a
    /// wait for `job` is registered (once) so readiness reactivates it.
    pub(crate) fn is_ready(
        &mut self,
        indices: &[ResourceIndex],
        waits: &mut Vec<(ResourceIndex, Arc<Wait>)>,
        job: &Job,
    ) -> Result<bool, Failure> {
        if let Some(failure) = waits.iter().find_map(|(_, w)| w.failure()) {
            return Err(failure);
        }
        waits.retain(|(_, w)| w.is_pending());

        let mut all_ready = true;
        for &index in indices {
            let container = self.container(index);
            let pending = waits.iter().any(|(i, _)| *i == index);
            let fresh = (!pending).then(|| Wait::new(job.clone()));
            match container.check(fresh.as_ref()) {
                Readiness::Ready => {}
                Readiness::Failed(failure) => return Err(failure),
                Readiness::NotReady => {
                    all_ready = false;
                    if let Some(wait) = fresh {
                        let meta = self.process.graph.resource(index);
                        if let Some(timeout) = meta.ready_timeout {
                            self.process.monitor.register(
                                Instant::now() + timeout,
                                wait.clone(),
                                Failure::resource(
                                    kinds::RESOURCE_TIMEOUT,
                                    index,
                                    format!("resource `{}` not ready within {timeout:?}", meta.name()),
                                ),
                            );
                        }
                        waits.push((index, wait));
                    }
                }
            }
        }
        Ok(all_ready)
    }

    /// Wires each resource to its dependencies, dependencies first. Each
    /// binding is coordinated at most once.
    pub(crate) fn coordinate(&mut self, indices: &[ResourceIndex]) -> Result<(), Failure> {
        let graph = self.process.graph.clone();
        for &index in indices {
            let meta = graph.resource(index);
            let container = self.container(index);
            let mut dependencies = Vec::with_capacity(meta.dependencies.len());
            for &dep in &meta.dependencies {
                if let Some(object) = self.container(dep).object() {
                    dependencies.push((dep, object));
                }
            }
            container.coordinate_once(|| {
                let object = container.object().ok_or_else(|| {
                    Failure::resource(
                        kinds::RESOURCE_COORDINATE,
                        index,
                        format!("resource `{}` has no object", meta.name()),
                    )
                })?;
                meta.source
                    .coordinate(&object, &Dependencies::new(&graph, dependencies))
                    .map_err(|f| attribute(f, index))
            })?;
        }
        Ok(())
    }

    /// Ready objects of `indices`, for the job context.
    pub(crate) fn objects(&mut self, indices: &[ResourceIndex]) -> Vec<(ResourceIndex, ResourceObject)> {
        let mut objects = Vec::with_capacity(indices.len());
        for &index in indices {
            if let Some(object) = self.container(index).object() {
                objects.push((index, object));
            }
        }
        objects
    }
}

fn attribute(failure: Failure, index: ResourceIndex) -> Failure {
    Failure {
        category: FailureCategory::Resource,
        resource: failure.resource.or(Some(index)),
        ..failure
    }
}

/// Releases every binding in `bindings` through its source.
pub(crate) fn release_all(process: &ProcessShared, bindings: BindingMap) {
    for (index, container) in bindings {
        if let Some(object) = container.release() {
            let meta = process.graph.resource(index);
            log::debug!("releasing resource `{}`", meta.name());
            meta.source.release(object);
        }
    }
}
