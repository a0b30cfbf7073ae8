//! Managed resources: scopes, source integrations and per-job coordination.

mod container;
mod coordinator;

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Failure, kinds};
use crate::graph::{ProcessGraph, ResourceIndex};

pub use container::ResourceHandle;
pub(crate) use container::ResourceContainer;
pub(crate) use coordinator::{BindingMap, Bindings, ResourceCoordinator, release_all};

/// The object a resource source produced, shared with every job bound to it.
pub type ResourceObject = Arc<dyn Any + Send + Sync>;

/// Lifetime of a resource binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceScope {
    /// Loaded once, shared by every thread of the process.
    Process,
    /// Loaded once per thread, released when the thread completes.
    Thread,
    /// Loaded for one job, released when that job completes.
    Invocation,
}

/// What a source returned from [`ResourceSource::load`].
pub enum Loaded {
    Ready(ResourceObject),
    /// Loading continues elsewhere; the source reports through the
    /// [`ResourceHandle`] it was given.
    Pending,
}

impl Loaded {
    pub fn ready<T: Any + Send + Sync>(value: T) -> Self {
        Loaded::Ready(Arc::new(value))
    }
}

/// Integration that produces and tears down one kind of resource.
pub trait ResourceSource: Send + Sync {
    fn load(&self, handle: ResourceHandle) -> Result<Loaded, Failure>;

    /// Wires `object` to the objects of the resources it depends on. Called
    /// once per binding, after every dependency is ready.
    fn coordinate(
        &self,
        _object: &ResourceObject,
        _dependencies: &Dependencies<'_>,
    ) -> Result<(), Failure> {
        Ok(())
    }

    fn release(&self, _object: ResourceObject) {}
}

/// Objects of the resources another resource depends on.
pub struct Dependencies<'a> {
    graph: &'a ProcessGraph,
    objects: Vec<(ResourceIndex, ResourceObject)>,
}

impl<'a> Dependencies<'a> {
    pub(crate) fn new(graph: &'a ProcessGraph, objects: Vec<(ResourceIndex, ResourceObject)>) -> Self {
        Self { graph, objects }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Object of the dependency called `name`, as a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, Failure> {
        let index = self.graph.resource_index(name).ok_or_else(|| {
            Failure::new(kinds::RESOURCE_UNKNOWN, format!("unknown resource `{name}`"))
        })?;
        let object = self
            .objects
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, o)| o)
            .ok_or_else(|| {
                Failure::resource(
                    kinds::RESOURCE_UNKNOWN,
                    index,
                    format!("`{name}` is not a dependency"),
                )
            })?;
        downcast(object, index, name)
    }
}

pub(crate) fn downcast<T: Any + Send + Sync>(
    object: &ResourceObject,
    index: ResourceIndex,
    name: &str,
) -> Result<Arc<T>, Failure> {
    object.clone().downcast::<T>().map_err(|_| {
        Failure::resource(
            kinds::RESOURCE_TYPE,
            index,
            format!(
                "resource `{name}` is not a {}",
                std::any::type_name::<T>()
            ),
        )
    })
}
