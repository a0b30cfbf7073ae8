//! Resolved, immutable execution graph consumed by the engine.
//!
//! A [`ProcessGraph`] is what a configuration compiler would hand to the
//! kernel: per-job required resources, static successor, escalation table and
//! team; per-resource scope and source; thread-level and process-level
//! escalation. It is assembled by name through [`ProcessGraphBuilder`] and
//! validated once in [`ProcessGraphBuilder::build`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Failure, FailureKind};
use crate::escalation::EscalationTable;
use crate::resource::{ResourceScope, ResourceSource};
use crate::state_machine::JobContext;
use crate::team::{PassiveTeam, Team};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIndex(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIndex(pub(crate) usize);

/// Value handed from one job to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Parameter {
    #[default]
    None,
    Value(serde_json::Value),
    /// Escalation handlers receive the failure they handle.
    Failure(Failure),
}

impl Parameter {
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Parameter::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Parameter::Failure(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Parameter::None)
    }
}

impl From<serde_json::Value> for Parameter {
    fn from(value: serde_json::Value) -> Self {
        Parameter::Value(value)
    }
}

/// How a behavior finished one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Finished normally; the value feeds the implicit next job.
    Complete(Parameter),
    /// Waiting on the [`AsyncSignal`](crate::state_machine::AsyncSignal)
    /// obtained from [`JobContext::suspend`].
    Suspended,
}

impl Outcome {
    pub fn done() -> Self {
        Outcome::Complete(Parameter::None)
    }

    pub fn value(value: serde_json::Value) -> Self {
        Outcome::Complete(Parameter::Value(value))
    }
}

/// The executable body of a job.
pub trait JobBehavior: Send + Sync {
    fn execute(&self, ctx: &mut JobContext) -> Result<Outcome, Failure>;
}

impl<F> JobBehavior for F
where
    F: Fn(&mut JobContext) -> Result<Outcome, Failure> + Send + Sync,
{
    fn execute(&self, ctx: &mut JobContext) -> Result<Outcome, Failure> {
        self(ctx)
    }
}

/// Receives failures that reached the top of the hierarchy.
pub type FailureSink = Arc<dyn Fn(&Failure) + Send + Sync>;

pub struct JobMetadata {
    pub(crate) name: String,
    pub(crate) behavior: Arc<dyn JobBehavior>,
    /// Required resources plus their transitive dependencies, dependencies first.
    pub(crate) resources: Vec<ResourceIndex>,
    pub(crate) next: Option<JobIndex>,
    pub(crate) escalations: EscalationTable,
    pub(crate) team: Option<Arc<dyn Team>>,
}

impl JobMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct ResourceMetadata {
    pub(crate) name: String,
    pub(crate) scope: ResourceScope,
    pub(crate) source: Arc<dyn ResourceSource>,
    pub(crate) dependencies: Vec<ResourceIndex>,
    pub(crate) ready_timeout: Option<Duration>,
    pub(crate) escalations: EscalationTable,
}

impl ResourceMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> ResourceScope {
        self.scope
    }
}

pub struct ThreadMetadata {
    pub(crate) escalations: EscalationTable,
    pub(crate) default_team: Arc<dyn Team>,
}

/// The resolved graph for one process type.
pub struct ProcessGraph {
    pub(crate) jobs: Vec<JobMetadata>,
    job_names: HashMap<String, JobIndex>,
    pub(crate) resources: Vec<ResourceMetadata>,
    resource_names: HashMap<String, ResourceIndex>,
    pub(crate) thread: ThreadMetadata,
    pub(crate) source_escalations: EscalationTable,
    pub(crate) process_escalations: EscalationTable,
    pub(crate) fatal_sink: Option<FailureSink>,
    pub(crate) last_resort: Option<FailureSink>,
}

impl ProcessGraph {
    pub fn builder() -> ProcessGraphBuilder {
        ProcessGraphBuilder::default()
    }

    pub fn job_index(&self, name: &str) -> Option<JobIndex> {
        self.job_names.get(name).copied()
    }

    pub fn resource_index(&self, name: &str) -> Option<ResourceIndex> {
        self.resource_names.get(name).copied()
    }

    pub(crate) fn job(&self, index: JobIndex) -> &JobMetadata {
        &self.jobs[index.0]
    }

    pub(crate) fn resource(&self, index: ResourceIndex) -> &ResourceMetadata {
        &self.resources[index.0]
    }

    pub(crate) fn team_for(&self, index: JobIndex) -> Arc<dyn Team> {
        self.job(index)
            .team
            .clone()
            .unwrap_or_else(|| self.thread.default_team.clone())
    }
}

/// Declares one job by name.
pub struct JobSpec {
    name: String,
    behavior: Arc<dyn JobBehavior>,
    requires: Vec<String>,
    next: Option<String>,
    escalations: Vec<(FailureKind, String)>,
    team: Option<String>,
}

impl JobSpec {
    pub fn new<F>(name: impl Into<String>, behavior: F) -> Self
    where
        F: Fn(&mut JobContext) -> Result<Outcome, Failure> + Send + Sync + 'static,
    {
        Self::with_behavior(name, Arc::new(behavior))
    }

    pub fn with_behavior(name: impl Into<String>, behavior: Arc<dyn JobBehavior>) -> Self {
        Self {
            name: name.into(),
            behavior,
            requires: Vec::new(),
            next: None,
            escalations: Vec::new(),
            team: None,
        }
    }

    pub fn requires(mut self, resource: impl Into<String>) -> Self {
        self.requires.push(resource.into());
        self
    }

    pub fn next(mut self, job: impl Into<String>) -> Self {
        self.next = Some(job.into());
        self
    }

    pub fn escalate(mut self, kind: impl Into<FailureKind>, handler: impl Into<String>) -> Self {
        self.escalations.push((kind.into(), handler.into()));
        self
    }

    pub fn team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }
}

/// Declares one managed resource by name.
pub struct ResourceSpec {
    name: String,
    scope: ResourceScope,
    source: Arc<dyn ResourceSource>,
    depends_on: Vec<String>,
    ready_timeout: Option<Duration>,
    escalations: Vec<(FailureKind, String)>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, scope: ResourceScope, source: Arc<dyn ResourceSource>) -> Self {
        Self {
            name: name.into(),
            scope,
            source,
            depends_on: Vec::new(),
            ready_timeout: None,
            escalations: Vec::new(),
        }
    }

    pub fn depends_on(mut self, resource: impl Into<String>) -> Self {
        self.depends_on.push(resource.into());
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    pub fn escalate(mut self, kind: impl Into<FailureKind>, handler: impl Into<String>) -> Self {
        self.escalations.push((kind.into(), handler.into()));
        self
    }
}

#[derive(Default)]
pub struct ProcessGraphBuilder {
    jobs: Vec<JobSpec>,
    resources: Vec<ResourceSpec>,
    teams: HashMap<String, Arc<dyn Team>>,
    default_team: Option<String>,
    thread_escalations: Vec<(FailureKind, String)>,
    source_escalations: Vec<(FailureKind, String)>,
    process_escalations: Vec<(FailureKind, String)>,
    fatal_sink: Option<FailureSink>,
    last_resort: Option<FailureSink>,
}

impl ProcessGraphBuilder {
    pub fn job(mut self, job: JobSpec) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn resource(mut self, resource: ResourceSpec) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn team(mut self, name: impl Into<String>, team: Arc<dyn Team>) -> Self {
        self.teams.insert(name.into(), team);
        self
    }

    /// Team used by jobs that name none. A passive team when unset.
    pub fn default_team(mut self, name: impl Into<String>) -> Self {
        self.default_team = Some(name.into());
        self
    }

    pub fn thread_escalate(mut self, kind: impl Into<FailureKind>, handler: impl Into<String>) -> Self {
        self.thread_escalations.push((kind.into(), handler.into()));
        self
    }

    pub fn source_escalate(mut self, kind: impl Into<FailureKind>, handler: impl Into<String>) -> Self {
        self.source_escalations.push((kind.into(), handler.into()));
        self
    }

    pub fn process_escalate(mut self, kind: impl Into<FailureKind>, handler: impl Into<String>) -> Self {
        self.process_escalations.push((kind.into(), handler.into()));
        self
    }

    pub fn fatal_sink(mut self, sink: impl Fn(&Failure) + Send + Sync + 'static) -> Self {
        self.fatal_sink = Some(Arc::new(sink));
        self
    }

    pub fn last_resort(mut self, sink: impl Fn(&Failure) + Send + Sync + 'static) -> Self {
        self.last_resort = Some(Arc::new(sink));
        self
    }

    pub fn build(self) -> Result<Arc<ProcessGraph>, EngineError> {
        let mut job_names = HashMap::new();
        for (i, job) in self.jobs.iter().enumerate() {
            if job_names.insert(job.name.clone(), JobIndex(i)).is_some() {
                return Err(EngineError::Duplicate {
                    what: "job",
                    name: job.name.clone(),
                });
            }
        }
        let mut resource_names = HashMap::new();
        for (i, resource) in self.resources.iter().enumerate() {
            if resource_names
                .insert(resource.name.clone(), ResourceIndex(i))
                .is_some()
            {
                return Err(EngineError::Duplicate {
                    what: "resource",
                    name: resource.name.clone(),
                });
            }
        }

        let job_of = |name: &str| {
            job_names
                .get(name)
                .copied()
                .ok_or_else(|| EngineError::JobNotFound(name.to_string()))
        };
        let resource_of = |name: &str| {
            resource_names
                .get(name)
                .copied()
                .ok_or_else(|| EngineError::ResourceNotFound(name.to_string()))
        };
        let team_of = |name: &str| {
            self.teams
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::TeamNotFound(name.to_string()))
        };
        let table_of = |entries: &[(FailureKind, String)]| -> Result<EscalationTable, EngineError> {
            let mut table = EscalationTable::new();
            for (kind, handler) in entries {
                table.push(kind.clone(), job_of(handler.as_str())?);
            }
            Ok(table)
        };

        let mut resources = Vec::with_capacity(self.resources.len());
        for spec in &self.resources {
            let dependencies = spec
                .depends_on
                .iter()
                .map(|d| resource_of(d.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            resources.push(ResourceMetadata {
                name: spec.name.clone(),
                scope: spec.scope,
                source: spec.source.clone(),
                dependencies,
                ready_timeout: spec.ready_timeout,
                escalations: table_of(&spec.escalations)?,
            });
        }
        for i in 0..resources.len() {
            resource_closure(&resources, &[ResourceIndex(i)])?;
        }

        let mut jobs = Vec::with_capacity(self.jobs.len());
        for spec in &self.jobs {
            let required = spec
                .requires
                .iter()
                .map(|r| resource_of(r.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            jobs.push(JobMetadata {
                name: spec.name.clone(),
                behavior: spec.behavior.clone(),
                resources: resource_closure(&resources, &required)?,
                next: spec.next.as_deref().map(job_of).transpose()?,
                escalations: table_of(&spec.escalations)?,
                team: spec.team.as_deref().map(team_of).transpose()?,
            });
        }

        let default_team = match &self.default_team {
            Some(name) => team_of(name)?,
            None => Arc::new(PassiveTeam::new()) as Arc<dyn Team>,
        };

        Ok(Arc::new(ProcessGraph {
            thread: ThreadMetadata {
                escalations: table_of(&self.thread_escalations)?,
                default_team,
            },
            source_escalations: table_of(&self.source_escalations)?,
            process_escalations: table_of(&self.process_escalations)?,
            jobs,
            job_names,
            resources,
            resource_names,
            fatal_sink: self.fatal_sink,
            last_resort: self.last_resort,
        }))
    }
}

/// Transitive closure of `roots` in dependency order, rejecting cycles.
fn resource_closure(
    resources: &[ResourceMetadata],
    roots: &[ResourceIndex],
) -> Result<Vec<ResourceIndex>, EngineError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(
        resources: &[ResourceMetadata],
        index: ResourceIndex,
        marks: &mut [Mark],
        order: &mut Vec<ResourceIndex>,
    ) -> Result<(), EngineError> {
        match marks[index.0] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                return Err(EngineError::ResourceCycle(resources[index.0].name.clone()));
            }
            Mark::Unvisited => {}
        }
        marks[index.0] = Mark::Visiting;
        for dep in &resources[index.0].dependencies {
            visit(resources, *dep, marks, order)?;
        }
        marks[index.0] = Mark::Done;
        order.push(index);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; resources.len()];
    let mut order = Vec::new();
    for root in roots {
        visit(resources, *root, &mut marks, &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Loaded, ResourceHandle};

    struct Constant;

    impl ResourceSource for Constant {
        fn load(&self, _handle: ResourceHandle) -> Result<Loaded, Failure> {
            Ok(Loaded::ready(1u32))
        }
    }

    fn noop(_: &mut JobContext) -> Result<Outcome, Failure> {
        Ok(Outcome::done())
    }

    fn resource(name: &str) -> ResourceSpec {
        ResourceSpec::new(name, ResourceScope::Invocation, Arc::new(Constant))
    }

    #[test]
    fn build_resolves_names() {
        let graph = ProcessGraph::builder()
            .job(JobSpec::new("a", noop).next("b").escalate("io", "handler"))
            .job(JobSpec::new("b", noop))
            .job(JobSpec::new("handler", noop))
            .build()
            .unwrap();

        let a = graph.job_index("a").unwrap();
        assert_eq!(graph.job(a).next, graph.job_index("b"));
        assert_eq!(graph.job(a).escalations.len(), 1);
        assert!(graph.job_index("missing").is_none());
    }

    #[test]
    fn build_rejects_unknown_next() {
        let err = ProcessGraph::builder()
            .job(JobSpec::new("a", noop).next("nowhere"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::JobNotFound(name) if name == "nowhere"));
    }

    #[test]
    fn build_rejects_duplicate_jobs() {
        let err = ProcessGraph::builder()
            .job(JobSpec::new("a", noop))
            .job(JobSpec::new("a", noop))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Duplicate { what: "job", .. }));
    }

    #[test]
    fn build_rejects_unknown_team() {
        let err = ProcessGraph::builder()
            .job(JobSpec::new("a", noop).team("pool"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::TeamNotFound(_)));
    }

    #[test]
    fn resource_closure_orders_dependencies_first() {
        let graph = ProcessGraph::builder()
            .resource(resource("pool"))
            .resource(resource("repo").depends_on("pool"))
            .resource(resource("service").depends_on("repo").depends_on("pool"))
            .job(JobSpec::new("a", noop).requires("service"))
            .build()
            .unwrap();

        let a = graph.job_index("a").unwrap();
        let names: Vec<&str> = graph
            .job(a)
            .resources
            .iter()
            .map(|r| graph.resource(*r).name())
            .collect();
        assert_eq!(names, vec!["pool", "repo", "service"]);
    }

    #[test]
    fn resource_cycle_is_rejected() {
        let err = ProcessGraph::builder()
            .resource(resource("a").depends_on("b"))
            .resource(resource("b").depends_on("a"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ResourceCycle(_)));
    }
}
