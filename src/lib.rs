//! Cooperative unit-of-work execution kernel.
//!
//! Jobs are small state machines advanced one step at a time by whatever
//! [`Team`] they are assigned to. Jobs on the same thread never run
//! concurrently; jobs on different threads may. Resources are loaded and
//! coordinated before a job executes, and failures climb a fixed escalation
//! hierarchy until some handler job takes them.

pub mod activation;
pub mod config;
pub mod error;
pub mod escalation;
pub mod graph;
pub mod monitor;
pub mod orchestrator;
pub mod resource;
pub mod state_machine;
pub mod team;
pub mod tree;

pub use activation::ActivationBatch;
pub use config::{EngineConfig, TeamKind};
pub use error::{EngineError, Failure, FailureCategory, FailureKind, kinds};
pub use escalation::{EscalationLevel, EscalationTable};
pub use graph::{
    FailureSink, JobBehavior, JobSpec, Outcome, Parameter, ProcessGraph, ProcessGraphBuilder,
    ResourceSpec,
};
pub use monitor::Monitor;
pub use orchestrator::Engine;
pub use resource::{Dependencies, Loaded, ResourceHandle, ResourceObject, ResourceScope, ResourceSource};
pub use state_machine::{AsyncSignal, Job, JobContext, JobSnapshot, JobState};
pub use team::{ManualTeam, PassiveTeam, Team, ThreadPerJobTeam, TokioTeam, WorkerPoolTeam};
pub use tree::{FlowFuture, FlowHandle, JoinTarget, ProcessHandle, ProcessOutcome, ProcessReport, ThreadHandle};
