//! Execution strategies jobs are submitted to.
//!
//! A team decides when and on which OS thread [`Job::do_job`] runs. The
//! engine makes no assumption about timing: a team may run the job before
//! `assign` returns, much later, or on another thread.

mod manual;
mod passive;
mod pool;
mod spawn;
mod tokio_team;

use crate::state_machine::Job;

pub use manual::ManualTeam;
pub use passive::PassiveTeam;
pub use pool::WorkerPoolTeam;
pub use spawn::ThreadPerJobTeam;
pub use tokio_team::TokioTeam;

pub trait Team: Send + Sync {
    /// Takes responsibility for calling `job.do_job()`.
    fn assign(&self, job: Job);

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::config::{EngineConfig, TeamKind};
    use crate::graph::{JobSpec, Outcome, Parameter, ProcessGraph};
    use crate::orchestrator::Engine;
    use crate::state_machine::JobContext;

    fn passive_engine() -> Engine {
        Engine::new(EngineConfig {
            team: TeamKind::Passive,
            ..EngineConfig::default()
        })
    }

    fn counting_graph(team: Arc<dyn Team>, counter: Arc<AtomicUsize>) -> Arc<ProcessGraph> {
        ProcessGraph::builder()
            .team("under-test", team)
            .default_team("under-test")
            .job(JobSpec::new("count", move |_: &mut JobContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::done())
            }))
            .build()
            .unwrap()
    }

    #[test]
    fn passive_chain_runs_in_constant_stack() {
        let graph = ProcessGraph::builder()
            .team("passive", Arc::new(PassiveTeam::new()))
            .default_team("passive")
            .job(JobSpec::new("step", |ctx: &mut JobContext| {
                let n = ctx.parameter().value().and_then(Value::as_u64).unwrap_or_default();
                if n < 5_000 {
                    ctx.sequential("step", json!(n + 1))?;
                }
                Ok(Outcome::value(json!(n)))
            }))
            .build()
            .unwrap();

        let report = passive_engine()
            .invoke(&graph, "step", json!(0).into())
            .unwrap()
            .wait();
        assert!(report.is_success());
        assert_eq!(report.jobs_executed, 5_001);
    }

    #[test]
    fn manual_team_runs_in_order() {
        let team = Arc::new(ManualTeam::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let graph = counting_graph(team.clone(), counter.clone());
        let engine = passive_engine();

        let first = engine.invoke(&graph, "count", Parameter::None).unwrap();
        let second = engine.invoke(&graph, "count", Parameter::None).unwrap();
        assert_eq!(team.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(team.run_next());
        assert!(first.report().is_some());
        assert!(second.report().is_none());
        assert_eq!(team.run_all(), 1);
        assert!(!team.run_next());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pool_runs_every_assigned_job() {
        let pool = Arc::new(WorkerPoolTeam::new("test-pool", 3));
        assert_eq!(pool.workers(), 3);
        let counter = Arc::new(AtomicUsize::new(0));
        let graph = counting_graph(pool.clone(), counter.clone());
        let engine = passive_engine();

        let handles: Vec<_> = (0..20)
            .map(|_| engine.invoke(&graph, "count", Parameter::None).unwrap())
            .collect();
        for handle in handles {
            assert!(handle.wait_timeout(Duration::from_secs(5)).unwrap().is_success());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn shut_down_pool_rejects_new_jobs() {
        let manual = Arc::new(ManualTeam::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let graph = counting_graph(manual.clone(), counter.clone());
        let (job, handle) = passive_engine()
            .create_process(&graph, "count", Parameter::None)
            .unwrap();

        let pool = WorkerPoolTeam::new("closed", 1);
        pool.shutdown();
        assert_eq!(pool.workers(), 0);
        pool.assign(job.clone());
        assert_eq!(pool.queued(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(handle.report().is_none());

        // A rejected job is no longer queued, so activating it submits it again.
        job.activate_job();
        assert_eq!(manual.run_all(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(handle.report().unwrap().is_success());
    }

    #[test]
    fn thread_per_job_returns_before_running() {
        let counter = Arc::new(AtomicUsize::new(0));
        let graph = counting_graph(Arc::new(ThreadPerJobTeam::new()), counter.clone());
        let report = passive_engine()
            .invoke(&graph, "count", Parameter::None)
            .unwrap()
            .wait_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(report.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
