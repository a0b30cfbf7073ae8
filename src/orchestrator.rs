use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{EngineConfig, TeamKind};
use crate::error::EngineError;
use crate::graph::{Parameter, ProcessGraph, ProcessGraphBuilder};
use crate::monitor::Monitor;
use crate::state_machine::Job;
use crate::team::{PassiveTeam, Team, ThreadPerJobTeam, TokioTeam, WorkerPoolTeam};
use crate::tree::{ProcessHandle, ProcessShared, ThreadShared};

/// Name under which [`Engine::builder`] registers the configured team.
pub const DEFAULT_TEAM: &str = "default";

/// Creates processes and owns what they share: the timeout monitor and the
/// configured team.
pub struct Engine {
    config: EngineConfig,
    monitor: Arc<Monitor>,
    team: Mutex<Option<Arc<dyn Team>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let monitor = Monitor::ticking(Duration::from_millis(config.monitor_interval_ms));
        Self {
            config,
            monitor,
            team: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// The team selected by `config.team`, created on first use and shared
    /// afterwards. A `tokio` team outside a runtime falls back to the pool.
    pub fn team(&self) -> Arc<dyn Team> {
        let mut slot = self.team.lock();
        if let Some(team) = slot.as_ref() {
            return team.clone();
        }
        let team: Arc<dyn Team> = match self.config.team {
            TeamKind::Passive => Arc::new(PassiveTeam::new()),
            TeamKind::ThreadPerJob => Arc::new(ThreadPerJobTeam::new()),
            TeamKind::Tokio => match TokioTeam::current() {
                Some(team) => Arc::new(team),
                None => {
                    log::warn!("no tokio runtime available, using a worker pool");
                    self.pool()
                }
            },
            TeamKind::Pool => self.pool(),
        };
        *slot = Some(team.clone());
        team
    }

    fn pool(&self) -> Arc<dyn Team> {
        Arc::new(WorkerPoolTeam::new("jobkernel", self.config.worker_threads))
    }

    /// Graph builder whose default team is [`Engine::team`].
    pub fn builder(&self) -> ProcessGraphBuilder {
        ProcessGraph::builder()
            .team(DEFAULT_TEAM, self.team())
            .default_team(DEFAULT_TEAM)
    }

    /// Starts the monitor ticker now instead of with the first deadline.
    /// Calling it again does nothing.
    pub fn start_monitor(&self) -> Result<(), EngineError> {
        self.monitor
            .start_ticker(Duration::from_millis(self.config.monitor_interval_ms))?;
        Ok(())
    }

    /// Stops the monitor ticker. The next registered deadline starts it
    /// again.
    pub fn stop_monitor(&self) {
        self.monitor.stop_ticker();
    }

    /// Expires overdue waits now. Returns how many timed out.
    pub fn check_timeouts(&self) -> usize {
        self.monitor.check()
    }

    /// Creates a process whose initial thread starts at `job`. The returned
    /// job is not activated yet.
    pub fn create_process(
        &self,
        graph: &Arc<ProcessGraph>,
        job: &str,
        parameter: Parameter,
    ) -> Result<(Job, ProcessHandle), EngineError> {
        let index = graph
            .job_index(job)
            .ok_or_else(|| EngineError::JobNotFound(job.to_string()))?;
        let process = ProcessShared::new(graph.clone(), self.monitor.clone());
        log::debug!("process {} created at `{job}`", process.id);
        let first = ThreadShared::spawn(&process, index, parameter);
        Ok((first, ProcessHandle { process }))
    }

    /// Creates a process and activates its first job.
    pub fn invoke(
        &self,
        graph: &Arc<ProcessGraph>,
        job: &str,
        parameter: Parameter,
    ) -> Result<ProcessHandle, EngineError> {
        let (first, handle) = self.create_process(graph, job, parameter)?;
        first.activate_job();
        Ok(handle)
    }
}
