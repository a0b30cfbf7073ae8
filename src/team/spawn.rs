use std::thread;

use crate::state_machine::Job;

use super::Team;

/// Runs every assigned job on a fresh OS thread; `assign` returns at once.
#[derive(Debug, Default)]
pub struct ThreadPerJobTeam;

impl ThreadPerJobTeam {
    pub fn new() -> Self {
        Self
    }
}

impl Team for ThreadPerJobTeam {
    fn assign(&self, job: Job) {
        let label = job.to_string();
        let rejected = job.clone();
        if let Err(e) = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                job.do_job();
            })
        {
            log::error!("failed to spawn OS thread for {label}: {e}");
            rejected.reject();
        }
    }

    fn name(&self) -> &str {
        "thread-per-job"
    }
}
