use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::state_machine::Job;

use super::Team;

/// Queues assigned jobs until the caller runs them.
#[derive(Default)]
pub struct ManualTeam {
    queue: Mutex<VecDeque<Job>>,
}

impl ManualTeam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Runs the oldest queued job. False when the queue was empty.
    pub fn run_next(&self) -> bool {
        let job = self.queue.lock().pop_front();
        match job {
            Some(job) => {
                job.do_job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs until the queue stays empty. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl Team for ManualTeam {
    fn assign(&self, job: Job) {
        self.queue.lock().push_back(job);
    }

    fn name(&self) -> &str {
        "manual"
    }
}
