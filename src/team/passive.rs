use std::cell::RefCell;
use std::collections::VecDeque;

use crate::state_machine::Job;

use super::Team;

thread_local! {
    static TRAMPOLINE: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Runs jobs inline on the assigning OS thread.
///
/// Jobs assigned while a passive job is already running on this OS thread
/// are queued and run by the outermost `assign` once the current one
/// returns, so long inline chains use constant stack.
#[derive(Debug, Default)]
pub struct PassiveTeam;

impl PassiveTeam {
    pub fn new() -> Self {
        Self
    }
}

struct Drain;

impl Drop for Drain {
    fn drop(&mut self) {
        TRAMPOLINE.with(|cell| cell.borrow_mut().take());
    }
}

impl Team for PassiveTeam {
    fn assign(&self, job: Job) {
        let mut job = Some(job);
        TRAMPOLINE.with(|cell| {
            if let Some(queue) = cell.borrow_mut().as_mut() {
                queue.extend(job.take());
            }
        });
        let Some(first) = job else {
            return;
        };

        TRAMPOLINE.with(|cell| *cell.borrow_mut() = Some(VecDeque::new()));
        let _drain = Drain;
        first.do_job();
        while let Some(next) = TRAMPOLINE.with(|cell| cell.borrow_mut().as_mut().and_then(VecDeque::pop_front)) {
            next.do_job();
        }
    }

    fn name(&self) -> &str {
        "passive"
    }
}
