use tokio::runtime::Handle;

use crate::state_machine::Job;

use super::Team;

/// Runs jobs on a tokio runtime's blocking pool.
///
/// Job steps take blocking locks and run arbitrary behavior, so they never
/// run on the async worker threads.
pub struct TokioTeam {
    handle: Handle,
}

impl TokioTeam {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Team on the runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Team for TokioTeam {
    fn assign(&self, job: Job) {
        self.handle.spawn_blocking(move || job.do_job());
    }

    fn name(&self) -> &str {
        "tokio"
    }
}
