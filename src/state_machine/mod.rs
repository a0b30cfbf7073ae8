mod context;
mod job;
mod state;
mod step;

pub use context::{AsyncSignal, JobContext};
pub use job::{Job, JobSnapshot};
pub(crate) use job::{NodeId, NodeRecord};
pub use state::JobState;
