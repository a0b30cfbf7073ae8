//! Process, thread and flow containment.
//!
//! A process hosts threads; a thread hosts flows and the node arena of every
//! job on it. Flows and threads are join targets.

mod flow;
mod process;
mod thread;

pub(crate) use flow::{Completion, join};
pub use flow::{FlowFuture, FlowHandle, JoinTarget};
pub(crate) use process::ProcessShared;
pub use process::{ProcessHandle, ProcessOutcome, ProcessReport};
pub use thread::ThreadHandle;
pub(crate) use thread::{FlowId, ThreadInner, ThreadShared};
