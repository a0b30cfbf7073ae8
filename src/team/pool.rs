use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::state_machine::Job;

use super::Team;

struct PoolState {
    queue: VecDeque<Job>,
    running: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed pool of OS threads sharing one FIFO queue.
pub struct WorkerPoolTeam {
    name: String,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPoolTeam {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        let name = name.into();
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: true,
            }),
            available: Condvar::new(),
        });

        let handles = (0..workers)
            .filter_map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .map_err(|e| log::error!("failed to spawn worker {name}-{i}: {e}"))
                    .ok()
            })
            .collect();

        Self {
            name,
            shared,
            workers: Mutex::new(handles),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Jobs assigned but not yet picked up.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stops accepting work, lets the workers drain the queue and joins them.
    /// Jobs assigned afterwards are rejected.
    pub fn shutdown(&self) {
        self.shared.state.lock().running = false;
        self.shared.available.notify_all();
        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            // The last reference may be dropped by one of our own workers.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break Some(job);
                }
                if !state.running {
                    break None;
                }
                shared.available.wait(&mut state);
            }
        };
        match job {
            Some(job) => {
                job.do_job();
            }
            None => return,
        }
    }
}

impl Team for WorkerPoolTeam {
    fn assign(&self, job: Job) {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                state.queue.push_back(job);
                self.shared.available.notify_one();
                return;
            }
        }
        log::warn!("team `{}` is shut down, rejecting {job}", self.name);
        job.reject();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WorkerPoolTeam {
    fn drop(&mut self) {
        self.shutdown();
    }
}
