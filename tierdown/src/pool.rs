//! Fixed-size worker pool and wait-groups.
//!
//! The run controller submits one job per due table and then waits for the
//! whole level before moving on. [`TaskGroup`] expresses that barrier: jobs are
//! spawned into a group, and [`TaskGroup::join`] blocks until every one of
//! them has finished.
//!
//! ```text
//! coordinator ── spawn ──► queue ──► worker 0..N ── done ──► group counter
//!      └──────────── join (blocks until counter == 0) ◄─────────┘
//! ```
//!
//! A panicking job is caught, counted as failed, and never takes a worker
//! thread down with it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::error::{ConfigError, Result, RunError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed number of worker threads consuming jobs from a shared queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPoolSize`] for a size of zero and
    /// [`RunError::SpawnWorker`] if a thread cannot be spawned.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ConfigError::InvalidPoolSize { size }.into());
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("tierdown-worker-{index}"))
                .spawn(move || worker_loop(&receiver))
                .map_err(|e| RunError::SpawnWorker { source: e })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `job` for execution.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::PoolClosed`] after [`WorkerPool::shutdown`].
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender.as_ref().ok_or(RunError::PoolClosed)?;
        sender
            .send(Box::new(job))
            .map_err(|_| RunError::PoolClosed.into())
    }

    /// Stops accepting jobs, lets queued jobs finish, and joins all workers.
    ///
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match job {
            Ok(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::warn!("job panicked");
                }
            }
            // Queue closed and drained.
            Err(_) => break,
        }
    }
}

#[derive(Debug, Default)]
struct GroupState {
    pending: usize,
    succeeded: usize,
    failed: usize,
}

/// Counts of a joined [`TaskGroup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupOutcome {
    /// Jobs that returned `true`.
    pub succeeded: usize,
    /// Jobs that returned `false` or panicked.
    pub failed: usize,
}

/// Wait-group over jobs submitted to a [`WorkerPool`].
#[derive(Debug, Default, Clone)]
pub struct TaskGroup {
    state: Arc<(Mutex<GroupState>, Condvar)>,
}

impl TaskGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` on `pool` as a member of this group. The job's return value
    /// is its success flag.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::PoolClosed`] if the pool no longer accepts jobs;
    /// the job is then not counted.
    pub fn spawn<F>(&self, pool: &WorkerPool, job: F) -> Result<()>
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        self.lock().pending += 1;

        let state = Arc::clone(&self.state);
        let submitted = pool.execute(move || {
            let success = catch_unwind(AssertUnwindSafe(job)).unwrap_or(false);
            let (lock, done) = &*state;
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            state.pending -= 1;
            if success {
                state.succeeded += 1;
            } else {
                state.failed += 1;
            }
            done.notify_all();
        });

        if submitted.is_err() {
            self.lock().pending -= 1;
        }
        submitted
    }

    /// Number of jobs that have not finished yet.
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Blocks until every spawned job has finished.
    pub fn join(&self) -> GroupOutcome {
        let (lock, done) = &*self.state;
        let state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let state = done
            .wait_while(state, |s| s.pending > 0)
            .unwrap_or_else(PoisonError::into_inner);
        GroupOutcome {
            succeeded: state.succeeded,
            failed: state.failed,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.state.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
