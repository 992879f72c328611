//! Bounded worker pool for long-running operations.
//!
//! A single primary thread drives the state machines; view regeneration,
//! automatic peak picking, and refinement run on this pool. Jobs receive
//! owned deep copies of their inputs (single-writer policy: workers never
//! see live references), and results come back through a channel drained on
//! the primary thread. Every job carries an epoch token; results whose
//! epoch no longer matches the pool's are discarded silently, so an
//! abandoned operation cannot mutate later state. Worker panics are
//! captured per job and surface as failed outcomes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Epoch token tying a job to the state that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobToken {
    pub epoch: u64,
}

/// Terminal result of one job.
#[derive(Debug)]
pub enum JobOutcome<T> {
    Completed(T),
    Failed(String),
}

/// A finished job with its originating token.
#[derive(Debug)]
pub struct JobResult<T> {
    pub token: JobToken,
    pub outcome: JobOutcome<T>,
}

type Job<T> = (JobToken, Box<dyn FnOnce() -> Result<T, String> + Send>);

/// Fixed-size worker pool with epoch-based result invalidation.
pub struct WorkerPool<T: Send + 'static> {
    job_tx: Option<Sender<Job<T>>>,
    result_rx: Receiver<JobResult<T>>,
    handles: Vec<JoinHandle<()>>,
    epoch: u64,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(n_workers: usize) -> Self {
        let n_workers = n_workers.max(1);
        let (job_tx, job_rx) = channel::<Job<T>>();
        let (result_tx, result_rx) = channel::<JobResult<T>>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            handles.push(std::thread::spawn(move || loop {
                let job = {
                    let guard = job_rx.lock().expect("job queue poisoned");
                    guard.recv()
                };
                let Ok((token, work)) = job else {
                    // Channel closed: pool is shutting down.
                    return;
                };
                let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                    Ok(Ok(value)) => JobOutcome::Completed(value),
                    Ok(Err(msg)) => JobOutcome::Failed(msg),
                    Err(panic) => JobOutcome::Failed(panic_message(panic)),
                };
                if result_tx.send(JobResult { token, outcome }).is_err() {
                    return;
                }
            }));
        }

        Self {
            job_tx: Some(job_tx),
            result_rx,
            handles,
            epoch: 0,
        }
    }

    /// Current epoch; results from earlier epochs are stale.
    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    /// Invalidate all pending jobs (state machine switched away).
    pub fn invalidate_pending(&mut self) {
        self.epoch += 1;
    }

    /// Submit a job under the current epoch.
    pub fn submit(
        &self,
        work: impl FnOnce() -> Result<T, String> + Send + 'static,
    ) -> JobToken {
        let token = JobToken { epoch: self.epoch };
        if let Some(tx) = &self.job_tx {
            // Send only fails when workers are gone; the result channel
            // will simply never produce this token.
            let _ = tx.send((token, Box::new(work)));
        }
        token
    }

    /// Collect finished jobs, dropping stale-epoch results silently.
    pub fn drain_completions(&mut self) -> Vec<JobResult<T>> {
        let mut fresh = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            if result.token.epoch == self.epoch {
                fresh.push(result);
            } else {
                tracing::debug!(
                    job_epoch = result.token.epoch,
                    current_epoch = self.epoch,
                    "discarding stale worker result"
                );
            }
        }
        fresh
    }

    /// Block until a result for `token` arrives (or workers die); stale
    /// results encountered along the way are discarded.
    pub fn wait_for(&mut self, token: JobToken) -> Option<JobResult<T>> {
        while let Ok(result) = self.result_rx.recv() {
            if result.token == token && result.token.epoch == self.epoch {
                return Some(result);
            }
            tracing::debug!("discarding stale worker result while waiting");
        }
        None
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        "worker panicked".to_string()
    }
}
