//! Bounded background worker for learning jobs.
//!
//! Jobs are processed one at a time in submission order. `submit` blocks when
//! `capacity` jobs are already queued. `flush` waits until every submitted job
//! has finished.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

/// Count of submitted but unfinished jobs.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub struct LearningLane<T: Send + 'static> {
    sender: Option<SyncSender<T>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl<T: Send + 'static> LearningLane<T> {
    /// Start the worker thread. `handler` runs once per job; a panic inside it
    /// is logged and the lane keeps going.
    pub fn spawn<F>(capacity: usize, handler: F) -> Result<Self>
    where
        F: Fn(T) + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel::<T>(capacity);
        let pending = Arc::new(Pending::default());
        let worker_pending = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name("learning-lane".to_string())
            .spawn(move || {
                for job in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(|| handler(job))).is_err() {
                        warn!("learning job panicked");
                    }
                    worker_pending.decrement();
                }
                debug!("learning lane drained");
            })
            .context("spawn learning lane")?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            pending,
        })
    }

    /// Queue a job, blocking while the lane is full.
    pub fn submit(&self, job: T) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("learning lane is shut down"))?;
        self.pending.increment();
        if sender.send(job).is_err() {
            self.pending.decrement();
            return Err(anyhow!("learning lane worker has stopped"));
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Block until every submitted job has finished.
    pub fn flush(&self) {
        self.pending.wait_idle();
    }

    /// Finish queued work and join the worker. Idempotent.
    pub fn shutdown(&mut self) {
        // Dropping the sender ends the worker's receive loop.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("learning lane worker panicked");
        }
    }
}

impl<T: Send + 'static> Drop for LearningLane<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
