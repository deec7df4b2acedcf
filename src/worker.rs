//! Background threads: a small job pool and handles to long-running workers.
//!
//! ```text
//!   execute(job) ──▶ [ job channel ] ──▶ worker 0
//!                                   ──▶ worker 1
//!                                   ──▶ ...
//! ```

use std::fmt;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use log::{debug, error, info};

use crate::common::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a worker thread that runs until told to stop.
pub struct BackgroundWorkerHandle {
    handle: JoinHandle<()>,
    shutdown: Sender<()>,
}

impl BackgroundWorkerHandle {
    pub fn new(handle: JoinHandle<()>, shutdown: Sender<()>) -> Self {
        Self { handle, shutdown }
    }

    /// Ask the worker to stop. It finishes its current item first.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown
            .send(())
            .map_err(|e| Error::Worker(format!("failed to shutdown: {}", e)))
    }

    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| Error::Worker("failed to join background worker thread".to_string()))
    }
}

/// A fixed set of threads running submitted jobs in arrival order.
pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` threads named `{name}-{i}`.
    pub fn new(size: usize, name: &str) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig("worker pool needs at least one thread".into()));
        }
        let (tx, rx) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    // ends once every sender is gone and the queue is empty
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        info!("started worker pool {} with {} threads", name, size);
        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    /// Queue `job` for the next free thread.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::Worker("worker pool is shut down".to_string()))?;
        jobs.send(Box::new(job))
            .map_err(|e| Error::Worker(format!("failed to submit job: {}", e)))
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run the queued jobs to completion and join every thread.
    pub fn shutdown(&mut self) -> Result<()> {
        drop(self.jobs.take());
        let mut result = Ok(());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                result = Err(Error::Worker("a pool thread panicked".to_string()));
            }
        }
        debug!("worker pool stopped");
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("{}", e);
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.workers.len())
            .field("running", &self.jobs.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool_runs_all_jobs() {
        let mut pool = WorkerPool::new(3, "test").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_execute_after_shutdown_fails() {
        let mut pool = WorkerPool::new(1, "test").unwrap();
        pool.shutdown().unwrap();
        assert!(matches!(pool.execute(|| {}), Err(Error::Worker(_))));
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(
            WorkerPool::new(0, "test"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_background_handle_stops_worker() {
        let (tx, rx) = channel::unbounded::<()>();
        let handle = thread::spawn(move || {
            let _ = rx.recv();
        });
        let worker = BackgroundWorkerHandle::new(handle, tx);
        worker.shutdown().unwrap();
        worker.join().unwrap();
    }
}
