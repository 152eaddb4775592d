//! Bounded background worker pool
//!
//! Runs blocking or CPU-bound closures off the event loop. Jobs are taken
//! from a FIFO queue by a fixed number of workers; each job runs on the
//! blocking thread pool and its result is returned through a future.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool no longer accepts jobs
    #[error("Worker pool is shut down")]
    ShutDown,

    /// The job panicked
    #[error("Worker job panicked")]
    Panicked,
}

/// Fixed-size pool with a FIFO queue
pub struct WorkerPool {
    size: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `size` workers (at least one)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..size)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        // Lock is held only while waiting for the next job
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if let Err(e) = tokio::task::spawn_blocking(job).await {
                            tracing::error!("Worker {} job failed: {}", index, e);
                        }
                    }
                    tracing::debug!("Worker {} stopped", index);
                })
            })
            .collect();

        Self {
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job and wait for its result
    pub async fn submit<F, T>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(result);
        });

        {
            let sender = self.sender.lock().map_err(|_| PoolError::ShutDown)?;
            let sender = sender.as_ref().ok_or(PoolError::ShutDown)?;
            sender.send(job).map_err(|_| PoolError::ShutDown)?;
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PoolError::Panicked),
            Err(_) => Err(PoolError::ShutDown),
        }
    }

    /// Stop accepting jobs, run what is queued, then join the workers
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            let _ = worker.await;
        }
        tracing::debug!("Worker pool drained");
    }
}
