//! Bounded worker pool.
//!
//! A pool owns a bounded job queue and a concurrency limit. Submission never
//! waits: a full queue is reported back to the caller immediately, which is
//! what lets the dispatcher answer `SYSTEM_BUSY` instead of stalling the
//! inbound loop.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

/// A unit of work queued on a pool
pub type Job = BoxFuture<'static, ()>;

/// A job the pool refused, handed back to the caller
pub struct Rejected {
    pub error: ExecutorError,
    pub job: Job,
}

/// Submission errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor queue is full")]
    Saturated,
    #[error("executor is shut down")]
    ShutDown,
}

/// Statistics for a worker pool
#[derive(Debug, Default)]
pub struct ExecutorStats {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub completed: AtomicU64,
}

/// Worker pool with a bounded queue and a fixed number of concurrent workers.
pub struct WorkerPool {
    name: String,
    /// Dropped on shutdown; the dispatcher then drains the queue and exits
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    queue_capacity: usize,
    workers: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<ExecutorStats>,
}

impl WorkerPool {
    /// Create a pool and start its dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize) -> Self {
        let name = name.into();
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let semaphore = Arc::new(Semaphore::new(workers));
        let stats = Arc::new(ExecutorStats::default());

        tokio::spawn(run_dispatcher(
            name.clone(),
            receiver,
            Arc::clone(&semaphore),
            Arc::clone(&stats),
        ));

        debug!(executor = %name, workers, queue_capacity, "Started worker pool");

        Self {
            name,
            sender: RwLock::new(Some(sender)),
            queue_capacity,
            workers,
            semaphore,
            stats,
        }
    }

    /// Queue a job without waiting.
    pub fn try_submit<F>(&self, job: F) -> Result<(), ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.try_submit_job(job.boxed()).map_err(|rejected| rejected.error)
    }

    /// Queue a boxed job; a refused job is returned so the caller can run it elsewhere.
    pub fn try_submit_job(&self, job: Job) -> Result<(), Rejected> {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            return Err(Rejected {
                error: ExecutorError::ShutDown,
                job,
            });
        };
        match sender.try_send(job) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Rejected {
                    error: ExecutorError::Saturated,
                    job,
                })
            }
            Err(mpsc::error::TrySendError::Closed(job)) => Err(Rejected {
                error: ExecutorError::ShutDown,
                job,
            }),
        }
    }

    /// Jobs waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, |sender| self.queue_capacity - sender.capacity())
    }

    /// True when the next submission would be rejected
    pub fn is_saturated(&self) -> bool {
        self.sender
            .read()
            .as_ref()
            .map_or(true, |sender| sender.capacity() == 0)
    }

    /// Workers currently running a job
    pub fn active_workers(&self) -> usize {
        self.workers - self.semaphore.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.read().is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    /// Stop accepting work. Queued and running jobs still finish.
    pub fn shutdown(&self) {
        if self.sender.write().take().is_some() {
            debug!(executor = %self.name, "Worker pool shut down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

async fn run_dispatcher(
    name: String,
    mut receiver: mpsc::Receiver<Job>,
    semaphore: Arc<Semaphore>,
    stats: Arc<ExecutorStats>,
) {
    while let Some(job) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            job.await;
            stats.completed.fetch_add(1, Ordering::Relaxed);
            drop(permit);
        });
    }
    debug!(executor = %name, "Worker pool dispatcher stopped");
}
