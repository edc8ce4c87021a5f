//! Fixed-size worker pool
//!
//! A handful of tokio tasks drain one bounded job queue. Used to run
//! request/response exchanges off the caller's task
//! ([`crate::uds::UdsClient::send_request_async`]).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    ShutDown,

    #[error("Worker pool queue is full ({0} jobs waiting)")]
    QueueFull(usize),
}

/// Bounded pool of tokio worker tasks
pub struct WorkerPool {
    sender: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    stop: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl WorkerPool {
    /// Start `config.workers` workers. Must be called within a tokio runtime.
    pub fn new(config: &PoolConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let stop = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicU64::new(0));

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(Self::run_worker(id, receiver.clone(), completed.clone()))
            })
            .collect();

        info!(workers, capacity, "Worker pool started");

        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            stop,
            completed,
            workers: parking_lot::Mutex::new(handles),
            capacity,
        }
    }

    /// Runs jobs until the queue is closed and empty, so everything accepted
    /// before shutdown still completes
    async fn run_worker(
        id: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
        completed: Arc<AtomicU64>,
    ) {
        loop {
            // Only one idle worker waits on the queue at a time
            let job = receiver.lock().await.recv().await;
            let Some(job) = job else { break };
            job.await;
            completed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Queue a future for execution on one of the workers
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stop.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(PoolError::ShutDown)?;
        sender.try_send(Box::pin(job)).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!(capacity = self.capacity, "Worker pool queue full");
                PoolError::QueueFull(self.capacity)
            }
            TrySendError::Closed(_) => PoolError::ShutDown,
        })
    }

    /// Jobs finished since the pool started
    pub fn completed_jobs(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Stop accepting work, finish running and queued jobs and join every
    /// worker
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // Closing the queue wakes idle workers
        self.sender.lock().take();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.workers.lock().iter() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_test::assert_ok;

    fn pool(workers: usize, queue_capacity: usize) -> WorkerPool {
        WorkerPool::new(&PoolConfig {
            workers,
            queue_capacity,
        })
    }

    #[tokio::test]
    async fn test_jobs_run_and_complete() {
        let pool = pool(2, 8);
        let mut receivers = Vec::new();
        for i in 0..5u32 {
            let (tx, rx) = oneshot::channel();
            pool.submit(async move {
                let _ = tx.send(i * 2);
            })
            .unwrap();
            receivers.push(rx);
        }

        let mut results = Vec::new();
        for rx in receivers {
            results.push(rx.await.unwrap());
        }
        assert_eq!(results, vec![0, 2, 4, 6, 8]);

        pool.shutdown().await;
        assert_eq!(pool.completed_jobs(), 5);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = pool(1, 4);
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown().await;

        assert!(pool.is_shut_down());
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.submit(async {}), Err(PoolError::ShutDown));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_jobs() {
        let pool = pool(1, 4);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        })
        .unwrap();
        started_rx.await.unwrap();

        let mut queued = Vec::new();
        for i in 0..2u32 {
            let (tx, rx) = oneshot::channel();
            pool.submit(async move {
                let _ = tx.send(i);
            })
            .unwrap();
            queued.push(rx);
        }

        // shutdown is polled first, so the stop flag is set before release
        tokio::join!(pool.shutdown(), async {
            let _ = release_tx.send(());
        });

        for (i, rx) in queued.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), i as u32);
        }
        assert_eq!(pool.completed_jobs(), 3);
        assert_eq!(pool.submit(async {}), Err(PoolError::ShutDown));
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let pool = pool(1, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        })
        .unwrap();
        started_rx.await.unwrap();

        // One slot in the queue, then full
        assert_ok!(pool.submit(async {}));
        assert_eq!(pool.submit(async {}), Err(PoolError::QueueFull(1)));

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;
    }
}
