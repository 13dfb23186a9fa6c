//! Background worker pool for clip extraction.
//!
//! A bounded queue feeds a fixed number of workers. Submission never waits
//! for a task to finish, only (optionally) for a free queue slot. Shutdown
//! closes the queue and waits until every queued task has been handled.

use crate::clips::ClipTask;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Consumes clip tasks on a worker thread.
pub trait ClipHandler: Send + Sync + 'static {
    fn handle(&self, task: ClipTask);
}

/// Submission errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Clip queue is full")]
    QueueFull,

    #[error("Clip queue is closed")]
    Closed,
}

/// Worker pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub dropped: u64,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ClipTask>>>;

/// Fixed-size pool running a [`ClipHandler`].
pub struct ClipWorkerPool {
    sender: Mutex<Option<mpsc::Sender<ClipTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<RwLock<PoolStats>>,
    running: AtomicBool,
}

impl ClipWorkerPool {
    /// Spawn the workers. Must be called within a Tokio runtime.
    pub fn start(handler: Arc<dyn ClipHandler>, num_workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(RwLock::new(PoolStats::default()));

        let workers = (0..num_workers.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    receiver.clone(),
                    handler.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!(num_workers, queue_size, "Clip worker pool started");

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stats,
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.read()
    }

    /// Queue a task, waiting for a free slot if the queue is full.
    pub async fn submit(&self, task: ClipTask) -> Result<(), SubmitError> {
        let sender = self.sender()?;
        sender.send(task).await.map_err(|_| SubmitError::Closed)?;
        self.stats.write().submitted += 1;
        Ok(())
    }

    /// Queue a task without waiting; a full queue drops it.
    pub fn try_submit(&self, task: ClipTask) -> Result<(), SubmitError> {
        let sender = self.sender()?;
        match sender.try_send(task) {
            Ok(()) => {
                self.stats.write().submitted += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.write().dropped += 1;
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        drop(self.sender.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Clip worker failed");
            }
        }

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            completed = stats.completed,
            dropped = stats.dropped,
            "Clip worker pool drained"
        );
    }

    fn sender(&self) -> Result<mpsc::Sender<ClipTask>, SubmitError> {
        self.sender.lock().clone().ok_or(SubmitError::Closed)
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: SharedReceiver,
    handler: Arc<dyn ClipHandler>,
    stats: Arc<RwLock<PoolStats>>,
) {
    debug!(worker_id, "Clip worker started");

    loop {
        let task = receiver.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };

        let device_id = task.device_id.clone();
        let handler = handler.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || handler.handle(task)).await {
            error!(worker_id, device_id = %device_id, error = %e, "Clip task panicked");
        }
        stats.write().completed += 1;
    }

    debug!(worker_id, "Clip worker stopped");
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingHandler;
    use super::*;
    use std::time::Duration;

    fn task(device_id: &str) -> ClipTask {
        ClipTask {
            device_id: device_id.to_string(),
            label: "20240101_000000".to_string(),
            frames: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// Blocks every task until the test releases it.
    struct GatedHandler {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        started: Arc<RwLock<usize>>,
    }

    impl ClipHandler for GatedHandler {
        fn handle(&self, _task: ClipTask) {
            *self.started.write() += 1;
            let _ = self.gate.lock().recv();
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_tasks() {
        let handler = Arc::new(RecordingHandler::default());
        let pool = ClipWorkerPool::start(handler.clone(), 2, 4);

        for i in 0..10 {
            pool.submit(task(&format!("cam{i}"))).await.unwrap();
        }
        pool.shutdown().await;

        assert_eq!(handler.tasks.lock().len(), 10);
        let stats = pool.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.completed, 10);
        assert!(!pool.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_try_submit_reports_full_queue() {
        let (release, gate) = std::sync::mpsc::channel();
        let started = Arc::new(RwLock::new(0));
        let handler = Arc::new(GatedHandler {
            gate: Mutex::new(gate),
            started: started.clone(),
        });
        let pool = ClipWorkerPool::start(handler, 1, 1);

        pool.try_submit(task("a")).unwrap();
        while *started.read() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Worker is busy with "a"; one slot left in the queue.
        pool.try_submit(task("b")).unwrap();
        assert_eq!(pool.try_submit(task("c")), Err(SubmitError::QueueFull));

        release.send(()).unwrap();
        release.send(()).unwrap();
        pool.shutdown().await;

        let stats = pool.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pool = ClipWorkerPool::start(Arc::new(RecordingHandler::default()), 1, 1);
        pool.shutdown().await;

        assert_eq!(pool.submit(task("late")).await, Err(SubmitError::Closed));
        assert_eq!(pool.try_submit(task("late")), Err(SubmitError::Closed));
    }
}
