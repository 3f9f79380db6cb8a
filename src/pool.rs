//! Fixed-size worker pool fed by a bounded queue.
//!
//! The accept loop pushes jobs into a `tokio::sync::mpsc` channel of
//! `queue_capacity`; `workers` tasks pull from it. How a full queue is
//! handled is decided per dispatch by `OverflowPolicy`.

use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Behaviour when every worker is busy and the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Hold the accept loop until a queue slot frees up.
    #[default]
    Wait,
    /// Hand the job back so the caller can drop it.
    Reject,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
}

#[derive(Debug, Default)]
struct PoolStats {
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
}

/// Why a job was not enqueued. The job is returned to the caller.
#[derive(Debug)]
pub enum DispatchError<T> {
    Full(T),
    Closed(T),
}

pub struct WorkerPool<T> {
    tx: mpsc::Sender<T>,
    stats: Arc<PoolStats>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` tasks running `handler` on each dequeued job.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Panics
    /// Panics if `workers` or `queue_capacity` is zero.
    pub fn new<F, Fut>(workers: usize, queue_capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        assert!(workers > 0, "pool needs at least one worker");
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());
        let handler = Arc::new(handler);

        let workers = (0..workers)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let stats = Arc::clone(&stats);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        // Hold the lock only while waiting for the next job.
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };

                        stats.queued.fetch_sub(1, Ordering::AcqRel);
                        stats.active.fetch_add(1, Ordering::AcqRel);
                        (*handler)(job).await;
                        stats.active.fetch_sub(1, Ordering::AcqRel);
                        stats.completed.fetch_add(1, Ordering::AcqRel);
                    }
                    debug!(worker = worker_id, "Worker stopped");
                })
            })
            .collect();

        Self { tx, stats, workers }
    }

    /// Enqueue a job according to `policy`.
    pub async fn dispatch(&self, job: T, policy: OverflowPolicy) -> Result<(), DispatchError<T>> {
        // Count before sending so a fast worker never sees queued underflow.
        self.stats.queued.fetch_add(1, Ordering::AcqRel);
        let result = match policy {
            OverflowPolicy::Wait => self
                .tx
                .send(job)
                .await
                .map_err(|mpsc::error::SendError(job)| DispatchError::Closed(job)),
            OverflowPolicy::Reject => self.tx.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(job) => DispatchError::Full(job),
                mpsc::error::TrySendError::Closed(job) => DispatchError::Closed(job),
            }),
        };
        if result.is_err() {
            self.stats.queued.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    pub fn stats(&self) -> PoolSnapshot {
        PoolSnapshot {
            active: self.stats.active.load(Ordering::Acquire),
            queued: self.stats.queued.load(Ordering::Acquire),
            completed: self.stats.completed.load(Ordering::Acquire),
        }
    }

    /// Stop taking new jobs and wait for queued and running ones to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_runs_every_job() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let pool = WorkerPool::new(3, 4, move |n: usize| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
            }
        });

        for n in 1..=10 {
            pool.dispatch(n, OverflowPolicy::Wait).await.unwrap();
        }
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 55);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        let pool = WorkerPool::new(2, 16, move |_: u32| {
            let running = Arc::clone(&r);
            let peak = Arc::clone(&p);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        });

        for i in 0..7 {
            pool.dispatch(i, OverflowPolicy::Wait).await.unwrap();
        }
        pool.shutdown().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reject_when_queue_full() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));
        let (started_tx, mut started_rx) = mpsc::channel::<()>(1);

        let pool = WorkerPool::new(1, 1, move |_: u32| {
            let release_rx = Arc::clone(&release_rx);
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(()).await;
                let rx = release_rx.lock().await.take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
            }
        });

        // First job occupies the only worker.
        pool.dispatch(1, OverflowPolicy::Reject).await.unwrap();
        started_rx.recv().await.unwrap();
        // Second fills the queue, third overflows.
        pool.dispatch(2, OverflowPolicy::Reject).await.unwrap();
        match pool.dispatch(3, OverflowPolicy::Reject).await {
            Err(DispatchError::Full(job)) => assert_eq!(job, 3),
            other => panic!("unexpected: {:?}", other),
        }

        let snapshot = pool.stats();
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.queued, 1);

        release_tx.send(()).unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_after_completion() {
        let pool = WorkerPool::new(2, 2, |_: u8| async {});
        for i in 0..5 {
            pool.dispatch(i, OverflowPolicy::Wait).await.unwrap();
        }
        assert_eq!(pool.workers.len(), 2);

        let stats = Arc::clone(&pool.stats);
        pool.shutdown().await;
        assert_eq!(stats.completed.load(Ordering::SeqCst), 5);
        assert_eq!(stats.queued.load(Ordering::SeqCst), 0);
        assert_eq!(stats.active.load(Ordering::SeqCst), 0);
    }
}
