//! Session worker pool.
//!
//! A fixed set of workers drains bounded per-worker channels; the dispatcher
//! submits one job per accepted request with round-robin selection. Channels
//! are bounded so a flood of requests is dropped (with a warning) instead of
//! queuing without limit, and submission observes the shutdown flag so a
//! racing shutdown cannot leak a job into a pool that is being joined.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::{self, SessionJob};

const WORKER_QUEUE_DEPTH: usize = 64;
const MAX_WORKERS: usize = 64;

/// Pick the worker count: explicit when non-zero, otherwise the hardware
/// parallelism, clamped to [1, 64].
pub(crate) fn effective_worker_count(configured: usize) -> usize {
    let count = if configured > 0 {
        configured
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    };
    count.clamp(1, MAX_WORKERS)
}

#[derive(Debug, Default)]
pub(crate) struct WorkerStats {
    pub sessions_run: AtomicU64,
    pub jobs_dropped: AtomicU64,
}

/// Submission side of the pool; the dispatcher holds a clone.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    senders: Arc<Vec<mpsc::Sender<SessionJob>>>,
    next: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

impl PoolHandle {
    /// Schedule a session job. Returns false when the job was dropped
    /// (pool shutting down or every worker queue full).
    pub fn submit(&self, job: SessionJob) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            warn!("worker pool shutting down, dropping request");
            self.stats.jobs_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let worker_count = self.senders.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut job = job;
        for i in 0..worker_count {
            let idx = (start + i) % worker_count;
            match self.senders[idx].try_send(job) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    debug!(worker = idx, "worker queue full, trying next");
                    job = returned;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Channels close only during shutdown.
                    warn!("worker pool shutting down, dropping request");
                    self.stats.jobs_dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }

        warn!("all worker queues full, dropping request");
        self.stats.jobs_dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    pub fn sessions_run(&self) -> u64 {
        self.stats.sessions_run.load(Ordering::Relaxed)
    }
}

pub(crate) struct WorkerPool {
    handle: PoolHandle,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `worker_count` session workers.
    pub fn spawn(worker_count: usize) -> Self {
        let stats = Arc::new(WorkerStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        info!(workers = worker_count, "starting session worker pool");
        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::channel::<SessionJob>(WORKER_QUEUE_DEPTH);
            senders.push(tx);
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                shutdown_rx.clone(),
                stats.clone(),
            )));
        }

        WorkerPool {
            handle: PoolHandle {
                senders: Arc::new(senders),
                next: Arc::new(AtomicUsize::new(0)),
                shutting_down: Arc::new(AtomicBool::new(false)),
                stats,
            },
            handles,
            shutdown_tx,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Stop accepting jobs, then wait for in-flight sessions to finish
    /// naturally (bounded by session timeouts and retries).
    pub async fn shutdown(self) {
        // Raise the flag before signalling so a submit racing the shutdown
        // either lands on a still-draining queue or is refused outright.
        self.handle.shutting_down.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        for join_handle in self.handles {
            if let Err(e) = join_handle.await {
                warn!(error = %e, "worker task join failed");
            }
        }
        info!(
            sessions = self.handle.sessions_run(),
            "session worker pool stopped"
        );
    }
}

async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<SessionJob>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<WorkerStats>,
) {
    debug!(worker = worker_id, "session worker started");
    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => {
                    session::run(job).await;
                    stats.sessions_run.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    // Drain jobs accepted before the shutdown signal; submissions have
    // already stopped, so the queue is finite.
    while let Ok(job) = rx.try_recv() {
        session::run(job).await;
        stats.sessions_run.fetch_add(1, Ordering::Relaxed);
    }
    debug!(worker = worker_id, "session worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_selection() {
        assert_eq!(effective_worker_count(8), 8);
        assert_eq!(effective_worker_count(1), 1);
        assert_eq!(effective_worker_count(200), MAX_WORKERS);
        let auto = effective_worker_count(0);
        assert!((1..=MAX_WORKERS).contains(&auto));
    }

    #[tokio::test]
    async fn shutdown_joins_idle_workers() {
        let pool = WorkerPool::spawn(2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flag_rejects_new_jobs() {
        let pool = WorkerPool::spawn(1);
        let handle = pool.handle();
        pool.shutdown().await;
        assert!(handle.shutting_down.load(Ordering::Acquire));
        assert_eq!(handle.sessions_run(), 0);
    }
}
