//! Worker pool
//!
//! Dequeues scan jobs and runs each on its own task. Unbounded unless
//! `max_concurrent_scans` is set. Shutdown stops dequeuing and waits for
//! scans already running; a job still waiting for a slot goes back on the
//! queue.

use crate::job::ScanJob;
use crate::queue::JobQueue;
use crate::worker::{PipelineWorker, ScanOutcome};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub jobs_received: usize,
    pub scans_finished: usize,
    /// Deliveries the worker refused to claim (duplicates, unknown scans)
    pub jobs_rejected: usize,
    /// Returned to the queue by shutdown before they could start
    pub jobs_requeued: usize,
    pub tasks_panicked: usize,
}

pub struct WorkerPool {
    worker: Arc<PipelineWorker>,
    queue: Arc<dyn JobQueue>,
    limit: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    stats: Arc<Mutex<PoolStats>>,
    outcomes: Option<mpsc::UnboundedSender<ScanOutcome>>,
}

impl WorkerPool {
    /// `max_concurrent_scans == 0` means unbounded
    pub fn new(
        worker: Arc<PipelineWorker>,
        queue: Arc<dyn JobQueue>,
        max_concurrent_scans: usize,
    ) -> Self {
        let limit = (max_concurrent_scans > 0).then(|| Arc::new(Semaphore::new(max_concurrent_scans)));

        Self {
            worker,
            queue,
            limit,
            shutdown: CancellationToken::new(),
            stats: Arc::new(Mutex::new(PoolStats::default())),
            outcomes: None,
        }
    }

    /// Report every finished scan on `sender`
    pub fn with_outcomes(mut self, sender: mpsc::UnboundedSender<ScanOutcome>) -> Self {
        self.outcomes = Some(sender);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }

    /// Run until shutdown is requested or the queue is closed and drained,
    /// then wait for in-flight scans
    pub async fn run(&self) -> PoolStats {
        let mut tasks = JoinSet::new();
        info!(
            worker_id = %self.worker.worker_id(),
            limit = ?self.limit.as_ref().map(|s| s.available_permits()),
            "Worker pool started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Worker pool shutdown requested");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.on_task_exit(joined);
                }
                job = self.queue.dequeue() => {
                    let Some(job) = job else {
                        debug!("Job queue closed");
                        break;
                    };
                    self.stats.lock().jobs_received += 1;

                    let permit = match &self.limit {
                        Some(limit) => {
                            tokio::select! {
                                _ = self.shutdown.cancelled() => {
                                    self.requeue(job).await;
                                    break;
                                }
                                permit = limit.clone().acquire_owned() => permit.ok(),
                            }
                        }
                        None => None,
                    };

                    tasks.spawn(Self::run_job(
                        self.worker.clone(),
                        job,
                        self.stats.clone(),
                        self.outcomes.clone(),
                        permit,
                    ));
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.on_task_exit(joined);
        }

        let stats = self.stats();
        info!(
            finished = stats.scans_finished,
            rejected = stats.jobs_rejected,
            "Worker pool stopped"
        );
        stats
    }

    async fn run_job(
        worker: Arc<PipelineWorker>,
        job: ScanJob,
        stats: Arc<Mutex<PoolStats>>,
        outcomes: Option<mpsc::UnboundedSender<ScanOutcome>>,
        _permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        match worker.process_scan(&job).await {
            Ok(outcome) => {
                stats.lock().scans_finished += 1;
                if let Some(sender) = outcomes {
                    // Receiver may be gone; the scan is stored either way
                    let _ = sender.send(outcome);
                }
            }
            Err(e) => {
                stats.lock().jobs_rejected += 1;
                warn!(scan_id = %job.scan_id, "Job not processed: {}", e);
            }
        }
    }

    async fn requeue(&self, job: ScanJob) {
        let scan_id = job.scan_id;
        match self.queue.enqueue(job).await {
            Ok(()) => {
                self.stats.lock().jobs_requeued += 1;
                info!(scan_id = %scan_id, "Shutdown before scan could start; job requeued");
            }
            Err(e) => {
                error!(scan_id = %scan_id, "Shutdown before scan could start; job lost: {}", e);
            }
        }
    }

    fn on_task_exit(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            self.stats.lock().tasks_panicked += 1;
            error!("Scan task aborted: {}", e);
        }
    }
}
