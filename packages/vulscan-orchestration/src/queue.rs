//! Job queue
//!
//! At-least-once hand-off from the dispatcher to the worker pool. A job may
//! be delivered more than once; the worker's `pending -> processing`
//! transition rejects every delivery after the first.

use crate::error::{OrchestratorError, Result};
use crate::job::ScanJob;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Fails once the queue is closed
    async fn enqueue(&self, job: ScanJob) -> Result<()>;

    /// Waits for the next job; `None` once the queue is closed and drained.
    /// Cancel-safe: dropping the future never loses a job.
    async fn dequeue(&self) -> Option<ScanJob>;

    fn close(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<ScanJob>,
    closed: bool,
}

/// FIFO queue held in process memory
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: ScanJob) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(OrchestratorError::invalid_request(format!(
                    "Job queue closed; scan {} not enqueued",
                    job.scan_id
                )));
            }
            state.jobs.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<ScanJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a notify between check and await is not lost
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(job) = state.jobs.pop_front() {
                    if !state.jobs.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }
}
