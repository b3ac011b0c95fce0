//! Job admission and the worker pool.
//!
//! [`Scheduler::submit`] validates a request and places it in a bounded FIFO
//! backlog. A fixed number of worker tasks take jobs from the backlog one at
//! a time and run each through the [`Pipeline`] until it has been dispatched.
//! All shared counters live in one [`JobQueue`] behind a short-lived lock;
//! status reads go through `watch` snapshots and never wait on a worker.

pub mod queue;

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::jobs::{FailureReason, JobFailure, JobId, JobRecord, JobSnapshot, Requester, TrackedJob};
use crate::pipeline::Pipeline;
use crate::utils::validate_source_url;
use crate::AdmissionError;

pub use queue::JobQueue;

/// Sizing of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    pub workers: usize,
    pub per_user_limit: usize,
    pub backlog_capacity: usize,
    pub max_url_length: usize,
}

impl From<&PipelineConfig> for SchedulerLimits {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            workers: config.workers,
            per_user_limit: config.per_user_limit,
            backlog_capacity: config.backlog_capacity,
            max_url_length: config.max_url_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub workers: usize,
    pub backlog_capacity: usize,
}

struct Shared {
    queue: Mutex<JobQueue>,
    notify: Notify,
    shutdown: CancellationToken,
    pipeline: Arc<Pipeline>,
    limits: SchedulerLimits,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, JobQueue> {
        // the queue stays consistent even if a holder panicked
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the next queued job; `None` once the scheduler is closed and
    /// the backlog is empty
    async fn next_job(&self) -> Option<TrackedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue();
                if let Some(job) = queue.dispatch_next() {
                    return Some(job);
                }
                if !queue.is_accepting() {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    /// Terminate a job that never reached a worker and deliver its notice
    async fn cancel_queued(&self, mut job: TrackedJob, detail: &str) {
        let id = job.id();
        job.cancel_token().cancel();
        if let Err(e) = job.fail(JobFailure::new(FailureReason::Cancelled, detail)) {
            error!(job_id = %id, error = %e, "Cannot cancel queued job");
        }
        self.queue().settle(&id);
        self.pipeline.dispatcher().dispatch(&mut job, None).await;
        self.queue().release(&id, false);
    }
}

/// Handle to the admission queue and worker pool. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(limits: SchedulerLimits, pipeline: Arc<Pipeline>) -> Self {
        let workers = limits.workers.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(JobQueue::new(
                workers,
                limits.per_user_limit,
                limits.backlog_capacity,
            )),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            pipeline,
            limits: SchedulerLimits { workers, ..limits },
            workers: Mutex::new(Vec::with_capacity(workers)),
        });

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| tokio::spawn(worker_loop(shared.clone(), worker)))
            .collect();
        shared
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        info!(
            workers,
            per_user_limit = limits.per_user_limit,
            backlog_capacity = limits.backlog_capacity,
            "Scheduler started"
        );

        Self { shared }
    }

    /// Admit a request. Never waits for a worker; a refused request leaves no record.
    pub fn submit(&self, requester: Requester, source_url: &str) -> Result<JobId, AdmissionError> {
        let url = validate_source_url(source_url, self.shared.limits.max_url_length)?;
        let record = JobRecord::new(requester.clone(), url);

        let (id, queued) = {
            let mut queue = self.shared.queue();
            let id = queue.admit(record)?;
            (id, queue.queued())
        };

        self.shared.notify.notify_one();
        info!(job_id = %id, requester = %requester, queued, "Job admitted");
        Ok(id)
    }

    /// Latest snapshot of a job that has not been released yet
    pub fn status(&self, id: &JobId) -> Option<JobSnapshot> {
        self.shared.queue().status(id)
    }

    /// Subscribe to a job's snapshots. The receiver keeps the final snapshot
    /// after the job has been released.
    pub fn watch(&self, id: &JobId) -> Option<watch::Receiver<JobSnapshot>> {
        self.shared.queue().watch(id)
    }

    pub fn jobs_for(&self, requester: &Requester) -> Vec<JobSnapshot> {
        self.shared.queue().jobs_for(requester)
    }

    /// Cancel a job. A queued job is terminated and dispatched right away;
    /// a running job is stopped at its next checkpoint or by killing the
    /// running tool. Returns false if the job is unknown or already finished.
    pub async fn cancel(&self, id: &JobId) -> bool {
        let queued = {
            let mut queue = self.shared.queue();
            match queue.take_queued(id) {
                Some(job) => job,
                None => {
                    let cancelled = queue.cancel_running(id);
                    if cancelled {
                        info!(job_id = %id, "Cancellation requested for running job");
                    }
                    return cancelled;
                }
            }
        };

        info!(job_id = %id, "Cancelling queued job");
        self.shared.cancel_queued(queued, "cancelled while queued").await;
        true
    }

    /// Cancel every job of `requester`; returns how many were cancelled
    pub async fn cancel_for(&self, requester: &Requester) -> usize {
        let ids = self.shared.queue().ids_for(requester);
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn stats(&self) -> SchedulerStats {
        let queue = self.shared.queue();
        SchedulerStats {
            queued: queue.queued(),
            running: queue.running(),
            workers: self.shared.limits.workers,
            backlog_capacity: self.shared.limits.backlog_capacity,
        }
    }

    /// Stop admitting, cancel every job and wait for the workers to exit
    pub async fn shutdown(&self) {
        let drained = self.shared.queue().close();
        info!(queued = drained.len(), "Scheduler shutting down");

        for job in drained {
            self.shared.cancel_queued(job, "scheduler shutting down").await;
        }

        self.shared.shutdown.cancel();

        let handles = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "Worker started");

    while let Some(mut job) = shared.next_job().await {
        let id = job.id();
        debug!(worker, job_id = %id, "Worker picked up job");

        let workspace = shared.pipeline.run(&mut job).await;
        // terminal: the requester may submit again while delivery is in flight
        shared.queue().settle(&id);

        let outcome = shared.pipeline.dispatcher().dispatch(&mut job, workspace).await;
        debug!(worker, job_id = %id, ?outcome, "Job finished");

        shared.queue().release(&id, true);
    }

    debug!(worker, "Worker stopped");
}
