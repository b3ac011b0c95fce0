use std::collections::{HashMap, VecDeque};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::jobs::{JobId, JobRecord, JobSnapshot, Requester, TrackedJob};
use crate::AdmissionError;

/// What the queue keeps about a job between admission and release
#[derive(Debug)]
struct JobEntry {
    requester: Requester,
    cancel: CancellationToken,
    status: watch::Receiver<JobSnapshot>,
    /// Whether the job still counts against its requester's limit
    counted: bool,
}

/// Admission state shared by submitters and workers: the FIFO backlog,
/// per-user counts and the number of running jobs
#[derive(Debug)]
pub struct JobQueue {
    backlog: VecDeque<TrackedJob>,
    active: HashMap<JobId, JobEntry>,
    per_user: HashMap<Requester, usize>,
    running: usize,
    accepting: bool,
    workers: usize,
    per_user_limit: usize,
    backlog_capacity: usize,
}

impl JobQueue {
    pub fn new(workers: usize, per_user_limit: usize, backlog_capacity: usize) -> Self {
        Self {
            backlog: VecDeque::with_capacity(workers + backlog_capacity),
            active: HashMap::new(),
            per_user: HashMap::new(),
            running: 0,
            accepting: true,
            workers,
            per_user_limit,
            backlog_capacity,
        }
    }

    /// Admit a validated record to the back of the backlog.
    /// Nothing is stored when admission is refused.
    pub fn admit(&mut self, record: JobRecord) -> Result<JobId, AdmissionError> {
        if !self.accepting {
            return Err(AdmissionError::ShuttingDown);
        }
        let in_flight = self.per_user.get(&record.requester).copied().unwrap_or(0);
        if in_flight >= self.per_user_limit {
            return Err(AdmissionError::RateLimited);
        }
        // every worker is taken and the backlog is full
        if self.backlog.len() + self.running >= self.workers + self.backlog_capacity {
            return Err(AdmissionError::Overloaded);
        }

        let requester = record.requester.clone();
        let (job, status) = TrackedJob::new(record);
        let id = job.id();

        self.active.insert(
            id,
            JobEntry {
                requester: requester.clone(),
                cancel: job.cancel_token().clone(),
                status,
                counted: true,
            },
        );
        *self.per_user.entry(requester).or_insert(0) += 1;
        self.backlog.push_back(job);
        Ok(id)
    }

    /// Hand the oldest queued job to a worker
    pub fn dispatch_next(&mut self) -> Option<TrackedJob> {
        let job = self.backlog.pop_front()?;
        self.running += 1;
        Some(job)
    }

    /// Remove a job that has not been picked up yet
    pub fn take_queued(&mut self, id: &JobId) -> Option<TrackedJob> {
        let position = self.backlog.iter().position(|job| job.id() == *id)?;
        self.backlog.remove(position)
    }

    /// Fire the cancellation token of a job a worker is running.
    /// Returns false for unknown or already finished jobs.
    pub fn cancel_running(&mut self, id: &JobId) -> bool {
        match self.active.get(id) {
            Some(entry) if !entry.status.borrow().state.is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Stop counting a terminal job against its requester's limit. The
    /// worker slot stays taken until [`JobQueue::release`].
    pub fn settle(&mut self, id: &JobId) {
        let Some(entry) = self.active.get_mut(id) else {
            return;
        };
        if !entry.counted {
            return;
        }
        entry.counted = false;
        let requester = entry.requester.clone();
        if let Some(count) = self.per_user.get_mut(&requester) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_user.remove(&requester);
            }
        }
    }

    /// Forget a dispatched job and give back its per-user and worker slots
    pub fn release(&mut self, id: &JobId, was_running: bool) {
        if was_running {
            self.running = self.running.saturating_sub(1);
        }
        self.settle(id);
        self.active.remove(id);
    }

    pub fn status(&self, id: &JobId) -> Option<JobSnapshot> {
        self.active.get(id).map(|entry| entry.status.borrow().clone())
    }

    pub fn watch(&self, id: &JobId) -> Option<watch::Receiver<JobSnapshot>> {
        self.active.get(id).map(|entry| entry.status.clone())
    }

    /// Non-terminal jobs of `requester`, oldest first
    pub fn jobs_for(&self, requester: &Requester) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .active
            .values()
            .filter(|entry| &entry.requester == requester)
            .map(|entry| entry.status.borrow().clone())
            .filter(|snapshot| !snapshot.state.is_terminal())
            .collect();
        jobs.sort_by_key(|snapshot| snapshot.created_at);
        jobs
    }

    pub fn ids_for(&self, requester: &Requester) -> Vec<JobId> {
        self.active
            .iter()
            .filter(|(_, entry)| &entry.requester == requester)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Refuse further admissions and hand back everything still queued.
    /// Running jobs have their tokens fired.
    pub fn close(&mut self) -> Vec<TrackedJob> {
        self.accepting = false;
        for entry in self.active.values() {
            entry.cancel.cancel();
        }
        self.backlog.drain(..).collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn queued(&self) -> usize {
        self.backlog.len()
    }

    pub fn running(&self) -> usize {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;

    fn record(user: &str) -> JobRecord {
        JobRecord::new(Requester::new(user.to_string()), "https://example.com/a")
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = JobQueue::new(2, 5, 10);
        let first = queue.admit(record("a")).unwrap();
        let second = queue.admit(record("b")).unwrap();

        assert_eq!(queue.dispatch_next().unwrap().id(), first);
        assert_eq!(queue.dispatch_next().unwrap().id(), second);
        assert!(queue.dispatch_next().is_none());
        assert_eq!(queue.running(), 2);
    }

    #[test]
    fn test_per_user_limit() {
        let mut queue = JobQueue::new(2, 1, 10);
        let id = queue.admit(record("a")).unwrap();
        assert_eq!(queue.admit(record("a")), Err(AdmissionError::RateLimited));
        assert!(queue.admit(record("b")).is_ok());

        let job = queue.dispatch_next().unwrap();
        assert_eq!(job.id(), id);
        // still limited while running
        assert_eq!(queue.admit(record("a")), Err(AdmissionError::RateLimited));

        queue.release(&id, true);
        assert!(queue.admit(record("a")).is_ok());
    }

    #[test]
    fn test_backlog_capacity() {
        let mut queue = JobQueue::new(1, 1, 2);
        queue.admit(record("a")).unwrap();
        queue.admit(record("b")).unwrap();
        queue.admit(record("c")).unwrap();
        assert_eq!(queue.admit(record("d")), Err(AdmissionError::Overloaded));
        assert_eq!(queue.queued(), 3);
        assert!(queue.ids_for(&Requester::from("d")).is_empty());

        // a worker picking a job up does not free capacity
        queue.dispatch_next().unwrap();
        assert_eq!(queue.admit(record("d")), Err(AdmissionError::Overloaded));
    }

    #[test]
    fn test_idle_workers_count_towards_capacity() {
        let mut queue = JobQueue::new(2, 1, 1);
        queue.admit(record("a")).unwrap();
        // not yet picked up, but a second worker is free
        queue.admit(record("b")).unwrap();
        queue.admit(record("c")).unwrap();
        assert_eq!(queue.admit(record("d")), Err(AdmissionError::Overloaded));

        let job = queue.dispatch_next().unwrap();
        queue.release(&job.id(), true);
        assert!(queue.admit(record("d")).is_ok());
    }

    #[test]
    fn test_settle_frees_requester_before_release() {
        let mut queue = JobQueue::new(1, 1, 10);
        let id = queue.admit(record("a")).unwrap();
        queue.dispatch_next().unwrap();
        assert_eq!(queue.admit(record("a")), Err(AdmissionError::RateLimited));

        queue.settle(&id);
        let next = queue.admit(record("a")).unwrap();
        assert_eq!(queue.running(), 1);

        // releasing the settled job does not free the new one's slot
        queue.release(&id, true);
        queue.settle(&id);
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.admit(record("a")), Err(AdmissionError::RateLimited));
        assert_eq!(queue.ids_for(&Requester::from("a")), vec![next]);
    }

    #[test]
    fn test_take_queued_and_status() {
        let mut queue = JobQueue::new(1, 1, 10);
        let id = queue.admit(record("a")).unwrap();
        assert_eq!(queue.status(&id).unwrap().state, JobState::Queued);
        assert_eq!(queue.jobs_for(&Requester::from("a")).len(), 1);

        let job = queue.take_queued(&id).unwrap();
        assert_eq!(job.id(), id);
        assert!(queue.take_queued(&id).is_none());
        assert_eq!(queue.running(), 0);

        queue.release(&id, false);
        assert!(queue.status(&id).is_none());
        assert!(queue.jobs_for(&Requester::from("a")).is_empty());
    }

    #[test]
    fn test_close_stops_admission_and_cancels() {
        let mut queue = JobQueue::new(1, 1, 10);
        let running = queue.admit(record("a")).unwrap();
        let waiting = queue.admit(record("b")).unwrap();
        let job = queue.dispatch_next().unwrap();
        assert_eq!(job.id(), running);

        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        assert!(job.is_cancel_requested());
        assert_eq!(drained[0].id(), waiting);
        assert_eq!(queue.admit(record("c")), Err(AdmissionError::ShuttingDown));
    }
}
