use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier of a job, assigned at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of the user who submitted a job, as given by the chat platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requester(String);

impl Requester {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for Requester {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for Requester {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Extracting,
    Transcoding,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Extracting)
                | (Queued, Cancelled)
                | (Extracting, Transcoding)
                | (Extracting, Failed)
                | (Extracting, Cancelled)
                | (Transcoding, Succeeded)
                | (Transcoding, Failed)
                | (Transcoding, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Extracting => write!(f, "extracting"),
            JobState::Transcoding => write!(f, "transcoding"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a job did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Cancelled,
    SourceUnavailable,
    ExtractionFailed,
    TranscodeFailed,
    OutputTooLarge,
}

impl FailureReason {
    /// Short notice shown to the requester. Never carries tool output.
    pub fn notice(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "❌ Processing timed out. Please try again later.",
            FailureReason::Cancelled => "🚫 Your request was cancelled.",
            FailureReason::SourceUnavailable => {
                "❌ Source unavailable: the media is private, removed or blocked."
            }
            FailureReason::ExtractionFailed => "❌ Could not download media from that link.",
            FailureReason::TranscodeFailed => "❌ Could not convert the media.",
            FailureReason::OutputTooLarge => "❌ Output too large to send.",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::SourceUnavailable => write!(f, "source_unavailable"),
            FailureReason::ExtractionFailed => write!(f, "extraction_failed"),
            FailureReason::TranscodeFailed => write!(f, "transcode_failed"),
            FailureReason::OutputTooLarge => write!(f, "output_too_large"),
        }
    }
}

/// A classified stage failure together with the internal detail behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub detail: String,
}

impl JobFailure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

/// One user request, tracked from admission to dispatch
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub requester: Requester,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub artifact_path: Option<PathBuf>,
    state: JobState,
    history: Vec<JobState>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    failure_reason: Option<FailureReason>,
    diagnostic: Option<String>,
    attempt_count: u32,
    dispatched: bool,
}

impl JobRecord {
    pub fn new(requester: Requester, source_url: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            requester,
            source_url: source_url.into(),
            created_at: Utc::now(),
            artifact_path: None,
            state: JobState::Queued,
            history: vec![JobState::Queued],
            started_at: None,
            finished_at: None,
            failure_reason: None,
            diagnostic: None,
            attempt_count: 0,
            dispatched: false,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure_reason
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move along the state machine, stamping timestamps on the way
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }

        if next == JobState::Extracting {
            self.started_at = Some(Utc::now());
            self.attempt_count += 1;
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }

        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Terminate with a classified failure. A cancellation lands in `Cancelled`,
    /// everything else in `Failed`.
    pub fn fail(&mut self, failure: JobFailure) -> Result<(), TransitionError> {
        if failure.reason == FailureReason::Cancelled {
            self.transition(JobState::Cancelled)?;
        } else {
            self.transition(JobState::Failed)?;
            self.failure_reason = Some(failure.reason);
        }
        self.diagnostic = Some(failure.detail);
        Ok(())
    }

    /// Notice for a job that ended without a file to deliver
    pub fn failure_notice(&self) -> &'static str {
        match self.state {
            JobState::Cancelled => FailureReason::Cancelled.notice(),
            _ => self
                .failure_reason
                .unwrap_or(FailureReason::ExtractionFailed)
                .notice(),
        }
    }

    /// Marks the record dispatched; returns false if it already was
    pub fn mark_dispatched(&mut self) -> bool {
        !std::mem::replace(&mut self.dispatched, true)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            requester: self.requester.clone(),
            source_url: self.source_url.clone(),
            state: self.state,
            history: self.history.clone(),
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            attempt_count: self.attempt_count,
        }
    }
}

/// Read-only copy of a job's state, safe to hand to status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub requester: Requester,
    pub source_url: String,
    pub state: JobState,
    pub history: Vec<JobState>,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
}

/// A job record together with its cancellation token and status channel.
///
/// Whoever holds the `TrackedJob` is the single writer of the record: the
/// backlog while queued, then the worker running it. Readers go through the
/// `watch` receiver handed out at admission.
#[derive(Debug)]
pub struct TrackedJob {
    pub record: JobRecord,
    cancel: CancellationToken,
    status: watch::Sender<JobSnapshot>,
}

impl TrackedJob {
    pub fn new(record: JobRecord) -> (Self, watch::Receiver<JobSnapshot>) {
        let (status, rx) = watch::channel(record.snapshot());
        let job = Self {
            record,
            cancel: CancellationToken::new(),
            status,
        };
        (job, rx)
    }

    pub fn id(&self) -> JobId {
        self.record.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        self.record.transition(next)?;
        tracing::info!(job_id = %self.record.id, state = %next, "Job state changed");
        self.publish();
        Ok(())
    }

    pub fn fail(&mut self, failure: JobFailure) -> Result<(), TransitionError> {
        tracing::debug!(job_id = %self.record.id, detail = %failure.detail, "Job failure detail");
        let reason = failure.reason;
        self.record.fail(failure)?;
        tracing::info!(
            job_id = %self.record.id,
            state = %self.record.state(),
            reason = %reason,
            "Job terminated"
        );
        self.publish();
        Ok(())
    }

    pub fn publish(&self) {
        self.status.send_replace(self.record.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(Requester::new("42"), "https://example.com/watch?v=1")
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = record();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.attempt_count(), 0);

        job.transition(JobState::Extracting).unwrap();
        assert!(job.started_at().is_some());
        assert_eq!(job.attempt_count(), 1);

        job.transition(JobState::Transcoding).unwrap();
        job.transition(JobState::Succeeded).unwrap();
        assert!(job.finished_at().is_some());
        assert_eq!(
            job.history(),
            &[
                JobState::Queued,
                JobState::Extracting,
                JobState::Transcoding,
                JobState::Succeeded
            ]
        );
    }

    #[test]
    fn test_no_backwards_or_skipping_transitions() {
        let mut job = record();
        assert!(job.transition(JobState::Transcoding).is_err());
        assert!(job.transition(JobState::Succeeded).is_err());
        assert!(job.transition(JobState::Failed).is_err());

        job.transition(JobState::Extracting).unwrap();
        assert!(job.transition(JobState::Queued).is_err());
        assert!(job.transition(JobState::Extracting).is_err());

        job.transition(JobState::Cancelled).unwrap();
        for next in [
            JobState::Queued,
            JobState::Extracting,
            JobState::Transcoding,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert!(job.transition(next).is_err(), "terminal -> {next}");
        }
    }

    #[test]
    fn test_fail_sets_reason_only_when_failed() {
        let mut job = record();
        job.transition(JobState::Extracting).unwrap();
        job.fail(JobFailure::new(FailureReason::Timeout, "yt-dlp killed after 300s"))
            .unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.failure_reason(), Some(FailureReason::Timeout));
        assert_eq!(job.diagnostic(), Some("yt-dlp killed after 300s"));
        assert_eq!(job.failure_notice(), FailureReason::Timeout.notice());

        let mut job = record();
        job.transition(JobState::Extracting).unwrap();
        job.fail(JobFailure::new(FailureReason::Cancelled, "user"))
            .unwrap();
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(job.failure_reason(), None);
        assert_eq!(job.failure_notice(), FailureReason::Cancelled.notice());
    }

    #[test]
    fn test_mark_dispatched_once() {
        let mut job = record();
        assert!(job.mark_dispatched());
        assert!(!job.mark_dispatched());
    }

    #[test]
    fn test_ids_are_unique() {
        let ids: std::collections::HashSet<JobId> = (0..1000).map(|_| JobId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let mut job = record();
        job.transition(JobState::Extracting).unwrap();
        let snapshot = job.snapshot();

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["id"], snapshot.id.to_string());
        assert_eq!(json["state"], "extracting");
        assert_eq!(json["history"], serde_json::json!(["queued", "extracting"]));

        let back: JobSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[tokio::test]
    async fn test_tracked_job_publishes_snapshots() {
        let (mut job, rx) = TrackedJob::new(record());
        assert_eq!(rx.borrow().state, JobState::Queued);

        job.transition(JobState::Extracting).unwrap();
        assert_eq!(rx.borrow().state, JobState::Extracting);

        job.cancel_token().cancel();
        assert!(job.is_cancel_requested());
        job.fail(JobFailure::new(FailureReason::Cancelled, "stop"))
            .unwrap();

        drop(job);
        let last = rx.borrow().clone();
        assert_eq!(last.state, JobState::Cancelled);
        assert_eq!(
            last.history,
            vec![JobState::Queued, JobState::Extracting, JobState::Cancelled]
        );
    }
}
