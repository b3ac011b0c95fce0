//! Delivering terminal outcomes and cleaning up after jobs.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::chat::ChatClient;
use crate::jobs::{JobId, JobState, TrackedJob};
use crate::utils::{extract_domain, format_file_size};

/// Per-job temporary directory, removed when the guard is cleaned up or dropped
#[derive(Debug)]
pub struct JobWorkspace {
    path: PathBuf,
    removed: bool,
}

impl JobWorkspace {
    /// Directory used for `id` under `root`
    pub fn path_for(root: &Path, id: &JobId) -> PathBuf {
        root.join(format!("job-{}", id))
    }

    /// Create the directory for a job that is about to run
    pub fn create(root: &Path, id: &JobId) -> io::Result<Self> {
        let path = Self::path_for(root, id);
        fs_err::create_dir_all(&path)?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    /// Guard an existing (or never created) directory without touching the disk
    pub fn attach(root: &Path, id: &JobId) -> Self {
        Self {
            path: Self::path_for(root, id),
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory and everything in it. Safe to call repeatedly;
    /// a directory that is already gone is not an error.
    pub fn cleanup(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove job directory");
        }
    }
}

/// How a dispatch ended, from the dispatcher's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The chat client accepted the file or notice
    Delivered,
    /// The chat client failed or did not answer in time
    DeliveryFailed,
    /// The job was not in a terminal state or had been dispatched already
    Skipped,
}

/// Hands terminal outcomes to the chat client and removes job files
pub struct ResultDispatcher {
    chat: Arc<dyn ChatClient>,
    temp_root: PathBuf,
    delivery_timeout: Duration,
}

impl ResultDispatcher {
    pub fn new(chat: Arc<dyn ChatClient>, temp_root: PathBuf, delivery_timeout: Duration) -> Self {
        Self {
            chat,
            temp_root,
            delivery_timeout,
        }
    }

    /// Deliver the outcome of a terminal job exactly once, then clean up.
    ///
    /// `workspace` is the guard created when the job started; when absent the
    /// job's directory is derived from its id. Cleanup runs on every path,
    /// including failed deliveries and repeated calls.
    pub async fn dispatch(
        &self,
        job: &mut TrackedJob,
        workspace: Option<JobWorkspace>,
    ) -> DispatchOutcome {
        let id = job.id();
        let mut workspace = workspace.unwrap_or_else(|| JobWorkspace::attach(&self.temp_root, &id));

        let outcome = if !job.record.is_terminal() {
            tracing::error!(job_id = %id, state = %job.record.state(), "Refusing to dispatch non-terminal job");
            DispatchOutcome::Skipped
        } else if !job.record.mark_dispatched() {
            tracing::debug!(job_id = %id, "Job already dispatched");
            DispatchOutcome::Skipped
        } else {
            self.deliver(job).await
        };

        if let Some(artifact) = job.record.artifact_path.take() {
            remove_file_if_present(&artifact);
        }
        if let Err(e) = workspace.cleanup() {
            tracing::warn!(job_id = %id, path = %workspace.path().display(), error = %e, "Failed to remove job directory");
        }

        outcome
    }

    async fn deliver(&self, job: &TrackedJob) -> DispatchOutcome {
        let record = &job.record;
        let requester = &record.requester;

        let delivery = match (record.state(), record.artifact_path.as_deref()) {
            (JobState::Succeeded, Some(path)) => {
                let caption = self.caption(&record.source_url, path);
                tracing::info!(job_id = %record.id, requester = %requester, path = %path.display(), "Delivering file");
                tokio::time::timeout(
                    self.delivery_timeout,
                    self.chat.send_file(requester, path, &caption),
                )
                .await
            }
            (state, _) => {
                let notice = if state == JobState::Succeeded {
                    // Succeeded without an artifact cannot be delivered as a file
                    crate::jobs::FailureReason::TranscodeFailed.notice()
                } else {
                    record.failure_notice()
                };
                tracing::info!(
                    job_id = %record.id,
                    requester = %requester,
                    state = %state,
                    diagnostic = record.diagnostic().unwrap_or_default(),
                    "Sending failure notice"
                );
                tokio::time::timeout(self.delivery_timeout, self.chat.send_text(requester, notice))
                    .await
            }
        };

        match delivery {
            Ok(Ok(())) => DispatchOutcome::Delivered,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %record.id, error = %e, "Delivery to chat client failed");
                DispatchOutcome::DeliveryFailed
            }
            Err(_) => {
                tracing::warn!(job_id = %record.id, timeout = ?self.delivery_timeout, "Delivery to chat client timed out");
                DispatchOutcome::DeliveryFailed
            }
        }
    }

    fn caption(&self, source_url: &str, path: &Path) -> String {
        let domain = extract_domain(source_url).unwrap_or_else(|| "media".to_string());
        match std::fs::metadata(path) {
            Ok(meta) => format!("✅ {} · {}", domain, format_file_size(meta.len())),
            Err(_) => format!("✅ {}", domain),
        }
    }
}

fn remove_file_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact"),
    }
}
