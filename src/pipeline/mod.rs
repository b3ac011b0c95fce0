use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;

use crate::chat::ChatClient;
use crate::config::Config;
use crate::dispatch::{DispatchOutcome, JobWorkspace, ResultDispatcher};
use crate::extract::ExtractionStage;
use crate::jobs::{FailureReason, JobFailure, JobState, TrackedJob, TransitionError};
use crate::process::ProcessRunner;
use crate::transcode::TranscodeStage;

/// Runs one job end to end: extraction, transcoding, then dispatch
pub struct Pipeline {
    extract: ExtractionStage,
    transcode: TranscodeStage,
    dispatcher: ResultDispatcher,
    temp_root: PathBuf,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn new(config: &Config, runner: Arc<dyn ProcessRunner>, chat: Arc<dyn ChatClient>) -> Self {
        let temp_root = config.pipeline.temp_root();
        Self {
            extract: ExtractionStage::new(runner.clone(), config.extract.clone()),
            transcode: TranscodeStage::new(runner, config.transcode.clone()),
            dispatcher: ResultDispatcher::new(
                chat,
                temp_root.clone(),
                config.pipeline.delivery_timeout(),
            ),
            temp_root,
        }
    }

    pub fn dispatcher(&self) -> &ResultDispatcher {
        &self.dispatcher
    }

    /// Process a job that was just taken off the backlog. Always leaves the
    /// job in a terminal state and dispatched.
    pub async fn process(&self, job: &mut TrackedJob) -> DispatchOutcome {
        let workspace = self.run(job).await;
        self.dispatcher.dispatch(job, workspace).await
    }

    /// Run the stages of a job without dispatching it. The job is terminal
    /// when this returns; the workspace, if one was created, is handed back
    /// for the dispatcher to clean up.
    pub async fn run(&self, job: &mut TrackedJob) -> Option<JobWorkspace> {
        let span = tracing::info_span!("job", job_id = %job.id());
        let workspace = match self.run_stages(job).instrument(span).await {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Job state machine violated");
                None
            }
        };

        if !job.record.is_terminal() {
            // only reachable after a transition error above
            let _ = job.fail(JobFailure::new(
                FailureReason::ExtractionFailed,
                "pipeline stopped in a non-terminal state",
            ));
        }

        workspace
    }

    async fn run_stages(
        &self,
        job: &mut TrackedJob,
    ) -> Result<Option<JobWorkspace>, TransitionError> {
        if job.is_cancel_requested() {
            job.transition(JobState::Cancelled)?;
            return Ok(None);
        }

        job.transition(JobState::Extracting)?;

        let workspace = match JobWorkspace::create(&self.temp_root, &job.id()) {
            Ok(workspace) => workspace,
            Err(e) => {
                job.fail(JobFailure::new(
                    FailureReason::ExtractionFailed,
                    format!("cannot create job directory: {}", e),
                ))?;
                return Ok(None);
            }
        };

        let cancel = job.cancel_token().clone();
        let source_url = job.record.source_url.clone();

        let extracted = match self
            .extract
            .run(&source_url, workspace.path(), &cancel)
            .await
        {
            Ok(path) => path,
            Err(failure) => {
                job.fail(failure)?;
                return Ok(Some(workspace));
            }
        };

        job.record.artifact_path = Some(extracted.clone());
        job.transition(JobState::Transcoding)?;

        if job.is_cancel_requested() {
            job.fail(JobFailure::new(
                FailureReason::Cancelled,
                "cancelled before transcoding",
            ))?;
            return Ok(Some(workspace));
        }

        match self
            .transcode
            .run(&extracted, workspace.path(), &cancel)
            .await
        {
            Ok(output) => {
                job.record.artifact_path = Some(output);
                job.transition(JobState::Succeeded)?;
            }
            Err(failure) => job.fail(failure)?,
        }

        Ok(Some(workspace))
    }
}
