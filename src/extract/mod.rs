use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ExtractConfig;
use crate::jobs::{FailureReason, JobFailure};
use crate::process::{Invocation, OutputExpectation, ProcessRunner, RunError};

/// File name stem the extraction tool writes into the job directory
pub const SOURCE_STEM: &str = "source";

/// Diagnostics meaning the media itself cannot be fetched
const UNAVAILABLE_PATTERNS: &[&str] = &[
    "video unavailable",
    "is unavailable",
    "video is not available",
    "content isn't available",
    "private video",
    "this video is private",
    "has been removed",
    "been terminated",
    "does not exist",
    "members-only",
    "copyright",
    "sign in to confirm your age",
    "blocked",
    "http error 404",
    "http error 410",
    "http error 429",
    "unable to download webpage",
];

/// Diagnostics meaning the download was refused for its size
const TOO_LARGE_PATTERNS: &[&str] = &["larger than max-filesize", "file is larger than"];

/// Classify extraction tool output into a failure reason.
///
/// Best effort: anything not recognised is a generic extraction failure.
pub fn classify_extraction_failure(diagnostic: &str) -> FailureReason {
    let lower = diagnostic.to_lowercase();

    if TOO_LARGE_PATTERNS.iter().any(|p| lower.contains(p)) {
        FailureReason::OutputTooLarge
    } else if UNAVAILABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        FailureReason::SourceUnavailable
    } else {
        FailureReason::ExtractionFailed
    }
}

/// Extraction stage driving yt-dlp
pub struct ExtractionStage {
    runner: Arc<dyn ProcessRunner>,
    config: ExtractConfig,
}

impl ExtractionStage {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ExtractConfig) -> Self {
        Self { runner, config }
    }

    /// Arguments for one download into `output_dir`
    pub fn build_args(&self, source_url: &str, output_dir: &Path) -> Vec<String> {
        let template = output_dir.join(format!("{}.%(ext)s", SOURCE_STEM));

        let mut args: Vec<String> = vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "--newline".into(),
            "--format".into(),
            "bestaudio/best".into(),
            "--output".into(),
            template.to_string_lossy().into_owned(),
        ];

        if let Some(max) = self.config.max_filesize_mb {
            args.push("--max-filesize".into());
            args.push(format!("{}M", max));
        }

        if let Some(cookies) = self.config.cookies_file.as_ref().filter(|p| p.exists()) {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().into_owned());
        }

        args.extend(self.config.extra_args.iter().cloned());

        // Everything after `--` is a URL, never an option
        args.push("--".into());
        args.push(source_url.to_string());
        args
    }

    /// Download `source_url` into `output_dir`, returning the media file
    pub async fn run(
        &self,
        source_url: &str,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobFailure> {
        tracing::info!(source_url, program = %self.config.program, "Extracting media");

        let invocation = Invocation::new(&self.config.program, self.config.timeout())
            .args(self.build_args(source_url, output_dir))
            .expect(OutputExpectation::Prefixed {
                dir: output_dir.to_path_buf(),
                prefix: format!("{}.", SOURCE_STEM),
            });

        let result = self
            .runner
            .run(invocation, cancel.clone())
            .await
            .map_err(|e| Self::classify_run_error(&e))?;

        if !result.success() {
            let reason = classify_extraction_failure(&result.output_tail);
            return Err(JobFailure::new(
                reason,
                format!(
                    "{} exited with {:?}: {}",
                    self.config.program, result.exit_code, result.output_tail
                ),
            ));
        }

        let Some(path) = result.produced_path else {
            // yt-dlp exits 0 when it skips a download for its size
            let reason = match classify_extraction_failure(&result.output_tail) {
                FailureReason::OutputTooLarge => FailureReason::OutputTooLarge,
                _ => FailureReason::ExtractionFailed,
            };
            return Err(JobFailure::new(
                reason,
                format!("no media file produced: {}", result.output_tail),
            ));
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => {
                tracing::debug!(path = %path.display(), bytes = meta.len(), "Extraction produced file");
                Ok(path)
            }
            Ok(_) => Err(JobFailure::new(
                FailureReason::ExtractionFailed,
                format!("produced file is empty: {}", path.display()),
            )),
            Err(e) => Err(JobFailure::new(
                FailureReason::ExtractionFailed,
                format!("cannot read produced file {}: {}", path.display(), e),
            )),
        }
    }

    fn classify_run_error(error: &RunError) -> JobFailure {
        let reason = match error {
            RunError::Timeout { .. } => FailureReason::Timeout,
            RunError::Cancelled { .. } => FailureReason::Cancelled,
            RunError::Spawn { .. } | RunError::Wait { .. } => FailureReason::ExtractionFailed,
        };
        JobFailure::new(reason, error.to_string())
    }
}
