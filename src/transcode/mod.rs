use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::TranscodeConfig;
use crate::jobs::{FailureReason, JobFailure};
use crate::process::{Invocation, OutputExpectation, ProcessRunner, RunError};

/// File name stem of the converted file inside the job directory
pub const OUTPUT_STEM: &str = "output";

/// Probing a duration never needs the full transcode deadline
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Supported output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp3,
    M4a,
    Ogg,
    Flac,
    Wav,
    Mp4,
}

impl MediaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "mp3",
            MediaFormat::M4a => "m4a",
            MediaFormat::Ogg => "ogg",
            MediaFormat::Flac => "flac",
            MediaFormat::Wav => "wav",
            MediaFormat::Mp4 => "mp4",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "mp3" => Some(MediaFormat::Mp3),
            "m4a" | "aac" => Some(MediaFormat::M4a),
            "ogg" | "opus" => Some(MediaFormat::Ogg),
            "flac" => Some(MediaFormat::Flac),
            "wav" => Some(MediaFormat::Wav),
            "mp4" => Some(MediaFormat::Mp4),
            _ => None,
        }
    }

    /// Get MIME type for the format
    pub fn mime_type(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "audio/mpeg",
            MediaFormat::M4a => "audio/mp4",
            MediaFormat::Ogg => "audio/ogg",
            MediaFormat::Flac => "audio/flac",
            MediaFormat::Wav => "audio/wav",
            MediaFormat::Mp4 => "video/mp4",
        }
    }

    pub fn is_audio(&self) -> bool {
        !matches!(self, MediaFormat::Mp4)
    }

    /// Encoder arguments for this format. Lossless formats ignore the bitrate.
    pub fn codec_args(&self, bitrate: &str) -> Vec<String> {
        let args: Vec<&str> = match self {
            MediaFormat::Mp3 => vec!["-vn", "-codec:a", "libmp3lame", "-b:a", bitrate],
            MediaFormat::M4a => vec!["-vn", "-codec:a", "aac", "-b:a", bitrate],
            MediaFormat::Ogg => vec!["-vn", "-codec:a", "libopus", "-b:a", bitrate],
            MediaFormat::Flac => vec!["-vn", "-codec:a", "flac"],
            MediaFormat::Wav => vec!["-vn", "-codec:a", "pcm_s16le"],
            MediaFormat::Mp4 => vec![
                "-codec:v",
                "libx264",
                "-preset",
                "veryfast",
                "-codec:a",
                "aac",
                "-b:a",
                bitrate,
                "-movflags",
                "+faststart",
            ],
        };
        args.into_iter().map(String::from).collect()
    }
}

/// Transcode stage driving ffmpeg, with an ffprobe duration check up front
pub struct TranscodeStage {
    runner: Arc<dyn ProcessRunner>,
    config: TranscodeConfig,
}

impl TranscodeStage {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: TranscodeConfig) -> Self {
        Self { runner, config }
    }

    pub fn output_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.{}", OUTPUT_STEM, self.config.format.as_str()))
    }

    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "warning".into(),
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
        ];
        args.extend(self.config.format.codec_args(&self.config.bitrate));
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Read the media duration in seconds. `Ok(None)` when it cannot be
    /// determined; only a cancellation is reported as an error.
    pub async fn probe_duration(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, JobFailure> {
        let invocation = Invocation::new(
            &self.config.probe_program,
            PROBE_TIMEOUT.min(self.config.timeout()),
        )
        .args([
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            input.to_string_lossy().into_owned(),
        ]);

        match self.runner.run(invocation, cancel.clone()).await {
            Ok(result) if result.success() => Ok(parse_probe_duration(&result.output_tail)),
            Ok(result) => {
                tracing::warn!(exit_code = ?result.exit_code, "Duration probe failed, skipping check");
                Ok(None)
            }
            Err(e @ RunError::Cancelled { .. }) => {
                Err(JobFailure::new(FailureReason::Cancelled, e.to_string()))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Duration probe unavailable, skipping check");
                Ok(None)
            }
        }
    }

    /// Convert `input` into the configured format inside `output_dir`.
    /// On success the input file is deleted and the converted file returned.
    pub async fn run(
        &self,
        input: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobFailure> {
        if let Some(max) = self.config.max_duration_secs {
            if let Some(duration) = self.probe_duration(input, cancel).await? {
                if duration > max as f64 {
                    return Err(JobFailure::new(
                        FailureReason::OutputTooLarge,
                        format!(
                            "input lasts {}, limit is {}",
                            crate::utils::format_duration(duration),
                            crate::utils::format_duration(max as f64)
                        ),
                    ));
                }
            }
        }

        let output = self.output_path(output_dir);
        tracing::info!(
            input = %input.display(),
            format = self.config.format.as_str(),
            "Transcoding media"
        );

        let invocation = Invocation::new(&self.config.program, self.config.timeout())
            .args(self.build_args(input, &output))
            .expect(OutputExpectation::File(output.clone()));

        let result = self
            .runner
            .run(invocation, cancel.clone())
            .await
            .map_err(|e| Self::classify_run_error(&e))?;

        if !result.success() {
            return Err(JobFailure::new(
                FailureReason::TranscodeFailed,
                format!(
                    "{} exited with {:?}: {}",
                    self.config.program, result.exit_code, result.output_tail
                ),
            ));
        }

        let Some(produced) = result.produced_path else {
            return Err(JobFailure::new(
                FailureReason::TranscodeFailed,
                format!("no output written to {}", output.display()),
            ));
        };

        let size = tokio::fs::metadata(&produced)
            .await
            .map(|meta| meta.len())
            .map_err(|e| {
                JobFailure::new(
                    FailureReason::TranscodeFailed,
                    format!("cannot read output {}: {}", produced.display(), e),
                )
            })?;

        if size == 0 {
            return Err(JobFailure::new(
                FailureReason::TranscodeFailed,
                "transcoded file is empty",
            ));
        }

        if size > self.config.max_output_bytes {
            return Err(JobFailure::new(
                FailureReason::OutputTooLarge,
                format!(
                    "output is {}, limit is {}",
                    crate::utils::format_file_size(size),
                    crate::utils::format_file_size(self.config.max_output_bytes)
                ),
            ));
        }

        if produced != input {
            if let Err(e) = tokio::fs::remove_file(input).await {
                tracing::warn!(path = %input.display(), error = %e, "Failed to delete extracted file");
            }
        }

        Ok(produced)
    }

    fn classify_run_error(error: &RunError) -> JobFailure {
        let reason = match error {
            RunError::Timeout { .. } => FailureReason::Timeout,
            RunError::Cancelled { .. } => FailureReason::Cancelled,
            RunError::Spawn { .. } | RunError::Wait { .. } => FailureReason::TranscodeFailed,
        };
        JobFailure::new(reason, error.to_string())
    }
}

/// Parse ffprobe's bare `format=duration` output
pub fn parse_probe_duration(output: &str) -> Option<f64> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}
