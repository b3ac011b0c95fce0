use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transcode::MediaFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat platform connection
    pub telegram: TelegramConfig,

    /// Admission and worker pool settings
    pub pipeline: PipelineConfig,

    /// Extraction tool settings
    pub extract: ExtractConfig,

    /// Transcoding tool settings
    pub transcode: TranscodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot API token
    pub bot_token: String,

    /// Bot API base URL
    pub api_url: String,

    /// Long-poll timeout for getUpdates
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of jobs processed at the same time
    pub workers: usize,

    /// Non-terminal jobs allowed per user
    pub per_user_limit: usize,

    /// Admitted jobs waiting for a worker
    pub backlog_capacity: usize,

    /// Root for per-job temporary directories
    pub temp_root: Option<PathBuf>,

    /// Upper bound for handing a result to the chat client
    pub delivery_timeout_secs: u64,

    /// Longest accepted source URL
    pub max_url_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Extraction tool executable
    pub program: String,

    /// Deadline for one extraction
    pub timeout_secs: u64,

    /// Cookies file passed to the tool when it exists
    pub cookies_file: Option<PathBuf>,

    /// Download size limit handed to the tool
    pub max_filesize_mb: Option<u64>,

    /// Additional arguments placed before the URL
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Transcoding tool executable
    pub program: String,

    /// Probe tool used to read the input duration
    pub probe_program: String,

    /// Deadline for one transcode
    pub timeout_secs: u64,

    /// Output container/codec
    pub format: MediaFormat,

    /// Target bitrate, e.g. "192k"
    pub bitrate: String,

    /// Reject inputs longer than this
    pub max_duration_secs: Option<u64>,

    /// Reject outputs larger than this
    pub max_output_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            pipeline: PipelineConfig::default(),
            extract: ExtractConfig::default(),
            transcode: TranscodeConfig::default(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_url: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 30,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            per_user_limit: 1,
            backlog_capacity: 50,
            temp_root: None,
            delivery_timeout_secs: 120,
            max_url_length: 2048,
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            timeout_secs: 300,
            cookies_file: None,
            max_filesize_mb: Some(200),
            extra_args: Vec::new(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            probe_program: "ffprobe".to_string(),
            timeout_secs: 300,
            format: MediaFormat::Mp3,
            bitrate: "192k".to_string(),
            max_duration_secs: Some(3600),
            // Telegram bots may upload up to 50 MB
            max_output_bytes: 49 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("media-relay"))
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

impl ExtractConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TranscodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from `path`, or from the default locations.
    /// A missing default file is created with default values.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }

        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save(&config_path).await?;
            Ok(config)
        }
    }

    /// Read and validate a configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path).context("Failed to read config file")?;

        let config: Config =
            serde_yaml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join("media-relay").join("config.yaml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            anyhow::bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.per_user_limit == 0 {
            anyhow::bail!("pipeline.per_user_limit must be at least 1");
        }
        if self.pipeline.backlog_capacity == 0 {
            anyhow::bail!("pipeline.backlog_capacity must be at least 1");
        }
        if self.extract.timeout_secs == 0 || self.transcode.timeout_secs == 0 {
            anyhow::bail!("Stage timeouts must be greater than zero");
        }
        if self.transcode.max_output_bytes == 0 {
            anyhow::bail!("transcode.max_output_bytes must be greater than zero");
        }
        if self.transcode.bitrate.trim().is_empty() {
            anyhow::bail!("transcode.bitrate must not be empty");
        }

        Ok(())
    }

    /// Apply an override for the bot token (e.g. from the environment)
    pub fn with_bot_token(mut self, token: Option<String>) -> Self {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.telegram.bot_token = token;
        }
        self
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!(
            "  Bot Token: {}",
            if self.telegram.bot_token.is_empty() {
                "(not set)"
            } else {
                "(set)"
            }
        );
        println!("  API URL: {}", self.telegram.api_url);
        println!("  Workers: {}", self.pipeline.workers);
        println!("  Per-user Limit: {}", self.pipeline.per_user_limit);
        println!("  Backlog Capacity: {}", self.pipeline.backlog_capacity);
        println!("  Temp Root: {}", self.pipeline.temp_root().display());
        println!(
            "  Extractor: {} (timeout {}s)",
            self.extract.program, self.extract.timeout_secs
        );
        println!(
            "  Transcoder: {} -> {} @ {} (timeout {}s)",
            self.transcode.program,
            self.transcode.format.as_str(),
            self.transcode.bitrate,
            self.transcode.timeout_secs
        );
        if let Some(max) = self.transcode.max_duration_secs {
            println!("  Max Duration: {}", crate::utils::format_duration(max as f64));
        }
        println!(
            "  Max Output Size: {}",
            crate::utils::format_file_size(self.transcode.max_output_bytes)
        );
    }
}
