//! Media Relay - a chat bot that turns media links into files
//!
//! Users send a link, the bot fetches the media with an extraction tool (yt-dlp),
//! converts it with a transcoding tool (ffmpeg) and sends the result back. The
//! library exposes the job pipeline so it can be driven by any chat transport.

pub mod chat;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod extract;
pub mod jobs;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod scheduler;
pub mod transcode;
pub mod utils;

pub use chat::{ChatClient, ChatFrontend, IncomingMessage};
pub use cli::{Cli, Commands};
pub use config::Config;
pub use jobs::{FailureReason, JobId, JobSnapshot, JobState, Requester};
pub use output::LocalDelivery;
pub use pipeline::Pipeline;
pub use process::{CommandRunner, ProcessRunner};
pub use scheduler::{Scheduler, SchedulerLimits, SchedulerStats};

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Reasons a submission is refused before any job record exists
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Requester already has a job in progress")]
    RateLimited,

    #[error("Backlog is full")]
    Overloaded,

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}
