use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "media-relay",
    about = "Media Relay - turn media links sent to a chat bot into audio files",
    version,
    long_about = "A Telegram bot that downloads media from links with yt-dlp, converts it with ffmpeg and sends the result back to the user. Jobs run on a bounded worker pool with per-user limits."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./config.yaml or the user config directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bot
    Run {
        /// Bot API token (overrides the configuration file)
        #[arg(long, env = "MEDIA_RELAY_BOT_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Process a single link locally and save the result
    Fetch {
        /// Link to the media
        #[arg(value_name = "URL")]
        url: String,

        /// Directory for the converted file
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        output: PathBuf,

        /// Disable the progress spinner
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// Check that the external tools are installed
    Check,
}
