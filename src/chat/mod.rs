use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::jobs::{JobSnapshot, Requester};
use crate::scheduler::Scheduler;
use crate::AdmissionError;

pub mod telegram;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Request(String),

    #[error("chat API error: {0}")]
    Api(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outbound side of the chat platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a media file to a user
    async fn send_file(&self, to: &Requester, path: &Path, caption: &str)
        -> Result<(), ChatError>;

    /// Send a plain text message to a user
    async fn send_text(&self, to: &Requester, message: &str) -> Result<(), ChatError>;
}

/// Inbound message from the chat platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub requester: Requester,
    pub text: String,
}

impl IncomingMessage {
    pub fn new(requester: Requester, text: impl Into<String>) -> Self {
        Self {
            requester,
            text: text.into(),
        }
    }
}

/// What a message asks the bot to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Status,
    Cancel,
    Fetch(String),
    Unknown(String),
}

impl BotCommand {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let Some(rest) = text.strip_prefix('/') else {
            return BotCommand::Fetch(candidate_url(text));
        };

        let mut parts = rest.splitn(2, char::is_whitespace);
        // Group chats address commands as /cmd@botname
        let command = parts
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let args = parts.next().unwrap_or_default();

        match command.as_str() {
            "start" => BotCommand::Start,
            "help" => BotCommand::Help,
            "status" | "stat" => BotCommand::Status,
            "cancel" => BotCommand::Cancel,
            "get" | "fetch" | "dl" => BotCommand::Fetch(candidate_url(args)),
            other => BotCommand::Unknown(other.to_string()),
        }
    }
}

/// First http(s) link in `text`, without surrounding punctuation
pub fn extract_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| matches!(c, '<' | '>' | '(' | ')' | '"' | '\'' | ',')))
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(|token| token.trim_end_matches(['.', '!', '?', ';']).to_string())
}

/// The link in `text` if there is one, otherwise the text itself so admission
/// can reject it with a reason
fn candidate_url(text: &str) -> String {
    extract_url(text).unwrap_or_else(|| text.trim().to_string())
}

const HELP_TEXT: &str = "Send me a link to a video or track and I will reply with the audio.\n\n\
/status - show your current request\n\
/cancel - cancel your current request\n\
/help - show this message";

/// Turns inbound messages into scheduler calls and short replies
pub struct ChatFrontend {
    scheduler: Scheduler,
    chat: Arc<dyn ChatClient>,
}

impl ChatFrontend {
    pub fn new(scheduler: Scheduler, chat: Arc<dyn ChatClient>) -> Self {
        Self { scheduler, chat }
    }

    pub async fn handle(&self, message: IncomingMessage) {
        let requester = message.requester;
        let reply = match BotCommand::parse(&message.text) {
            BotCommand::Start => format!("👋 Hi!\n\n{}", HELP_TEXT),
            BotCommand::Help => HELP_TEXT.to_string(),
            BotCommand::Status => Self::status_text(&self.scheduler.jobs_for(&requester)),
            BotCommand::Cancel => match self.scheduler.cancel_for(&requester).await {
                0 => "Nothing to cancel.".to_string(),
                n => format!("Cancelled {} request(s).", n),
            },
            BotCommand::Unknown(command) => {
                tracing::debug!(requester = %requester, command = %command, "Ignoring unknown command");
                return;
            }
            BotCommand::Fetch(url) => match self.scheduler.submit(requester.clone(), &url) {
                Ok(id) => {
                    tracing::info!(job_id = %id, requester = %requester, "Request queued");
                    "⏳ Got it, working on your link...".to_string()
                }
                Err(e) => {
                    tracing::info!(requester = %requester, error = %e, "Request rejected");
                    Self::rejection_text(&e).to_string()
                }
            },
        };

        if let Err(e) = self.chat.send_text(&requester, &reply).await {
            tracing::warn!(requester = %requester, error = %e, "Failed to send reply");
        }
    }

    pub fn rejection_text(error: &AdmissionError) -> &'static str {
        match error {
            AdmissionError::InvalidInput(_) => "⚠️ Please send a valid http(s) link.",
            AdmissionError::RateLimited => {
                "⚠️ Your previous request is still in progress. Please wait for it to finish."
            }
            AdmissionError::Overloaded => "⚠️ I'm busy right now. Please try again in a few minutes.",
            AdmissionError::ShuttingDown => "⚠️ I'm restarting. Please try again shortly.",
        }
    }

    fn status_text(jobs: &[JobSnapshot]) -> String {
        if jobs.is_empty() {
            return "No requests in progress.".to_string();
        }
        let lines: Vec<String> = jobs
            .iter()
            .map(|job| format!("• {} ({})", job.source_url, job.state))
            .collect();
        format!("Your requests:\n{}", lines.join("\n"))
    }
}
