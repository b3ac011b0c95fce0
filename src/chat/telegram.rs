//! Telegram Bot API transport.
//!
//! Receives messages with long-polling `getUpdates` and sends replies with
//! `sendMessage`, `sendAudio` and `sendDocument`.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChatClient, ChatError, ChatFrontend, IncomingMessage};
use crate::config::TelegramConfig;
use crate::jobs::Requester;
use crate::transcode::MediaFormat;

/// Telegram `sendMessage` text limit (UTF-8 characters)
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram caption limit
const TELEGRAM_CAPTION_LIMIT: usize = 1024;

/// Pause after a failed poll before trying again
const POLL_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Telegram Bot API client
pub struct TelegramClient {
    client: Client,
    base_url: String,
    poll_timeout: Duration,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> anyhow::Result<Self> {
        if config.bot_token.is_empty() {
            anyhow::bail!("Telegram bot token is not configured");
        }

        let poll_timeout = Duration::from_secs(config.poll_timeout_secs);
        let client = Client::builder()
            // leave room for the long-poll itself
            .timeout(poll_timeout + Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: format!(
                "{}/bot{}",
                config.api_url.trim_end_matches('/'),
                config.bot_token
            ),
            poll_timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ChatError> {
        let status = response.status();
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| ChatError::Request(format!("invalid response ({}): {}", status, e)))?;

        match (body.ok, body.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(ChatError::Api(
                body.description
                    .unwrap_or_else(|| format!("request failed with {}", status)),
            )),
        }
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, ChatError> {
        let payload = json!({
            "offset": offset,
            "timeout": self.poll_timeout.as_secs(),
            "allowed_updates": ["message"],
        });

        let response = self
            .client
            .post(self.method_url("getUpdates"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChatError::Request(e.to_string()))?;

        Self::parse_response(response).await
    }

    /// Feed incoming messages to `frontend` until `shutdown` fires
    pub async fn run_polling(&self, frontend: Arc<ChatFrontend>, shutdown: CancellationToken) {
        let mut offset = 0i64;
        tracing::info!("Polling Telegram for updates");

        loop {
            let updates = tokio::select! {
                _ = shutdown.cancelled() => break,
                updates = self.get_updates(offset) => updates,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let Some(message) = update.message else {
                            continue;
                        };
                        let Some(text) = message.text else {
                            continue;
                        };
                        let incoming = IncomingMessage::new(Requester::from(message.chat.id), text);
                        let frontend = frontend.clone();
                        tokio::spawn(async move { frontend.handle(incoming).await });
                    }
                }
                Err(e) => {
                    warn!("Telegram getUpdates failed: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(POLL_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!("Telegram polling stopped");
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn send_file(
        &self,
        to: &Requester,
        path: &Path,
        caption: &str,
    ) -> Result<(), ChatError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(MediaFormat::from_extension);

        let (method, field) = match format {
            Some(f) if f.is_audio() => ("sendAudio", "audio"),
            _ => ("sendDocument", "document"),
        };

        let bytes = tokio::fs::read(path).await?;
        debug!("Uploading {} ({} bytes) via {}", file_name, bytes.len(), method);

        let mut part = Part::bytes(bytes).file_name(file_name);
        if let Some(format) = format {
            part = part
                .mime_str(format.mime_type())
                .map_err(|e| ChatError::Request(e.to_string()))?;
        }

        let form = Form::new()
            .text("chat_id", to.as_str().to_string())
            .text("caption", truncate_message(caption, TELEGRAM_CAPTION_LIMIT))
            .part(field, part);

        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChatError::Request(e.to_string()))?;

        Self::parse_response::<serde_json::Value>(response)
            .await
            .map(|_| ())
    }

    async fn send_text(&self, to: &Requester, message: &str) -> Result<(), ChatError> {
        let payload = json!({
            "chat_id": to.as_str(),
            "text": truncate_message(message, TELEGRAM_MESSAGE_LIMIT),
        });

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChatError::Request(e.to_string()))?;

        Self::parse_response::<serde_json::Value>(response)
            .await
            .map(|_| ())
    }
}

/// Cut `text` to at most `limit` characters, marking the cut with an ellipsis
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}
