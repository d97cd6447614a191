//! Telegram notifier: one forum topic per task in a supergroup.
//!
//! Uses the Bot API directly: `createForumTopic` to open a task topic and
//! `sendMessage` with `message_thread_id` to post into it.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::channels::Notifier;
use crate::channels::callback::{CallbackData, CallbackVerb};
use crate::config::TelegramConfig;
use crate::error::ChannelError;
use crate::tasks::Task;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum forum topic name length.
const TOPIC_NAME_MAX_CHARS: usize = 128;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Posts task progress into Telegram forum topics.
pub struct TelegramNotifier {
    bot_token: SecretString,
    chat_id: String,
    client: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ForumTopic {
    message_thread_id: i64,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            client: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Point at a different Bot API server.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Post a message with Approve / Reject buttons for `short_id`.
    pub async fn send_approval_prompt(
        &self,
        thread_id: Option<&str>,
        text: &str,
        prefix: &str,
        short_id: &str,
    ) -> Result<(), ChannelError> {
        let keyboard = approval_keyboard(prefix, short_id)?;
        self.send_message_chunk(thread_id, text, Some(keyboard))
            .await
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(
        &self,
        thread_id: Option<&str>,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        if let Some(thread) = thread_id {
            match thread.parse::<i64>() {
                Ok(id) => body["message_thread_id"] = json!(id),
                Err(_) => tracing::warn!(thread_id = thread, "Ignoring non-numeric thread id"),
            }
        }
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }

        let mut markdown_body = body.clone();
        markdown_body["parse_mode"] = json!("Markdown");

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {}, plain: {})",
                    markdown_status, plain_err
                ),
            });
        }

        Ok(())
    }

    async fn create_forum_topic(&self, name: &str) -> Result<String, ChannelError> {
        let topic_err = |reason: String| ChannelError::TopicFailed {
            name: "telegram".into(),
            reason,
        };

        let resp = self
            .client
            .post(self.api_url("createForumTopic"))
            .json(&json!({ "chat_id": self.chat_id, "name": name }))
            .send()
            .await
            .map_err(|e| topic_err(e.to_string()))?;

        let status = resp.status();
        let parsed: ApiResponse<ForumTopic> = resp
            .json()
            .await
            .map_err(|e| topic_err(format!("createForumTopic returned {status}: {e}")))?;

        match parsed {
            ApiResponse {
                ok: true,
                result: Some(topic),
                ..
            } => Ok(topic.message_thread_id.to_string()),
            ApiResponse { description, .. } => Err(topic_err(
                description.unwrap_or_else(|| format!("createForumTopic returned {status}")),
            )),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_to_topic(&self, thread_id: Option<&str>, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(thread_id, &chunk, None).await?;
        }
        Ok(())
    }

    async fn create_topic_for_task(&self, task: &Task) -> Result<Option<String>, ChannelError> {
        let thread_id = self.create_forum_topic(&topic_name(task)).await?;
        tracing::debug!(task_id = %task.id, %thread_id, "Created task topic");
        Ok(Some(thread_id))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// `"{short_id} {project}: {description}"`, cut to Telegram's topic limit.
pub fn topic_name(task: &Task) -> String {
    let first_line = task.description.lines().next().unwrap_or_default();
    let full = format!("{} {}: {}", task.short_id(), task.project, first_line.trim());
    if full.chars().count() <= TOPIC_NAME_MAX_CHARS {
        return full;
    }
    let mut cut: String = full.chars().take(TOPIC_NAME_MAX_CHARS - 1).collect();
    cut.push('…');
    cut
}

/// Inline keyboard with Approve / Reject buttons.
fn approval_keyboard(prefix: &str, short_id: &str) -> Result<serde_json::Value, ChannelError> {
    let approve = CallbackData::new(prefix, CallbackVerb::Approve, short_id).encode()?;
    let reject = CallbackData::new(prefix, CallbackVerb::Reject, short_id).encode()?;
    Ok(json!({
        "inline_keyboard": [[
            { "text": "Approve", "callback_data": approve },
            { "text": "Reject", "callback_data": reject },
        ]]
    }))
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }

        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
