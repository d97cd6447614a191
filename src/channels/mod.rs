//! Outbound notifications about task progress.
//!
//! [`Notifier`] is the channel contract. [`NotifySink`] wraps one so the
//! orchestrator never waits on delivery: every send runs on its own task
//! and failures are only logged.

pub mod callback;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, warn};

use crate::error::ChannelError;
use crate::tasks::Task;

pub use telegram::TelegramNotifier;

/// Upper bound on waiting for a topic to be created.
const TOPIC_TIMEOUT: Duration = Duration::from_secs(10);

/// A chat channel that can host one topic (thread) per task.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name for logs.
    fn name(&self) -> &str;

    /// Post `text` to a topic, or to the main chat when `thread_id` is `None`.
    async fn send_to_topic(&self, thread_id: Option<&str>, text: &str) -> Result<(), ChannelError>;

    /// Open a topic for `task`. `None` when the channel has no topics.
    async fn create_topic_for_task(&self, task: &Task) -> Result<Option<String>, ChannelError>;
}

/// Fire-and-forget front for a [`Notifier`].
#[derive(Clone)]
pub struct NotifySink {
    notifier: Arc<dyn Notifier>,
}

impl NotifySink {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Send in the background. The handle is only useful to tests.
    pub fn notify(&self, thread_id: Option<String>, text: impl Into<String>) -> JoinHandle<()> {
        let notifier = Arc::clone(&self.notifier);
        let text = text.into();
        tokio::spawn(
            async move {
                if let Err(e) = notifier.send_to_topic(thread_id.as_deref(), &text).await {
                    warn!(
                        channel = notifier.name(),
                        thread_id = ?thread_id,
                        error = %e,
                        "Notification failed"
                    );
                }
            }
            .in_current_span(),
        )
    }

    /// Create a topic for `task`, giving up quietly on error or timeout.
    pub async fn create_topic(&self, task: &Task) -> Option<String> {
        match tokio::time::timeout(TOPIC_TIMEOUT, self.notifier.create_topic_for_task(task)).await
        {
            Ok(Ok(thread_id)) => thread_id,
            Ok(Err(e)) => {
                warn!(task_id = %task.id, error = %e, "Failed to create task topic");
                None
            }
            Err(_) => {
                warn!(task_id = %task.id, "Timed out creating task topic");
                None
            }
        }
    }
}

/// Notifier that only writes to the log. Used when no chat is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_to_topic(&self, thread_id: Option<&str>, text: &str) -> Result<(), ChannelError> {
        info!(thread_id = ?thread_id, "{text}");
        Ok(())
    }

    async fn create_topic_for_task(&self, _task: &Task) -> Result<Option<String>, ChannelError> {
        Ok(None)
    }
}
