use std::sync::Mutex;

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::warn;

/// One-way operator notifications. No acknowledgement semantics; a
/// failed delivery is logged and forgotten.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, message: &str);
}

/// Sends through the operator bot.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token.into()),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, chat_id: i64, message: &str) {
        if let Err(e) = self
            .bot
            .send_message(ChatId(chat_id), message.to_string())
            .await
        {
            warn!(chat_id, error = %e, "failed to deliver notification");
        }
    }
}

/// Used when no bot token is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _chat_id: i64, _message: &str) {}
}

/// Captures notifications for assertions in tests.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(i64, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(i64, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn containing(&self, needle: &str) -> usize {
        self.messages()
            .iter()
            .filter(|(_, m)| m.contains(needle))
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, chat_id: i64, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((chat_id, message.to_string()));
    }
}
