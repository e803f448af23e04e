//! Chat transport interface consumed by the activation core.
//!
//! The Telegram implementation lives in [`crate::bot::transport`]; tests use
//! recording fakes.

use crate::activation::{BotIdentity, ChatId, MessageId};
use anyhow::Result;
use async_trait::async_trait;

/// One button of the bot selection keyboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionOption {
    /// Button label
    pub label: String,
    /// Callback payload sent back when pressed
    pub payload: String,
}

/// Outbound chat operations and role lookups for one bot instance
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Identity of the bot this transport speaks as
    fn identity(&self) -> &BotIdentity;

    /// Send a plain message and return its id
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId>;

    /// Send a message with one callback button per option
    async fn send_selection(
        &self,
        chat: ChatId,
        text: &str,
        options: &[SelectionOption],
    ) -> Result<MessageId>;

    /// Delete a message
    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()>;

    /// Whether `user_id` is an administrator of `chat`
    async fn is_admin(&self, chat: ChatId, user_id: i64) -> Result<bool>;

    /// Whether this bot is an administrator of `chat`
    async fn bot_is_admin(&self, chat: ChatId) -> Result<bool>;
}
