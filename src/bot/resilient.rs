//! Telegram API calls with automatic retry.
//!
//! Thin wrappers over teloxide requests that go through
//! [`crate::utils::retry_telegram_operation`], so transient network failures
//! are retried with exponential backoff and jitter.

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, ChatMember, InlineKeyboardMarkup, Message, MessageId, ParseMode, UserId,
};
use tracing::debug;

/// Send an HTML message with automatic retry on network failures.
///
/// # Errors
///
/// Returns the last error after all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot
            .send_message(chat_id, text.clone())
            .parse_mode(ParseMode::Html);
        if let Some(markup) = &markup {
            req = req.reply_markup(markup.clone());
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Delete a message, retrying transient failures.
///
/// # Errors
///
/// Returns an error if the message is gone or cannot be deleted.
pub async fn delete_message_resilient(bot: &Bot, chat_id: ChatId, msg_id: MessageId) -> Result<()> {
    crate::utils::retry_telegram_operation(|| async {
        bot.delete_message(chat_id, msg_id)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Telegram delete error: {e}"))
    })
    .await
    .inspect_err(|e| debug!(chat = chat_id.0, message = msg_id.0, error = %e, "Delete failed"))
}

/// Look up a chat member, retrying transient failures.
///
/// # Errors
///
/// Returns the last error after all retries are exhausted.
pub async fn get_chat_member_resilient(
    bot: &Bot,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<ChatMember> {
    crate::utils::retry_telegram_operation(|| async {
        bot.get_chat_member(chat_id, user_id)
            .await
            .map_err(|e| anyhow::anyhow!("Telegram getChatMember error: {e}"))
    })
    .await
}
