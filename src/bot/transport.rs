//! Telegram implementation of [`ChatTransport`]

use super::resilient::{
    delete_message_resilient, get_chat_member_resilient, send_message_resilient,
};
use crate::activation::{BotIdentity, ChatId, MessageId};
use crate::transport::{ChatTransport, SelectionOption};
use crate::utils::{retry_telegram_operation, truncate_str, TELEGRAM_MESSAGE_LIMIT};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId as TgChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId as TgMessageId,
    UserId,
};
use tracing::info;

/// One bot token's view of Telegram
pub struct TelegramTransport {
    bot: Bot,
    identity: BotIdentity,
    user_id: UserId,
}

impl TelegramTransport {
    /// Resolve the bot's own identity with `getMe`.
    ///
    /// # Errors
    ///
    /// Returns an error if Telegram cannot be reached or rejects the token.
    pub async fn connect(bot: Bot) -> Result<Self> {
        let me = retry_telegram_operation(|| async {
            bot.get_me()
                .await
                .map_err(|e| anyhow!("Telegram getMe error: {e}"))
        })
        .await?;
        let identity = BotIdentity::new(me.username());
        info!(bot = %identity, "Telegram bot connected");
        Ok(Self {
            identity,
            user_id: me.user.id,
            bot,
        })
    }

    /// Underlying teloxide bot
    #[must_use]
    pub const fn bot(&self) -> &Bot {
        &self.bot
    }
}

fn selection_markup(options: &[SelectionOption]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(options.iter().map(|option| {
        vec![InlineKeyboardButton::callback(
            option.label.clone(),
            option.payload.clone(),
        )]
    }))
}

fn to_user_id(user_id: i64) -> Result<UserId> {
    u64::try_from(user_id)
        .map(UserId)
        .with_context(|| format!("invalid Telegram user id {user_id}"))
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId> {
        let text = truncate_str(text, TELEGRAM_MESSAGE_LIMIT);
        let message = send_message_resilient(&self.bot, TgChatId(chat), text, None).await?;
        Ok(message.id.0)
    }

    async fn send_selection(
        &self,
        chat: ChatId,
        text: &str,
        options: &[SelectionOption],
    ) -> Result<MessageId> {
        let markup = selection_markup(options);
        let message =
            send_message_resilient(&self.bot, TgChatId(chat), text, Some(markup)).await?;
        Ok(message.id.0)
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
        delete_message_resilient(&self.bot, TgChatId(chat), TgMessageId(message)).await
    }

    async fn is_admin(&self, chat: ChatId, user_id: i64) -> Result<bool> {
        let member = get_chat_member_resilient(&self.bot, TgChatId(chat), to_user_id(user_id)?)
            .await?;
        Ok(member.kind.is_privileged())
    }

    async fn bot_is_admin(&self, chat: ChatId) -> Result<bool> {
        let member = get_chat_member_resilient(&self.bot, TgChatId(chat), self.user_id).await?;
        Ok(member.kind.is_privileged())
    }
}
