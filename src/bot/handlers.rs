//! Telegram update handlers
//!
//! Converts teloxide updates into [`InboundEvent`]s and hands them to the
//! bot's [`Coordinator`] (or to the whole [`Fleet`] for callbacks).

use crate::activation::{
    ChatKind, CommandKind, Coordinator, EventMeta, Fleet, InboundEvent, Principal,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, Chat, User};
use teloxide::utils::command::BotCommands;
use tracing::debug;

/// Supported bot commands
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Activation commands:")]
pub enum Command {
    /// Start activating an agent, optionally naming the activation id
    #[command(description = "start activating an agent in this group.")]
    Activate(String),
    /// Abort the sender's activation attempt
    #[command(description = "abort the activation you started.")]
    Cancel,
    /// Stop the active agent
    #[command(description = "stop the active agent.")]
    Deactivate,
    /// Show the current activation
    #[command(description = "show the current activation.")]
    Status,
    /// Show the command list
    #[command(description = "show this text.")]
    Help,
}

impl From<Command> for CommandKind {
    fn from(command: Command) -> Self {
        match command {
            Command::Activate(arg) => {
                let arg = arg.trim();
                Self::Activate {
                    target: (!arg.is_empty()).then(|| arg.to_string()),
                }
            }
            Command::Cancel => Self::Cancel,
            Command::Deactivate => Self::Deactivate,
            Command::Status => Self::Status,
            Command::Help => Self::Help,
        }
    }
}

/// Principal for a Telegram user
#[must_use]
pub fn principal(user: &User) -> Option<Principal> {
    let user_id = i64::try_from(user.id.0).ok()?;
    Some(Principal {
        user_id,
        username: user.username.clone(),
    })
}

fn chat_kind(chat: &Chat) -> ChatKind {
    if chat.is_private() {
        ChatKind::Private
    } else {
        ChatKind::Group
    }
}

/// Event origin of a message, `None` for anonymous senders
#[must_use]
pub fn message_meta(msg: &Message) -> Option<EventMeta> {
    let sender = principal(msg.from.as_ref()?)?;
    Some(EventMeta {
        chat: msg.chat.id.0,
        chat_kind: chat_kind(&msg.chat),
        sender,
        sent_at: msg.date,
    })
}

/// Event origin of a callback query.
///
/// The keyboard message's date stands in for the event time; a keyboard
/// Telegram no longer lets us read is treated as arbitrarily old.
#[must_use]
pub fn callback_meta(q: &CallbackQuery) -> Option<EventMeta> {
    let message = q.message.as_ref()?;
    let sent_at = message
        .regular_message()
        .map_or(DateTime::<Utc>::MIN_UTC, |m| m.date);
    Some(EventMeta {
        chat: message.chat().id.0,
        chat_kind: chat_kind(message.chat()),
        sender: principal(&q.from)?,
        sent_at,
    })
}

/// Whether a text message is free text rather than a command
fn is_plain_text(msg: &Message) -> bool {
    msg.text().is_some_and(|text| !text.starts_with('/'))
}

/// Build the update handler tree
#[must_use]
pub fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handle_callback))
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(dptree::filter(|msg: Message| is_plain_text(&msg)).endpoint(handle_text)),
        )
}

async fn handle_command(
    msg: Message,
    cmd: Command,
    coordinator: Arc<Coordinator>,
) -> Result<(), teloxide::RequestError> {
    let Some(meta) = message_meta(&msg) else {
        return respond(());
    };
    let outcome = coordinator
        .dispatch(InboundEvent::Command {
            meta,
            command: cmd.into(),
        })
        .await;
    debug!(chat = msg.chat.id.0, ?outcome, "Command dispatched");
    respond(())
}

async fn handle_text(
    msg: Message,
    coordinator: Arc<Coordinator>,
) -> Result<(), teloxide::RequestError> {
    let (Some(meta), Some(text)) = (message_meta(&msg), msg.text()) else {
        return respond(());
    };
    let outcome = coordinator
        .dispatch(InboundEvent::Text {
            meta,
            text: text.to_string(),
        })
        .await;
    debug!(chat = msg.chat.id.0, ?outcome, "Message dispatched");
    respond(())
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    fleet: Arc<Fleet>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
        debug!(error = %e, "Failed to answer callback query");
    }
    let (Some(meta), Some(payload)) = (callback_meta(&q), q.data.clone()) else {
        return respond(());
    };
    let outcomes = fleet
        .fan_out(&InboundEvent::Callback { meta, payload })
        .await;
    debug!(?outcomes, "Callback fanned out");
    respond(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_argument_becomes_target() {
        assert_eq!(
            CommandKind::from(Command::Activate(" act-1 ".to_string())),
            CommandKind::Activate {
                target: Some("act-1".to_string())
            }
        );
        assert_eq!(
            CommandKind::from(Command::Activate(String::new())),
            CommandKind::Activate { target: None }
        );
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(
            Command::parse("/activate", "helper_bot").ok(),
            Some(Command::Activate(String::new()))
        );
        assert_eq!(
            Command::parse("/status@helper_bot", "helper_bot").ok(),
            Some(Command::Status)
        );
        assert!(Command::parse("/status@other_bot", "helper_bot").is_err());
    }
}
