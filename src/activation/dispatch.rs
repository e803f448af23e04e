//! Inbound event routing
//!
//! Applies the start-time fence, the group-only rule and the bot identity
//! fence before handing events to the lifecycle. Callback queries reach only
//! the bot that sent the keyboard, so a [`Fleet`] fans them out to every
//! instance in the process.

use super::lifecycle::ActivationLifecycle;
use super::notice_throttle::NoticeThrottle;
use super::{BotIdentity, ChatId, Principal};
use crate::views::{ActivationView, DefaultActivationView};
use chrono::{DateTime, SubsecRound, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SELECT_PREFIX: &str = "select_bot:";

/// Kind of chat an event originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    /// One-to-one chat with the bot
    Private,
    /// Group or supergroup
    Group,
}

/// Fields shared by every inbound event
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// Originating chat
    pub chat: ChatId,
    /// Kind of that chat
    pub chat_kind: ChatKind,
    /// Sending user
    pub sender: Principal,
    /// Platform timestamp of the event
    pub sent_at: DateTime<Utc>,
}

/// Commands understood by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Start an activation, optionally naming the activation id
    Activate {
        /// Activation the requester intends to redeem
        target: Option<String>,
    },
    /// Abort the sender's attempt
    Cancel,
    /// Stop the active pairing
    Deactivate,
    /// Report the current pairing
    Status,
    /// List commands
    Help,
}

/// Transport-neutral inbound event
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A command message
    Command {
        /// Event origin
        meta: EventMeta,
        /// Parsed command
        command: CommandKind,
    },
    /// A keyboard button press
    Callback {
        /// Event origin
        meta: EventMeta,
        /// Raw callback payload
        payload: String,
    },
    /// A plain text message
    Text {
        /// Event origin
        meta: EventMeta,
        /// Message text
        text: String,
    },
}

impl InboundEvent {
    /// Origin of the event
    #[must_use]
    pub const fn meta(&self) -> &EventMeta {
        match self {
            Self::Command { meta, .. } | Self::Callback { meta, .. } | Self::Text { meta, .. } => {
                meta
            }
        }
    }
}

/// Parsed `select_bot` callback payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Activation pre-targeted by the keyboard
    pub activation_id: Option<String>,
    /// Bot the button stands for
    pub bot: BotIdentity,
}

/// Encode a selection button payload
#[must_use]
pub fn selection_payload(activation_id: Option<&str>, bot: &BotIdentity) -> String {
    match activation_id {
        Some(id) => format!("{SELECT_PREFIX}{id}:{}", bot.as_str()),
        None => format!("{SELECT_PREFIX}{}", bot.as_str()),
    }
}

/// Parse `select_bot:<bot>` or `select_bot:<activation id>:<bot>`
#[must_use]
pub fn parse_selection(payload: &str) -> Option<Selection> {
    let rest = payload.strip_prefix(SELECT_PREFIX)?;
    let (activation_id, bot) = match rest.rsplit_once(':') {
        Some((id, bot)) if !id.is_empty() => (Some(id.to_string()), bot),
        Some(_) => return None,
        None => (None, rest),
    };
    let bot = BotIdentity::new(bot);
    if bot.as_str().is_empty() {
        return None;
    }
    Some(Selection { activation_id, bot })
}

/// Whether an event predates the coordinator's start.
///
/// Platform timestamps have whole-second resolution, so the fence is
/// truncated to the second.
#[must_use]
pub fn is_stale(sent_at: DateTime<Utc>, started_at: DateTime<Utc>) -> bool {
    sent_at < started_at.trunc_subsecs(0)
}

/// What the coordinator did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Dropped by the start-time fence
    Stale,
    /// Not for this instance, or nothing to do
    Ignored,
    /// Routed to the lifecycle
    Handled,
}

/// Event router of one bot instance
pub struct Coordinator {
    lifecycle: ActivationLifecycle,
    started_at: DateTime<Utc>,
    notices: NoticeThrottle,
}

impl Coordinator {
    /// Route events to `lifecycle`, dropping anything sent before `started_at`
    #[must_use]
    pub const fn new(
        lifecycle: ActivationLifecycle,
        started_at: DateTime<Utc>,
        notices: NoticeThrottle,
    ) -> Self {
        Self {
            lifecycle,
            started_at,
            notices,
        }
    }

    /// Lifecycle behind this coordinator
    #[must_use]
    pub const fn lifecycle(&self) -> &ActivationLifecycle {
        &self.lifecycle
    }

    /// Route one inbound event
    pub async fn dispatch(&self, event: InboundEvent) -> DispatchOutcome {
        let meta = event.meta();
        if is_stale(meta.sent_at, self.started_at) {
            debug!(
                bot = %self.lifecycle.identity(),
                chat = meta.chat,
                sent_at = %meta.sent_at,
                "Dropping event sent before startup"
            );
            return DispatchOutcome::Stale;
        }

        match event {
            InboundEvent::Command { meta, command } => self.on_command(&meta, command).await,
            InboundEvent::Callback { meta, payload } => self.on_callback(&meta, &payload).await,
            InboundEvent::Text { meta, text } => self.on_text(&meta, &text).await,
        }
    }

    async fn on_command(&self, meta: &EventMeta, command: CommandKind) -> DispatchOutcome {
        let chat = meta.chat;
        if command == CommandKind::Help {
            self.lifecycle
                .send(chat, DefaultActivationView::help())
                .await;
            return DispatchOutcome::Handled;
        }
        if meta.chat_kind == ChatKind::Private {
            if !self.notices.should_send(meta.sender.user_id).await {
                return DispatchOutcome::Ignored;
            }
            self.lifecycle
                .send(chat, DefaultActivationView::private_chat_rejected())
                .await;
            return DispatchOutcome::Handled;
        }

        let sender = &meta.sender;
        let result = match command {
            CommandKind::Activate { target } => {
                self.lifecycle
                    .request_activation(chat, sender, target.as_deref())
                    .await
            }
            CommandKind::Cancel => self.lifecycle.cancel(chat, sender).await,
            CommandKind::Deactivate => self.lifecycle.deactivate(chat, sender).await,
            CommandKind::Status => self.lifecycle.status(chat).await.map(|_| ()),
            CommandKind::Help => Ok(()),
        };
        if let Err(e) = result {
            debug!(chat, error = %e, "Command rejected");
        }
        DispatchOutcome::Handled
    }

    async fn on_callback(&self, meta: &EventMeta, payload: &str) -> DispatchOutcome {
        if meta.chat_kind == ChatKind::Private {
            return DispatchOutcome::Ignored;
        }
        let Some(selection) = parse_selection(payload) else {
            debug!(payload, "Unknown callback payload");
            return DispatchOutcome::Ignored;
        };
        if &selection.bot != self.lifecycle.identity() {
            return DispatchOutcome::Ignored;
        }

        if let Err(e) = self
            .lifecycle
            .select_bot(meta.chat, &meta.sender, &selection)
            .await
        {
            debug!(chat = meta.chat, error = %e, "Selection rejected");
        }
        DispatchOutcome::Handled
    }

    async fn on_text(&self, meta: &EventMeta, text: &str) -> DispatchOutcome {
        if meta.chat_kind == ChatKind::Private {
            return DispatchOutcome::Ignored;
        }

        let result = match self.lifecycle.awaiting_code_from(meta.chat, &meta.sender).await {
            Some(attempt) => self
                .lifecycle
                .submit_code(&attempt, &meta.sender, text)
                .await
                .map(|_| ()),
            None => self.lifecycle.converse(meta.chat, &meta.sender, text).await,
        };
        if let Err(e) = result {
            debug!(chat = meta.chat, error = %e, "Message handling failed");
        }
        DispatchOutcome::Handled
    }
}

/// Every bot instance hosted by this process
pub struct Fleet {
    members: Vec<Arc<Coordinator>>,
}

impl Fleet {
    /// Group coordinators sharing one runtime store
    #[must_use]
    pub const fn new(members: Vec<Arc<Coordinator>>) -> Self {
        Self { members }
    }

    /// Member coordinators
    #[must_use]
    pub fn members(&self) -> &[Arc<Coordinator>] {
        &self.members
    }

    /// Deliver `event` to every member; each applies its own identity fence
    pub async fn fan_out(&self, event: &InboundEvent) -> Vec<DispatchOutcome> {
        join_all(
            self.members
                .iter()
                .map(|member| member.dispatch(event.clone())),
        )
        .await
    }

    /// Cancel timers and drain tracked tasks shared by the fleet
    pub async fn shutdown(&self, grace: Duration) -> bool {
        match self.members.first() {
            Some(member) => member.lifecycle().shutdown(grace).await,
            None => true,
        }
    }
}
