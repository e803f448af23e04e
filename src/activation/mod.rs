//! Activation domain
//!
//! Types shared by the activation state machine and its safeguards: the
//! durable `Activation` row, bot and principal identities, and the error
//! taxonomy every handler maps to a user-facing reply.

pub mod dispatch;
pub mod expiry;
pub mod lifecycle;
pub mod notice_throttle;
pub mod rate_limit;
pub mod redeem;
pub mod runtime_state;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use dispatch::{
    ChatKind, CommandKind, Coordinator, DispatchOutcome, EventMeta, Fleet, InboundEvent,
};
pub use lifecycle::{
    ActivationHook, ActivationLifecycle, ConversationResponder, LifecycleDeps, ReplyError,
};
pub use notice_throttle::NoticeThrottle;
pub use runtime_state::{RuntimeKey, RuntimeStateStore};

/// Telegram chat identifier (groups are negative)
pub type ChatId = i64;
/// Telegram message identifier
pub type MessageId = i32;

/// Username of a bot instance, stored without the leading `@` and lowercased
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotIdentity(String);

impl BotIdentity {
    /// Normalize a raw username (`@My_Bot` and `my_bot` are the same bot)
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().trim_start_matches('@').to_lowercase())
    }

    /// Normalized identity string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A chat user as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Numeric platform id
    pub user_id: i64,
    /// Public handle, if the user has one
    pub username: Option<String>,
}

impl Principal {
    /// Handle used when addressing the user in replies
    #[must_use]
    pub fn display(&self) -> String {
        self.username
            .as_ref()
            .map_or_else(|| self.user_id.to_string(), |u| format!("@{u}"))
    }

    /// Whether this user is the principal an activation was issued to.
    ///
    /// Handles compare case-insensitively with the `@` stripped; a numeric
    /// authorized principal also matches the user id.
    #[must_use]
    pub fn matches(&self, authorized: &str) -> bool {
        let authorized = normalize_principal(authorized);
        if authorized.is_empty() {
            return false;
        }
        if authorized == self.user_id.to_string() {
            return true;
        }
        self.username
            .as_deref()
            .is_some_and(|u| normalize_principal(u) == authorized)
    }
}

/// Canonical form of a principal handle
#[must_use]
pub fn normalize_principal(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

/// Lifecycle status of a durable activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    /// Issued, code not yet redeemed
    Pending,
    /// Bound to a group and conversing
    Active,
    /// Window elapsed
    Expired,
    /// Stopped by an administrator
    Stopped,
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Durable activation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    /// Row id
    pub id: String,
    /// Agent whose persona is activated
    pub agent_id: String,
    /// Single-use verification code
    pub verification_code: String,
    /// Principal allowed to redeem the code
    pub authorized_principal: String,
    /// Group the activation is bound to
    pub group_id: Option<ChatId>,
    /// Bot instance chosen for the group
    pub selected_bot: Option<BotIdentity>,
    /// Current status
    pub status: ActivationStatus,
    /// Start of the active window
    pub activation_start: Option<DateTime<Utc>>,
    /// End of the active window; `None` means indefinite
    pub activation_end: Option<DateTime<Utc>>,
    /// Length of the window in hours; `None` means indefinite
    pub duration_hours: Option<u32>,
    /// When the verification code was consumed
    pub code_used_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Activation {
    /// New pending activation issued to `principal`
    #[must_use]
    pub fn pending(
        agent_id: impl Into<String>,
        code: impl Into<String>,
        principal: impl Into<String>,
        duration_hours: Option<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            verification_code: code.into(),
            authorized_principal: principal.into(),
            group_id: None,
            selected_bot: None,
            status: ActivationStatus::Pending,
            activation_start: None,
            activation_end: None,
            duration_hours,
            code_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Remaining time of an active window, `None` when indefinite
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        self.activation_end.map(|end| end - now)
    }
}

/// End of a window that starts at `start` and lasts `duration_hours`
#[must_use]
pub fn window_end(start: DateTime<Utc>, duration_hours: Option<u32>) -> Option<DateTime<Utc>> {
    duration_hours.map(|h| start + ChronoDuration::hours(i64::from(h)))
}

/// Field changes applied together with a status transition
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActivationPatch {
    /// New status
    pub status: Option<ActivationStatus>,
    /// Group binding
    pub group_id: Option<ChatId>,
    /// Confirmed bot identity
    pub selected_bot: Option<BotIdentity>,
    /// Window start
    pub activation_start: Option<DateTime<Utc>>,
    /// Window end (outer `Some` means "set")
    pub activation_end: Option<Option<DateTime<Utc>>>,
    /// Code consumption time
    pub code_used_at: Option<DateTime<Utc>>,
}

impl ActivationPatch {
    /// Patch for a successful redemption
    #[must_use]
    pub fn activate(
        group_id: ChatId,
        bot: BotIdentity,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            status: Some(ActivationStatus::Active),
            group_id: Some(group_id),
            selected_bot: Some(bot),
            activation_start: Some(start),
            activation_end: Some(end),
            code_used_at: Some(start),
        }
    }

    /// Patch moving an active row to a terminal status
    #[must_use]
    pub fn close(status: ActivationStatus, at: Option<DateTime<Utc>>) -> Self {
        Self {
            status: Some(status),
            activation_end: at.map(Some),
            ..Self::default()
        }
    }

    /// Apply the patch to a row, bumping `updated_at`
    pub fn apply(&self, row: &mut Activation, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(group) = self.group_id {
            row.group_id = Some(group);
        }
        if let Some(bot) = &self.selected_bot {
            row.selected_bot = Some(bot.clone());
        }
        if let Some(start) = self.activation_start {
            row.activation_start = Some(start);
        }
        if let Some(end) = self.activation_end {
            row.activation_end = end;
        }
        if let Some(used) = self.code_used_at {
            row.code_used_at = Some(used);
        }
        row.updated_at = now;
    }
}

/// Conflicts with the current activation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// The pairing is already active
    AlreadyActive,
    /// Another attempt is running for this bot and group
    AlreadyInProgress,
    /// The code was consumed or the row left `pending`
    CodeAlreadyUsed,
    /// The activation names a different bot
    BotMismatch {
        /// Bot the activation was issued for
        expected: BotIdentity,
    },
    /// No attempt is outstanding for this chat
    NoPendingAttempt,
}

/// Errors surfaced by activation handlers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivationError {
    /// Malformed input; no state change
    #[error("validation failed: {0}")]
    Validation(String),
    /// Missing role, or principal mismatch on redemption
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
    /// Conflicts with current state; never retried
    #[error("state conflict: {0:?}")]
    StateConflict(Conflict),
    /// Too many attempts
    #[error("rate limited, retry in {}s", wait.as_secs())]
    RateLimited {
        /// Time until the next attempt is allowed
        wait: Duration,
    },
    /// Store or transport call failed
    #[error("dependency failure: {0}")]
    Dependency(String),
}

impl ActivationError {
    /// Whether the error must tear down the in-flight attempt
    #[must_use]
    pub const fn requires_cleanup(&self) -> bool {
        matches!(
            self,
            Self::AuthorizationDenied(_) | Self::StateConflict(_) | Self::Dependency(_)
        )
    }
}

impl From<crate::storage::StorageError> for ActivationError {
    fn from(e: crate::storage::StorageError) -> Self {
        Self::Dependency(e.to_string())
    }
}
