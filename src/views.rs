//! Activation UI texts
//!
//! Every user-facing string of the activation flow. Texts are sent with HTML
//! parse mode, so user-controlled parts are escaped here.

use crate::activation::{Activation, ActivationError, BotIdentity, Conflict, Principal};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Trait for activation view rendering
pub trait ActivationView {
    /// Reply to activation requests outside a group
    fn private_chat_rejected() -> &'static str;

    /// Command overview
    fn help() -> &'static str;

    /// Prompt shown above the bot selection keyboard
    fn select_bot_prompt(requester: &Principal) -> String;

    /// Prompt asking the requester for the verification code
    fn enter_code_prompt(requester: &Principal, bot: &BotIdentity) -> String;

    /// Confirmation after a successful redemption
    fn activated(activation: &Activation) -> String;

    /// Notice that the pairing's window has ended
    fn expired() -> &'static str;

    /// Notice that an outstanding attempt timed out
    fn attempt_timed_out() -> &'static str;

    /// Notice that an attempt was cancelled
    fn attempt_cancelled() -> &'static str;

    /// No attempt to cancel
    fn nothing_to_cancel() -> &'static str;

    /// Pairing stopped by an administrator
    fn stopped(by: &Principal) -> String;

    /// No active pairing for this bot here
    fn not_active() -> &'static str;

    /// Status line for an active pairing
    fn status(activation: &Activation, now: DateTime<Utc>) -> String;

    /// The completion service is throttling us
    fn busy(wait: Option<u64>) -> String;

    /// Text for a rejected request
    fn rejection(error: &ActivationError) -> String;
}

/// Default English view
pub struct DefaultActivationView;

fn escape(text: &str) -> String {
    html_escape::encode_text(text).to_string()
}

fn format_remaining(activation: &Activation, now: DateTime<Utc>) -> String {
    match activation.remaining(now) {
        None => "no time limit".to_string(),
        Some(left) if left.num_seconds() <= 0 => "window has ended".to_string(),
        Some(left) => {
            let hours = left.num_hours();
            let minutes = left.num_minutes() % 60;
            format!("{hours}h {minutes}m left")
        }
    }
}

impl ActivationView for DefaultActivationView {
    fn private_chat_rejected() -> &'static str {
        "ℹ️ Activation works in groups only. Add me to a group, make me an administrator and send /activate there."
    }

    fn help() -> &'static str {
        "<b>Activation commands</b>\n\
         /activate - start activating an agent in this group (administrators)\n\
         /cancel - abort the activation you started\n\
         /status - show the current activation\n\
         /deactivate - stop the active agent (administrators)"
    }

    fn select_bot_prompt(requester: &Principal) -> String {
        format!(
            "🤖 {}, choose the bot that should host the agent:",
            escape(&requester.display())
        )
    }

    fn enter_code_prompt(requester: &Principal, bot: &BotIdentity) -> String {
        format!(
            "🔑 {} selected {}. Send the verification code in this chat.",
            escape(&requester.display()),
            escape(&bot.to_string())
        )
    }

    fn activated(activation: &Activation) -> String {
        let until = activation.activation_end.map_or_else(
            || "without a time limit".to_string(),
            |end| format!("until {}", end.format("%Y-%m-%d %H:%M UTC")),
        );
        format!("✅ Agent activated in this group {until}.")
    }

    fn expired() -> &'static str {
        "⌛️ The activation period has ended. An administrator can start a new one with /activate."
    }

    fn attempt_timed_out() -> &'static str {
        "⌛️ Activation timed out. Send /activate to try again."
    }

    fn attempt_cancelled() -> &'static str {
        "🚫 Activation cancelled."
    }

    fn nothing_to_cancel() -> &'static str {
        "There is no activation of yours to cancel."
    }

    fn stopped(by: &Principal) -> String {
        format!("⏹ Agent stopped by {}.", escape(&by.display()))
    }

    fn not_active() -> &'static str {
        "No agent is active in this group."
    }

    fn status(activation: &Activation, now: DateTime<Utc>) -> String {
        format!(
            "🟢 Agent <code>{}</code> is active ({}).",
            escape(&activation.agent_id),
            format_remaining(activation, now)
        )
    }

    fn busy(wait: Option<u64>) -> String {
        wait.map_or_else(
            || "⏳ I'm a bit overloaded, try again shortly.".to_string(),
            |secs| format!("⏳ I'm a bit overloaded, try again in {secs}s."),
        )
    }

    fn rejection(error: &ActivationError) -> String {
        match error {
            ActivationError::Validation(reason) => format!("⚠️ {}", escape(reason)),
            ActivationError::AuthorizationDenied(reason) => format!("⛔️ {}", escape(reason)),
            ActivationError::StateConflict(conflict) => match conflict {
                Conflict::AlreadyActive => {
                    "ℹ️ An agent is already activated in this group.".to_string()
                }
                Conflict::AlreadyInProgress => {
                    "⏳ An activation is already in progress here.".to_string()
                }
                Conflict::CodeAlreadyUsed => "⛔️ This code has already been used.".to_string(),
                Conflict::BotMismatch { expected } => format!(
                    "⛔️ This activation belongs to {}.",
                    escape(&expected.to_string())
                ),
                Conflict::NoPendingAttempt => {
                    "ℹ️ No activation is waiting here. Send /activate first.".to_string()
                }
            },
            ActivationError::RateLimited { wait } => format!(
                "⏳ Too many activation attempts. Try again in {}.",
                format_wait(*wait)
            ),
            ActivationError::Dependency(_) => {
                "❌ Something went wrong, please try again later.".to_string()
            }
        }
    }
}

fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs().max(1);
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_rejection_hides_dependency_details() {
        let text = DefaultActivationView::rejection(&ActivationError::Dependency(
            "s3://secret-bucket unreachable".to_string(),
        ));
        assert!(!text.contains("secret-bucket"));
    }

    #[test]
    fn test_rate_limit_names_wait() {
        let text = DefaultActivationView::rejection(&ActivationError::RateLimited {
            wait: Duration::from_secs(290),
        });
        assert!(text.contains("4m 50s"), "unexpected text: {text}");
    }

    #[test]
    fn test_user_text_is_escaped() {
        let text = DefaultActivationView::rejection(&ActivationError::AuthorizationDenied(
            "<b>bad</b>".to_string(),
        ));
        assert!(text.contains("&lt;b&gt;"));
    }

    #[test]
    fn test_status_formats_remaining() {
        let now = Utc::now();
        let mut row = Activation::pending("agent-7", "C", "@a", Some(3));
        row.activation_end = Some(now + ChronoDuration::minutes(90));
        let text = DefaultActivationView::status(&row, now);
        assert!(text.contains("1h 30m left"), "unexpected text: {text}");

        row.activation_end = None;
        assert!(DefaultActivationView::status(&row, now).contains("no time limit"));
    }
}
