//! Activation lifecycle
//!
//! Drives one bot instance through `requested → awaiting-selection →
//! awaiting-code → active` and owns every transition out of `active`.
//! Instances of a fleet share the runtime store, the durable store, the
//! task tracker and the shutdown token.

use super::dispatch::{selection_payload, Selection};
use super::expiry::{expire_if_due, ExpiryOutcome};
use super::rate_limit::{RateDecision, RateLimiter};
use super::redeem::{RedeemError, VerificationRedeemer};
use super::runtime_state::{PendingAttempt, PendingStage};
use super::{
    window_end, Activation, ActivationError, ActivationPatch, ActivationStatus, BotIdentity,
    ChatId, Conflict, MessageId, Principal, RuntimeKey, RuntimeStateStore,
};
use crate::config::{LifecycleTiming, RateLimitSettings};
use crate::storage::ActivationStore;
use crate::transport::{ChatTransport, SelectionOption};
use crate::views::{ActivationView, DefaultActivationView};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Side effect run after a successful activation.
///
/// Invoked as a tracked background task; its outcome is only logged and
/// never changes the activation status.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivationHook: Send + Sync {
    /// Called once per activation that reached `active`
    async fn on_activated(&self, activation: &Activation) -> anyhow::Result<()>;
}

/// Failure of a conversational reply
#[derive(Debug, Error)]
pub enum ReplyError {
    /// The completion service asked us to back off
    #[error("completion service busy (wait: {wait_secs:?}s)")]
    Busy {
        /// Server-provided wait, if any
        wait_secs: Option<u64>,
    },
    /// Any other failure
    #[error("reply failed: {0}")]
    Failed(String),
}

/// Produces the agent's answer to a group message
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationResponder: Send + Sync {
    /// Answer `text` sent by `author` to the agent of `activation`
    async fn reply(
        &self,
        activation: &Activation,
        author: &Principal,
        text: &str,
    ) -> Result<String, ReplyError>;
}

/// Everything a lifecycle instance needs
pub struct LifecycleDeps {
    /// Durable activation store
    pub store: Arc<dyn ActivationStore>,
    /// Process-wide runtime state
    pub runtime: Arc<RuntimeStateStore>,
    /// Transport of this bot instance
    pub transport: Arc<dyn ChatTransport>,
    /// Post-activation side effect
    pub hook: Arc<dyn ActivationHook>,
    /// Conversational replies
    pub responder: Arc<dyn ConversationResponder>,
    /// Every bot identity offered in the selection keyboard
    pub fleet: Vec<BotIdentity>,
    /// Attempt limits
    pub rate_limits: RateLimitSettings,
    /// Timeouts and timer lengths
    pub timing: LifecycleTiming,
    /// Tracker for timers and hook tasks
    pub tasks: TaskTracker,
    /// Cancelled when the process shuts down
    pub shutdown: CancellationToken,
}

/// Activation coordinator of one bot instance
#[derive(Clone)]
pub struct ActivationLifecycle {
    store: Arc<dyn ActivationStore>,
    runtime: Arc<RuntimeStateStore>,
    transport: Arc<dyn ChatTransport>,
    hook: Arc<dyn ActivationHook>,
    responder: Arc<dyn ConversationResponder>,
    limiter: RateLimiter,
    redeemer: VerificationRedeemer,
    fleet: Arc<[BotIdentity]>,
    timing: LifecycleTiming,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

type View = DefaultActivationView;

impl ActivationLifecycle {
    /// Assemble a lifecycle from its dependencies
    #[must_use]
    pub fn new(deps: LifecycleDeps) -> Self {
        let limiter = RateLimiter::new(deps.runtime.clone(), deps.rate_limits);
        let redeemer = VerificationRedeemer::new(deps.store.clone());
        Self {
            store: deps.store,
            runtime: deps.runtime,
            transport: deps.transport,
            hook: deps.hook,
            responder: deps.responder,
            limiter,
            redeemer,
            fleet: deps.fleet.into(),
            timing: deps.timing,
            tasks: deps.tasks,
            shutdown: deps.shutdown,
        }
    }

    /// Identity of the bot this lifecycle answers as
    #[must_use]
    pub fn identity(&self) -> &BotIdentity {
        self.transport.identity()
    }

    /// Shared runtime state
    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeStateStore> {
        &self.runtime
    }

    fn key(&self, chat: ChatId) -> RuntimeKey {
        RuntimeKey::new(self.identity().clone(), chat)
    }

    /// Handle `/activate` from `requester` in group `chat`.
    ///
    /// `target` optionally names the activation the requester intends to
    /// redeem; it is carried in the selection payload.
    ///
    /// # Errors
    ///
    /// Returns the rejection after it has been reported to the chat and the
    /// attempt's state has been released.
    pub async fn request_activation(
        &self,
        chat: ChatId,
        requester: &Principal,
        target: Option<&str>,
    ) -> Result<(), ActivationError> {
        let key = self.key(chat);
        let result = self.open_attempt(&key, chat, requester, target).await;
        if let Err(e) = &result {
            self.reject(chat, e).await;
        }
        result
    }

    async fn open_attempt(
        &self,
        key: &RuntimeKey,
        chat: ChatId,
        requester: &Principal,
        target: Option<&str>,
    ) -> Result<(), ActivationError> {
        self.ensure_not_active(key, chat).await?;
        if !self.runtime.try_begin(key).await {
            return Err(ActivationError::StateConflict(Conflict::AlreadyInProgress));
        }

        let attempt = PendingAttempt::new(requester.clone(), chat, key.clone());
        let nonce = attempt.nonce;
        if let Err(e) = self.show_selection(attempt, target).await {
            self.release(key, chat, nonce).await;
            return Err(e);
        }
        Ok(())
    }

    async fn show_selection(
        &self,
        attempt: PendingAttempt,
        target: Option<&str>,
    ) -> Result<(), ActivationError> {
        let chat = attempt.chat;
        if let RateDecision::Limited { wait } = self.limiter.check(&attempt.request_key).await {
            return Err(ActivationError::RateLimited { wait });
        }
        self.verify_admins(chat, attempt.principal.user_id).await?;

        let nonce = attempt.nonce;
        let timer = attempt.timer();
        let requester = attempt.principal.clone();
        if !self.runtime.try_insert_pending(attempt).await {
            return Err(ActivationError::StateConflict(Conflict::AlreadyInProgress));
        }
        self.arm_pending_timer(chat, nonce, timer);

        let options: Vec<SelectionOption> = self
            .fleet
            .iter()
            .map(|bot| SelectionOption {
                label: bot.to_string(),
                payload: selection_payload(target, bot),
            })
            .collect();
        let prompt = View::select_bot_prompt(&requester);
        let message = self
            .bounded(self.transport.send_selection(chat, &prompt, &options))
            .await?;
        self.runtime.push_ui_message(chat, message).await;

        info!(
            bot = %self.identity(),
            chat,
            requester = %requester.display(),
            %nonce,
            "Activation requested, awaiting bot selection"
        );
        Ok(())
    }

    /// Fail with `AlreadyActive` if this bot holds a live pairing in `chat`.
    ///
    /// A pairing whose window has passed is expired on the way.
    async fn ensure_not_active(
        &self,
        key: &RuntimeKey,
        chat: ChatId,
    ) -> Result<(), ActivationError> {
        let Some(row) = self
            .bounded(self.store.find_active(chat, self.identity()))
            .await?
        else {
            self.runtime.set_cached_active(key, false).await;
            return Ok(());
        };

        let outcome = self
            .bounded(expire_if_due(self.store.as_ref(), &row, Utc::now()))
            .await?;
        if outcome == ExpiryOutcome::Live {
            self.runtime.set_cached_active(key, true).await;
            return Err(ActivationError::StateConflict(Conflict::AlreadyActive));
        }
        self.runtime.set_cached_active(key, false).await;
        Ok(())
    }

    async fn verify_admins(&self, chat: ChatId, user_id: i64) -> Result<(), ActivationError> {
        let (user_is_admin, bot_is_admin) = tokio::join!(
            self.bounded(self.transport.is_admin(chat, user_id)),
            self.bounded(self.transport.bot_is_admin(chat)),
        );
        if !user_is_admin? {
            return Err(ActivationError::AuthorizationDenied(
                "Only group administrators can activate an agent.".to_string(),
            ));
        }
        if !bot_is_admin? {
            return Err(ActivationError::AuthorizationDenied(format!(
                "{} must be an administrator of this group.",
                self.identity()
            )));
        }
        Ok(())
    }

    /// Handle a bot selection already addressed to this instance.
    ///
    /// # Errors
    ///
    /// Returns the rejection after it has been reported. Failures of the
    /// requester's own attempt abort it; a press by anyone else leaves it
    /// running.
    pub async fn select_bot(
        &self,
        chat: ChatId,
        selector: &Principal,
        selection: &Selection,
    ) -> Result<(), ActivationError> {
        let Some(attempt) = self.runtime.pending(chat).await else {
            let e = ActivationError::StateConflict(Conflict::NoPendingAttempt);
            self.reject(chat, &e).await;
            return Err(e);
        };
        if attempt.principal.user_id != selector.user_id {
            let e = ActivationError::AuthorizationDenied(format!(
                "Only {} can choose the bot for this activation.",
                attempt.principal.display()
            ));
            self.reject(chat, &e).await;
            return Err(e);
        }
        if attempt.stage != PendingStage::AwaitingSelection {
            debug!(chat, nonce = %attempt.nonce, "Duplicate bot selection ignored");
            return Ok(());
        }

        let result = self.confirm_selection(&attempt, selection).await;
        if let Err(e) = &result {
            self.abort_attempt(&attempt).await;
            self.reject(chat, e).await;
        }
        result
    }

    async fn confirm_selection(
        &self,
        attempt: &PendingAttempt,
        selection: &Selection,
    ) -> Result<(), ActivationError> {
        let chat = attempt.chat;
        self.ensure_not_active(&self.key(chat), chat).await?;
        if let Some(id) = &selection.activation_id {
            self.check_target(id).await?;
        }

        let bot = self.identity().clone();
        let activation_id = selection.activation_id.clone();
        let Some(timer) = self
            .runtime
            .update_pending(
                chat,
                attempt.nonce,
                PendingStage::AwaitingSelection,
                |pending| {
                    pending.stage = PendingStage::AwaitingCode;
                    pending.selected_bot = Some(bot);
                    pending.activation_id = activation_id;
                    pending.rearm()
                },
            )
            .await
        else {
            debug!(chat, nonce = %attempt.nonce, "Concurrent bot selection ignored");
            return Ok(());
        };
        self.clear_ui(chat).await;
        self.arm_pending_timer(chat, attempt.nonce, timer);

        let prompt = View::enter_code_prompt(&attempt.principal, self.identity());
        let message = self.bounded(self.transport.send_text(chat, &prompt)).await?;
        self.runtime.push_ui_message(chat, message).await;

        info!(
            bot = %self.identity(),
            chat,
            nonce = %attempt.nonce,
            "Bot selected, awaiting verification code"
        );
        Ok(())
    }

    /// The pre-targeted row must still be pending and may not name another bot
    async fn check_target(&self, activation_id: &str) -> Result<(), ActivationError> {
        let row = self
            .bounded(self.store.get(activation_id))
            .await?
            .ok_or_else(|| ActivationError::Validation("Unknown activation.".to_string()))?;
        if row.status != ActivationStatus::Pending || row.code_used_at.is_some() {
            return Err(ActivationError::StateConflict(Conflict::CodeAlreadyUsed));
        }
        match row.selected_bot {
            Some(expected) if &expected != self.identity() => Err(
                ActivationError::StateConflict(Conflict::BotMismatch { expected }),
            ),
            _ => Ok(()),
        }
    }

    /// Attempt in `chat` waiting for a code from `sender` through this bot
    pub async fn awaiting_code_from(
        &self,
        chat: ChatId,
        sender: &Principal,
    ) -> Option<PendingAttempt> {
        self.runtime.pending(chat).await.filter(|attempt| {
            attempt.stage == PendingStage::AwaitingCode
                && attempt.selected_bot.as_ref() == Some(self.identity())
                && attempt.principal.user_id == sender.user_id
        })
    }

    /// Redeem `text` as the verification code of `attempt`.
    ///
    /// Only one submission per attempt is redeemed; a text arriving while
    /// another is being redeemed is ignored.
    ///
    /// # Errors
    ///
    /// `NoPendingAttempt`, unreported, when the attempt is already being
    /// redeemed or settled. Any other failure is reported and aborts the
    /// attempt.
    pub async fn submit_code(
        &self,
        attempt: &PendingAttempt,
        sender: &Principal,
        text: &str,
    ) -> Result<Activation, ActivationError> {
        let claimed = self
            .runtime
            .update_pending(
                attempt.chat,
                attempt.nonce,
                PendingStage::AwaitingCode,
                |pending| pending.stage = PendingStage::Redeeming,
            )
            .await;
        if claimed.is_none() {
            debug!(
                chat = attempt.chat,
                nonce = %attempt.nonce,
                "Code submission ignored, attempt already settling"
            );
            return Err(ActivationError::StateConflict(Conflict::NoPendingAttempt));
        }

        match self.redeem_and_activate(attempt, sender, text).await {
            Ok(activation) => {
                self.complete_attempt(attempt, &activation).await;
                Ok(activation)
            }
            Err(e) => {
                self.abort_attempt(attempt).await;
                self.reject(attempt.chat, &e).await;
                Err(e)
            }
        }
    }

    async fn redeem_and_activate(
        &self,
        attempt: &PendingAttempt,
        sender: &Principal,
        text: &str,
    ) -> Result<Activation, ActivationError> {
        let row = tokio::time::timeout(
            self.timing.call_timeout,
            self.redeemer.redeem(text, sender, self.identity()),
        )
        .await
        .map_err(|_| ActivationError::Dependency("code lookup timed out".to_string()))?
        .map_err(redeem_rejection)?;

        if attempt
            .activation_id
            .as_ref()
            .is_some_and(|id| *id != row.id)
        {
            return Err(ActivationError::Validation(
                "This code does not belong to the selected activation.".to_string(),
            ));
        }

        self.ensure_not_active(&self.key(attempt.chat), attempt.chat)
            .await?;

        let now = Utc::now();
        let patch = ActivationPatch::activate(
            attempt.chat,
            self.identity().clone(),
            now,
            window_end(now, row.duration_hours),
        );
        let applied = self
            .bounded(self.store.compare_and_update(
                &row.id,
                ActivationStatus::Pending,
                patch.clone(),
            ))
            .await?;
        if !applied {
            return Err(ActivationError::StateConflict(Conflict::CodeAlreadyUsed));
        }

        let mut activation = row;
        patch.apply(&mut activation, now);
        Ok(activation)
    }

    async fn complete_attempt(&self, attempt: &PendingAttempt, activation: &Activation) {
        let key = self.key(attempt.chat);
        self.runtime
            .take_pending_if(attempt.chat, attempt.nonce)
            .await;
        self.runtime.mark_activated(&key).await;
        if attempt.request_key != key {
            self.runtime.finish(&attempt.request_key).await;
        }
        self.clear_ui(attempt.chat).await;

        info!(
            activation_id = %activation.id,
            agent_id = %activation.agent_id,
            bot = %self.identity(),
            chat = attempt.chat,
            end = ?activation.activation_end,
            "Activation completed"
        );

        self.spawn_hook(activation.clone());
        self.send(attempt.chat, &View::activated(activation)).await;
    }

    fn spawn_hook(&self, activation: Activation) {
        let hook = self.hook.clone();
        self.tasks.spawn(async move {
            match hook.on_activated(&activation).await {
                Ok(()) => debug!(activation_id = %activation.id, "Activation hook finished"),
                Err(e) => warn!(
                    activation_id = %activation.id,
                    error = %e,
                    "Activation hook failed"
                ),
            }
        });
    }

    /// Handle `/cancel`: the initiating principal aborts their attempt.
    ///
    /// # Errors
    ///
    /// `NoPendingAttempt` when `requester` has nothing to cancel here.
    pub async fn cancel(&self, chat: ChatId, requester: &Principal) -> Result<(), ActivationError> {
        match self.runtime.pending(chat).await {
            Some(attempt)
                if attempt.principal.user_id == requester.user_id
                    && attempt.stage != PendingStage::Redeeming =>
            {
                if self.abort_attempt(&attempt).await {
                    info!(chat, nonce = %attempt.nonce, "Activation attempt cancelled");
                    self.notify(chat, View::attempt_cancelled()).await;
                }
                Ok(())
            }
            _ => {
                self.notify(chat, View::nothing_to_cancel()).await;
                Err(ActivationError::StateConflict(Conflict::NoPendingAttempt))
            }
        }
    }

    /// Handle `/deactivate`: an administrator stops this bot's pairing.
    ///
    /// # Errors
    ///
    /// Returns the rejection after it has been reported.
    pub async fn deactivate(
        &self,
        chat: ChatId,
        requester: &Principal,
    ) -> Result<(), ActivationError> {
        let result = self.stop_active(chat, requester).await;
        if let Err(e) = &result {
            self.reject(chat, e).await;
        }
        result
    }

    async fn stop_active(&self, chat: ChatId, requester: &Principal) -> Result<(), ActivationError> {
        if !self
            .bounded(self.transport.is_admin(chat, requester.user_id))
            .await?
        {
            return Err(ActivationError::AuthorizationDenied(
                "Only group administrators can stop the agent.".to_string(),
            ));
        }

        let key = self.key(chat);
        let row = self
            .bounded(self.store.find_active(chat, self.identity()))
            .await?;
        let applied = match &row {
            Some(row) => {
                let patch = ActivationPatch::close(ActivationStatus::Stopped, Some(Utc::now()));
                self.bounded(
                    self.store
                        .compare_and_update(&row.id, ActivationStatus::Active, patch),
                )
                .await?
            }
            None => false,
        };
        self.runtime.set_cached_active(&key, false).await;

        match row {
            Some(row) if applied => {
                info!(
                    activation_id = %row.id,
                    chat,
                    by = %requester.display(),
                    "Activation stopped"
                );
                self.send(chat, &View::stopped(requester)).await;
            }
            _ => self.notify(chat, View::not_active()).await,
        }
        Ok(())
    }

    /// Handle `/status`: report this bot's pairing in `chat`.
    ///
    /// # Errors
    ///
    /// Returns a `Dependency` error if the store cannot be read.
    pub async fn status(&self, chat: ChatId) -> Result<Option<Activation>, ActivationError> {
        let result = self.live_activation(chat).await;
        match &result {
            Ok(Some(row)) => self.notify(chat, &View::status(row, Utc::now())).await,
            Ok(None) => self.notify(chat, View::not_active()).await,
            Err(e) => self.reject(chat, e).await,
        }
        result
    }

    /// Active, unexpired pairing of this bot in `chat`.
    ///
    /// An overdue pairing is expired here and the group told so.
    async fn live_activation(&self, chat: ChatId) -> Result<Option<Activation>, ActivationError> {
        let key = self.key(chat);
        let Some(row) = self
            .bounded(self.store.find_active(chat, self.identity()))
            .await?
        else {
            self.runtime.set_cached_active(&key, false).await;
            return Ok(None);
        };

        match self
            .bounded(expire_if_due(self.store.as_ref(), &row, Utc::now()))
            .await?
        {
            ExpiryOutcome::Live => {
                self.runtime.set_cached_active(&key, true).await;
                Ok(Some(row))
            }
            ExpiryOutcome::Expired => {
                self.runtime.set_cached_active(&key, false).await;
                self.send(chat, View::expired()).await;
                Ok(None)
            }
            ExpiryOutcome::AlreadyClosed => {
                self.runtime.set_cached_active(&key, false).await;
                Ok(None)
            }
        }
    }

    /// Route a group message to the active agent, if any.
    ///
    /// # Errors
    ///
    /// Returns a `Dependency` error if the store cannot be read; reply
    /// failures are reported in the chat and logged.
    pub async fn converse(
        &self,
        chat: ChatId,
        author: &Principal,
        text: &str,
    ) -> Result<(), ActivationError> {
        if self.runtime.cached_active(&self.key(chat)).await == Some(false) {
            return Ok(());
        }
        let Some(activation) = self.live_activation(chat).await? else {
            return Ok(());
        };

        let reply = tokio::time::timeout(
            self.timing.reply_budget(),
            self.responder.reply(&activation, author, text),
        )
        .await
        .unwrap_or_else(|_| Err(ReplyError::Failed("reply timed out".to_string())));
        match reply {
            Ok(answer) => {
                self.send(chat, &html_escape::encode_text(&answer)).await;
            }
            Err(ReplyError::Busy { wait_secs }) => {
                info!(chat, ?wait_secs, "Completion service busy");
                self.notify(chat, &View::busy(wait_secs)).await;
            }
            Err(ReplyError::Failed(e)) => {
                error!(chat, activation_id = %activation.id, error = %e, "Reply failed");
                self.notify(
                    chat,
                    &View::rejection(&ActivationError::Dependency(e)),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Expire every overdue pairing held by this bot.
    ///
    /// # Errors
    ///
    /// Returns a `Dependency` error if the store cannot be read.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, ActivationError> {
        let rows = self.bounded(self.store.list_active()).await?;
        let mut expired = 0;
        for row in rows
            .iter()
            .filter(|row| row.selected_bot.as_ref() == Some(self.identity()))
        {
            let outcome = self
                .bounded(expire_if_due(self.store.as_ref(), row, now))
                .await?;
            if outcome != ExpiryOutcome::Expired {
                continue;
            }
            expired += 1;
            if let Some(group) = row.group_id {
                self.runtime.set_cached_active(&self.key(group), false).await;
                self.send(group, View::expired()).await;
            }
        }
        Ok(expired)
    }

    /// Stop timers and wait up to `grace` for tracked tasks.
    ///
    /// Returns `false` if tasks were still running when the grace ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.runtime.disarm_all().await;
        self.tasks.close();
        let drained = tokio::time::timeout(grace, self.tasks.wait()).await.is_ok();
        if drained {
            info!("Activation tasks drained");
        } else {
            warn!(remaining = self.tasks.len(), "Shutdown grace elapsed with tasks running");
        }
        drained
    }

    fn arm_pending_timer(&self, chat: ChatId, nonce: Uuid, timer: CancellationToken) {
        let this = self.clone();
        let window = self.timing.pending_timeout;
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                () = timer.cancelled() => {}
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(window) => this.expire_pending(chat, nonce).await,
            }
        });
    }

    async fn expire_pending(&self, chat: ChatId, nonce: Uuid) {
        let Some(attempt) = self
            .runtime
            .pending(chat)
            .await
            .filter(|attempt| {
                attempt.nonce == nonce && attempt.stage != PendingStage::Redeeming
            })
        else {
            return;
        };
        if self.abort_attempt(&attempt).await {
            info!(chat, %nonce, stage = ?attempt.stage, "Activation attempt timed out");
            self.notify(chat, View::attempt_timed_out()).await;
        }
    }

    /// Tear down `attempt` if it is still outstanding.
    ///
    /// Returns `false` if another path settled it first.
    async fn abort_attempt(&self, attempt: &PendingAttempt) -> bool {
        if self
            .runtime
            .take_pending_if(attempt.chat, attempt.nonce)
            .await
            .is_none()
        {
            return false;
        }
        self.runtime.finish(&attempt.request_key).await;
        self.clear_ui(attempt.chat).await;
        debug!(chat = attempt.chat, nonce = %attempt.nonce, "Activation attempt aborted");
        true
    }

    /// Release an attempt that failed before or while opening
    async fn release(&self, key: &RuntimeKey, chat: ChatId, nonce: Uuid) {
        let owned = self.runtime.take_pending_if(chat, nonce).await.is_some();
        self.runtime.finish(key).await;
        if owned {
            self.clear_ui(chat).await;
        }
    }

    async fn clear_ui(&self, chat: ChatId) {
        for message in self.runtime.drain_ui_messages(chat).await {
            if let Err(e) = self
                .bounded(self.transport.delete_message(chat, message))
                .await
            {
                debug!(chat, message, error = %e, "Failed to delete UI message");
            }
        }
    }

    async fn reject(&self, chat: ChatId, error: &ActivationError) {
        match error {
            ActivationError::Dependency(_) => {
                error!(bot = %self.identity(), chat, error = %error, "Activation step failed");
            }
            _ => info!(bot = %self.identity(), chat, error = %error, "Activation step rejected"),
        }
        self.notify(chat, &View::rejection(error)).await;
    }

    /// Send a permanent message
    pub(crate) async fn send(&self, chat: ChatId, text: &str) -> Option<MessageId> {
        match self.bounded(self.transport.send_text(chat, text)).await {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(chat, error = %e, "Failed to send message");
                None
            }
        }
    }

    /// Send a message that deletes itself after the transient TTL
    async fn notify(&self, chat: ChatId, text: &str) {
        let Some(message) = self.send(chat, text).await else {
            return;
        };
        let transport = self.transport.clone();
        let shutdown = self.shutdown.clone();
        let ttl = self.timing.transient_ttl;
        let call_timeout = self.timing.call_timeout;
        self.tasks.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(ttl) => {
                    let deleted = tokio::time::timeout(
                        call_timeout,
                        transport.delete_message(chat, message),
                    )
                    .await;
                    if !matches!(deleted, Ok(Ok(()))) {
                        debug!(chat, message, "Transient message already gone");
                    }
                }
            }
        });
    }

    /// Run an external call under the call timeout
    async fn bounded<T, E: Display>(
        &self,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, ActivationError> {
        match tokio::time::timeout(self.timing.call_timeout, call).await {
            Ok(result) => result.map_err(|e| ActivationError::Dependency(e.to_string())),
            Err(_) => Err(ActivationError::Dependency("call timed out".to_string())),
        }
    }
}

fn redeem_rejection(error: RedeemError) -> ActivationError {
    match error {
        RedeemError::InvalidCode => {
            ActivationError::Validation("Invalid verification code.".to_string())
        }
        RedeemError::AlreadyUsed => ActivationError::StateConflict(Conflict::CodeAlreadyUsed),
        RedeemError::Unauthorized { authorized } => ActivationError::AuthorizationDenied(format!(
            "This code was issued to {authorized}."
        )),
        RedeemError::BotMismatch { expected } => {
            ActivationError::StateConflict(Conflict::BotMismatch { expected })
        }
        RedeemError::Storage(e) => ActivationError::Dependency(e),
    }
}
