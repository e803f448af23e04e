//! In-process activation runtime state
//!
//! Holds the per (bot, group) coordination record, the per-chat pending
//! attempts and the transient UI message registry. Nothing here is
//! persisted; after a restart the records are rebuilt lazily from the
//! durable store.

use super::{BotIdentity, ChatId, MessageId, Principal};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Key of the runtime record: one bot instance in one group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeKey {
    /// Bot instance
    pub bot: BotIdentity,
    /// Group chat
    pub group: ChatId,
}

impl RuntimeKey {
    /// Build a key
    #[must_use]
    pub const fn new(bot: BotIdentity, group: ChatId) -> Self {
        Self { bot, group }
    }
}

/// Mutable coordination record for one bot/group pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationRuntimeState {
    /// An attempt is between request and completion
    pub in_progress: bool,
    /// Last attempt admitted by the rate limiter
    pub last_attempt: Option<Instant>,
    /// Attempts counted in the current window
    pub attempts: u32,
    /// Cached active flag; `None` until the store has been consulted
    pub cached_active: Option<bool>,
}

/// Where an outstanding attempt currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStage {
    /// Selection keyboard shown, no bot chosen yet
    AwaitingSelection,
    /// Bot chosen, waiting for the verification code
    AwaitingCode,
    /// A submitted code is being redeemed
    Redeeming,
}

/// An in-flight activation attempt in one chat
#[derive(Debug, Clone)]
pub struct PendingAttempt {
    /// Identity of this attempt; timers compare it at fire time
    pub nonce: Uuid,
    /// Administrator who started the attempt
    pub principal: Principal,
    /// Chat the attempt runs in
    pub chat: ChatId,
    /// When the attempt was opened
    pub created_at: DateTime<Utc>,
    /// Current stage
    pub stage: PendingStage,
    /// Runtime record holding the in-progress flag for this attempt
    pub request_key: RuntimeKey,
    /// Bot chosen in the selection step
    pub selected_bot: Option<BotIdentity>,
    /// Activation pre-targeted by the selection payload
    pub activation_id: Option<String>,
    timer: CancellationToken,
}

impl PendingAttempt {
    /// Open a new attempt awaiting selection
    #[must_use]
    pub fn new(principal: Principal, chat: ChatId, request_key: RuntimeKey) -> Self {
        Self {
            nonce: Uuid::new_v4(),
            principal,
            chat,
            created_at: Utc::now(),
            stage: PendingStage::AwaitingSelection,
            request_key,
            selected_bot: None,
            activation_id: None,
            timer: CancellationToken::new(),
        }
    }

    /// Token observed by this attempt's expiry timer
    #[must_use]
    pub fn timer(&self) -> CancellationToken {
        self.timer.clone()
    }

    /// Replace the expiry timer token, cancelling the previous one
    pub fn rearm(&mut self) -> CancellationToken {
        self.timer.cancel();
        self.timer = CancellationToken::new();
        self.timer.clone()
    }

    fn disarm(&self) {
        self.timer.cancel();
    }
}

/// Process-wide runtime state, constructed once and shared by reference
#[derive(Debug, Default)]
pub struct RuntimeStateStore {
    states: Mutex<HashMap<RuntimeKey, ActivationRuntimeState>>,
    pending: Mutex<HashMap<ChatId, PendingAttempt>>,
    ui_messages: Mutex<HashMap<ChatId, Vec<MessageId>>>,
}

impl RuntimeStateStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the record for `key`, creating it on first lookup
    pub async fn state(&self, key: &RuntimeKey) -> ActivationRuntimeState {
        let mut states = self.states.lock().await;
        states.entry(key.clone()).or_default().clone()
    }

    /// Run `f` against the record for `key` under the store lock
    pub async fn with_state<T>(
        &self,
        key: &RuntimeKey,
        f: impl FnOnce(&mut ActivationRuntimeState) -> T,
    ) -> T {
        let mut states = self.states.lock().await;
        f(states.entry(key.clone()).or_default())
    }

    /// Set the in-progress flag if it is clear.
    ///
    /// Returns `false` when another attempt already holds it.
    pub async fn try_begin(&self, key: &RuntimeKey) -> bool {
        self.with_state(key, |state| {
            if state.in_progress {
                false
            } else {
                state.in_progress = true;
                true
            }
        })
        .await
    }

    /// Clear the in-progress flag
    pub async fn finish(&self, key: &RuntimeKey) {
        self.with_state(key, |state| state.in_progress = false).await;
    }

    /// Record a completed activation: flag cleared, counters reset, active cached
    pub async fn mark_activated(&self, key: &RuntimeKey) {
        self.with_state(key, |state| {
            state.in_progress = false;
            state.attempts = 0;
            state.last_attempt = None;
            state.cached_active = Some(true);
        })
        .await;
    }

    /// Cached active flag for `key`
    pub async fn cached_active(&self, key: &RuntimeKey) -> Option<bool> {
        self.state(key).await.cached_active
    }

    /// Overwrite the cached active flag
    pub async fn set_cached_active(&self, key: &RuntimeKey, active: bool) {
        self.with_state(key, |state| state.cached_active = Some(active))
            .await;
    }

    /// Register `attempt` only if `chat` has no outstanding attempt.
    ///
    /// Returns `false` and drops `attempt` when the chat is taken.
    pub async fn try_insert_pending(&self, attempt: PendingAttempt) -> bool {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&attempt.chat) {
            attempt.disarm();
            return false;
        }
        pending.insert(attempt.chat, attempt);
        true
    }

    /// Clone of the attempt outstanding in `chat`
    pub async fn pending(&self, chat: ChatId) -> Option<PendingAttempt> {
        self.pending.lock().await.get(&chat).cloned()
    }

    /// Remove the attempt in `chat` only if it is still the one identified by `nonce`
    pub async fn take_pending_if(&self, chat: ChatId, nonce: Uuid) -> Option<PendingAttempt> {
        let mut pending = self.pending.lock().await;
        if pending.get(&chat).is_some_and(|a| a.nonce == nonce) {
            let attempt = pending.remove(&chat);
            if let Some(attempt) = &attempt {
                attempt.disarm();
            }
            attempt
        } else {
            debug!(chat, %nonce, "Pending attempt already settled");
            None
        }
    }

    /// Mutate the attempt identified by `nonce` while it is still at `stage`.
    ///
    /// Returns `None` when the attempt is gone or has moved on, so only one
    /// caller can advance it out of a given stage.
    pub async fn update_pending<T>(
        &self,
        chat: ChatId,
        nonce: Uuid,
        stage: PendingStage,
        f: impl FnOnce(&mut PendingAttempt) -> T,
    ) -> Option<T> {
        let mut pending = self.pending.lock().await;
        pending
            .get_mut(&chat)
            .filter(|a| a.nonce == nonce && a.stage == stage)
            .map(f)
    }

    /// Append a transient message id for later cleanup
    pub async fn push_ui_message(&self, chat: ChatId, message: MessageId) {
        self.ui_messages
            .lock()
            .await
            .entry(chat)
            .or_default()
            .push(message);
    }

    /// Take every registered transient message of `chat`, oldest first
    pub async fn drain_ui_messages(&self, chat: ChatId) -> Vec<MessageId> {
        self.ui_messages
            .lock()
            .await
            .remove(&chat)
            .unwrap_or_default()
    }

    /// Cancel every outstanding pending-attempt timer
    pub async fn disarm_all(&self) {
        for attempt in self.pending.lock().await.values() {
            attempt.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RuntimeKey {
        RuntimeKey::new(BotIdentity::new("b1"), -100)
    }

    fn admin() -> Principal {
        Principal {
            user_id: 1,
            username: Some("admin".to_string()),
        }
    }

    #[tokio::test]
    async fn test_state_created_on_first_lookup() {
        let store = RuntimeStateStore::new();
        let state = store.state(&key()).await;
        assert_eq!(state, ActivationRuntimeState::default());
    }

    #[tokio::test]
    async fn test_try_begin_is_exclusive() {
        let store = RuntimeStateStore::new();
        assert!(store.try_begin(&key()).await);
        assert!(!store.try_begin(&key()).await);

        store.finish(&key()).await;
        assert!(store.try_begin(&key()).await);
    }

    #[tokio::test]
    async fn test_try_begin_under_contention() {
        let store = std::sync::Arc::new(RuntimeStateStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.try_begin(&key()).await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap_or(false) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_mark_activated_resets_counters() {
        let store = RuntimeStateStore::new();
        store
            .with_state(&key(), |s| {
                s.in_progress = true;
                s.attempts = 4;
                s.last_attempt = Some(Instant::now());
            })
            .await;

        store.mark_activated(&key()).await;
        let state = store.state(&key()).await;
        assert!(!state.in_progress);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.cached_active, Some(true));
    }

    #[tokio::test]
    async fn test_take_pending_cancels_timer() {
        let store = RuntimeStateStore::new();
        let attempt = PendingAttempt::new(admin(), -100, key());
        let timer = attempt.timer();
        let nonce = attempt.nonce;
        assert!(store.try_insert_pending(attempt).await);

        assert!(store.take_pending_if(-100, nonce).await.is_some());
        assert!(timer.is_cancelled());
        assert!(store.pending(-100).await.is_none());
    }

    #[tokio::test]
    async fn test_take_pending_if_respects_nonce() {
        let store = RuntimeStateStore::new();
        let first = PendingAttempt::new(admin(), -100, key());
        let stale_nonce = first.nonce;
        assert!(store.try_insert_pending(first).await);
        assert!(store.take_pending_if(-100, stale_nonce).await.is_some());

        let second = PendingAttempt::new(admin(), -100, key());
        let live_nonce = second.nonce;
        assert!(store.try_insert_pending(second).await);

        assert!(store.take_pending_if(-100, stale_nonce).await.is_none());
        assert!(store.take_pending_if(-100, live_nonce).await.is_some());
    }

    #[tokio::test]
    async fn test_try_insert_pending_keeps_first_attempt() {
        let store = RuntimeStateStore::new();
        let first = PendingAttempt::new(admin(), -100, key());
        let first_nonce = first.nonce;
        let first_timer = first.timer();
        assert!(store.try_insert_pending(first).await);

        let other_bot = RuntimeKey::new(BotIdentity::new("b2"), -100);
        let second = PendingAttempt::new(admin(), -100, other_bot);
        let second_timer = second.timer();
        assert!(!store.try_insert_pending(second).await);

        assert!(second_timer.is_cancelled());
        assert!(!first_timer.is_cancelled());
        assert_eq!(store.pending(-100).await.map(|a| a.nonce), Some(first_nonce));
    }

    #[tokio::test]
    async fn test_update_pending_only_advances_from_expected_stage() {
        let store = RuntimeStateStore::new();
        let attempt = PendingAttempt::new(admin(), -100, key());
        let nonce = attempt.nonce;
        assert!(store.try_insert_pending(attempt).await);

        let advanced = store
            .update_pending(-100, nonce, PendingStage::AwaitingSelection, |a| {
                a.stage = PendingStage::AwaitingCode;
            })
            .await;
        assert!(advanced.is_some());

        let again = store
            .update_pending(-100, nonce, PendingStage::AwaitingSelection, |a| {
                a.stage = PendingStage::AwaitingCode;
            })
            .await;
        assert!(again.is_none());
        assert_eq!(
            store.pending(-100).await.map(|a| a.stage),
            Some(PendingStage::AwaitingCode)
        );
    }

    #[tokio::test]
    async fn test_rearm_cancels_previous_timer() {
        let mut attempt = PendingAttempt::new(admin(), -100, key());
        let first = attempt.timer();
        let second = attempt.rearm();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn test_ui_registry_drains_in_order() {
        let store = RuntimeStateStore::new();
        store.push_ui_message(-100, 10).await;
        store.push_ui_message(-100, 11).await;
        store.push_ui_message(-200, 99).await;

        assert_eq!(store.drain_ui_messages(-100).await, vec![10, 11]);
        assert!(store.drain_ui_messages(-100).await.is_empty());
        assert_eq!(store.drain_ui_messages(-200).await, vec![99]);
    }
}
