#![allow(dead_code)]

use activation_bot::activation::{
    Activation, ActivationHook, ActivationLifecycle, ActivationPatch, ActivationStatus,
    BotIdentity, ChatId, ChatKind, CommandKind, ConversationResponder, Coordinator, EventMeta,
    Fleet, InboundEvent, LifecycleDeps, MessageId, NoticeThrottle, Principal, ReplyError,
    RuntimeKey, RuntimeStateStore,
};
use activation_bot::config::{LifecycleTiming, RateLimitSettings};
use activation_bot::storage::{ActivationStore, InMemoryActivationStore, Message, StorageError};
use activation_bot::transport::{ChatTransport, SelectionOption};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const GROUP: ChatId = -1001;
pub const OTHER_GROUP: ChatId = -1002;

pub fn alice() -> Principal {
    Principal {
        user_id: 10,
        username: Some("alice".to_string()),
    }
}

pub fn bob() -> Principal {
    Principal {
        user_id: 20,
        username: Some("bob".to_string()),
    }
}

pub fn mallory() -> Principal {
    Principal {
        user_id: 30,
        username: Some("mallory".to_string()),
    }
}

/// Recording transport for one bot
pub struct FakeChat {
    identity: BotIdentity,
    admins: HashSet<i64>,
    next_id: AtomicI32,
    sent: Mutex<Vec<(ChatId, String)>>,
    keyboards: Mutex<Vec<Vec<SelectionOption>>>,
    deleted: Mutex<Vec<MessageId>>,
}

impl FakeChat {
    pub fn new(bot: &str, admins: &[i64]) -> Self {
        Self {
            identity: BotIdentity::new(bot),
            admins: admins.iter().copied().collect(),
            next_id: AtomicI32::new(0),
            sent: Mutex::new(Vec::new()),
            keyboards: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn sent_any(&self, needle: &str) -> bool {
        self.texts().iter().any(|text| text.contains(needle))
    }

    pub fn keyboards(&self) -> Vec<Vec<SelectionOption>> {
        self.keyboards.lock().expect("keyboard lock").clone()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().expect("deleted lock").clone()
    }

    fn record(&self, chat: ChatId, text: &str) -> MessageId {
        self.sent
            .lock()
            .expect("sent lock")
            .push((chat, text.to_string()));
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ChatTransport for FakeChat {
    fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    async fn send_text(&self, chat: ChatId, text: &str) -> anyhow::Result<MessageId> {
        Ok(self.record(chat, text))
    }

    async fn send_selection(
        &self,
        chat: ChatId,
        text: &str,
        options: &[SelectionOption],
    ) -> anyhow::Result<MessageId> {
        self.keyboards
            .lock()
            .expect("keyboard lock")
            .push(options.to_vec());
        Ok(self.record(chat, text))
    }

    async fn delete_message(&self, _chat: ChatId, message: MessageId) -> anyhow::Result<()> {
        self.deleted.lock().expect("deleted lock").push(message);
        Ok(())
    }

    async fn is_admin(&self, _chat: ChatId, user_id: i64) -> anyhow::Result<bool> {
        Ok(self.admins.contains(&user_id))
    }

    async fn bot_is_admin(&self, _chat: ChatId) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Hook counting its invocations, optionally failing each one
#[derive(Default)]
pub struct CountingHook {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl ActivationHook for CountingHook {
    async fn on_activated(&self, _activation: &Activation) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("persona generation failed");
        }
        Ok(())
    }
}

/// Responder echoing a fixed answer, or never answering when `hang` is set
#[derive(Default)]
pub struct EchoResponder {
    pub calls: AtomicUsize,
    pub hang: AtomicBool,
}

#[async_trait]
impl ConversationResponder for EchoResponder {
    async fn reply(
        &self,
        _activation: &Activation,
        author: &Principal,
        text: &str,
    ) -> Result<String, ReplyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(format!("{} said <{text}>", author.display()))
    }
}

/// In-memory store that yields to the scheduler before every call, the way a
/// networked store would
pub struct YieldingStore {
    inner: Arc<InMemoryActivationStore>,
}

#[async_trait]
impl ActivationStore for YieldingStore {
    async fn insert(&self, activation: Activation) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.inner.insert(activation).await
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Activation>, StorageError> {
        tokio::task::yield_now().await;
        self.inner.find_by_code(code).await
    }

    async fn get(&self, id: &str) -> Result<Option<Activation>, StorageError> {
        tokio::task::yield_now().await;
        self.inner.get(id).await
    }

    async fn find_active(
        &self,
        group_id: ChatId,
        bot: &BotIdentity,
    ) -> Result<Option<Activation>, StorageError> {
        tokio::task::yield_now().await;
        self.inner.find_active(group_id, bot).await
    }

    async fn compare_and_update(
        &self,
        id: &str,
        expected: ActivationStatus,
        patch: ActivationPatch,
    ) -> Result<bool, StorageError> {
        tokio::task::yield_now().await;
        self.inner.compare_and_update(id, expected, patch).await
    }

    async fn list_active(&self) -> Result<Vec<Activation>, StorageError> {
        tokio::task::yield_now().await;
        self.inner.list_active().await
    }

    async fn save_persona(&self, agent_id: &str, persona: &str) -> Result<(), StorageError> {
        self.inner.save_persona(agent_id, persona).await
    }

    async fn load_persona(&self, agent_id: &str) -> Result<Option<String>, StorageError> {
        self.inner.load_persona(agent_id).await
    }

    async fn append_message(
        &self,
        activation_id: &str,
        message: Message,
    ) -> Result<(), StorageError> {
        self.inner.append_message(activation_id, message).await
    }

    async fn recent_messages(
        &self,
        activation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        self.inner.recent_messages(activation_id, limit).await
    }

    async fn check_connection(&self) -> Result<(), String> {
        Ok(())
    }
}

/// A fleet of fake bots sharing one store and one runtime
pub struct Harness {
    pub store: Arc<InMemoryActivationStore>,
    pub runtime: Arc<RuntimeStateStore>,
    pub bots: Vec<Arc<FakeChat>>,
    pub hook: Arc<CountingHook>,
    pub responder: Arc<EchoResponder>,
    pub fleet: Arc<Fleet>,
    pub started_at: DateTime<Utc>,
}

pub fn harness(bots: &[&str], admins: &[i64]) -> Harness {
    harness_with(bots, admins, LifecycleTiming::default(), RateLimitSettings::default())
}

pub fn harness_with(
    bots: &[&str],
    admins: &[i64],
    timing: LifecycleTiming,
    rate_limits: RateLimitSettings,
) -> Harness {
    let store = Arc::new(InMemoryActivationStore::new());
    build(bots, admins, timing, rate_limits, store.clone(), store)
}

/// Harness whose lifecycles see a store that yields on every call
pub fn yielding_harness(bots: &[&str], admins: &[i64]) -> Harness {
    let store = Arc::new(InMemoryActivationStore::new());
    let view = Arc::new(YieldingStore {
        inner: store.clone(),
    });
    build(
        bots,
        admins,
        LifecycleTiming::default(),
        RateLimitSettings::default(),
        store,
        view,
    )
}

fn build(
    bots: &[&str],
    admins: &[i64],
    timing: LifecycleTiming,
    rate_limits: RateLimitSettings,
    store: Arc<InMemoryActivationStore>,
    lifecycle_store: Arc<dyn ActivationStore>,
) -> Harness {
    let runtime = Arc::new(RuntimeStateStore::new());
    let hook = Arc::new(CountingHook::default());
    let responder = Arc::new(EchoResponder::default());
    let transports: Vec<Arc<FakeChat>> = bots
        .iter()
        .map(|bot| Arc::new(FakeChat::new(bot, admins)))
        .collect();
    let identities: Vec<BotIdentity> = bots.iter().map(|bot| BotIdentity::new(bot)).collect();
    let tasks = TaskTracker::new();
    let shutdown = CancellationToken::new();
    let notices = NoticeThrottle::new(Duration::from_secs(600), 1_000);
    let started_at = Utc::now();

    let members = transports
        .iter()
        .map(|transport| {
            let lifecycle = ActivationLifecycle::new(LifecycleDeps {
                store: lifecycle_store.clone(),
                runtime: runtime.clone(),
                transport: transport.clone(),
                hook: hook.clone(),
                responder: responder.clone(),
                fleet: identities.clone(),
                rate_limits,
                timing,
                tasks: tasks.clone(),
                shutdown: shutdown.clone(),
            });
            Arc::new(Coordinator::new(lifecycle, started_at, notices.clone()))
        })
        .collect();

    Harness {
        store,
        runtime,
        bots: transports,
        hook,
        responder,
        fleet: Arc::new(Fleet::new(members)),
        started_at,
    }
}

impl Harness {
    pub fn member(&self, index: usize) -> &Arc<Coordinator> {
        &self.fleet.members()[index]
    }

    pub fn lifecycle(&self, index: usize) -> &ActivationLifecycle {
        self.member(index).lifecycle()
    }

    pub fn key(&self, bot: &str, chat: ChatId) -> RuntimeKey {
        RuntimeKey::new(BotIdentity::new(bot), chat)
    }

    pub async fn issue(&self, code: &str, principal: &str) -> Activation {
        let row = Activation::pending("agent-7", code, principal, Some(24));
        self.store.insert(row.clone()).await.expect("insert");
        row
    }

    pub async fn row(&self, id: &str) -> Activation {
        self.store
            .get(id)
            .await
            .expect("store read")
            .expect("row exists")
    }

    pub async fn status_of(&self, id: &str) -> ActivationStatus {
        self.row(id).await.status
    }

    pub fn hook_calls(&self) -> usize {
        self.hook.calls.load(Ordering::SeqCst)
    }

    pub fn replies(&self) -> usize {
        self.responder.calls.load(Ordering::SeqCst)
    }

    pub async fn drain(&self) -> bool {
        self.fleet.shutdown(Duration::from_secs(5)).await
    }
}

pub fn meta(chat: ChatId, sender: &Principal) -> EventMeta {
    EventMeta {
        chat,
        chat_kind: if chat < 0 {
            ChatKind::Group
        } else {
            ChatKind::Private
        },
        sender: sender.clone(),
        sent_at: Utc::now(),
    }
}

pub fn command(chat: ChatId, sender: &Principal, command: CommandKind) -> InboundEvent {
    InboundEvent::Command {
        meta: meta(chat, sender),
        command,
    }
}

pub fn activate(chat: ChatId, sender: &Principal) -> InboundEvent {
    command(chat, sender, CommandKind::Activate { target: None })
}

pub fn press(chat: ChatId, sender: &Principal, bot: &str) -> InboundEvent {
    InboundEvent::Callback {
        meta: meta(chat, sender),
        payload: format!("select_bot:{bot}"),
    }
}

pub fn text(chat: ChatId, sender: &Principal, body: &str) -> InboundEvent {
    InboundEvent::Text {
        meta: meta(chat, sender),
        text: body.to_string(),
    }
}
