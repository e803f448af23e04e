//! Process wiring
//!
//! Builds the durable store, the completion client and one coordinator per
//! bot token, then runs a teloxide dispatcher for each token until ctrl-c.

use crate::activation::{
    ActivationLifecycle, Coordinator, Fleet, LifecycleDeps, NoticeThrottle, RuntimeStateStore,
};
use crate::bot::handlers::setup_handler;
use crate::bot::TelegramTransport;
use crate::config::{Settings, StorageBackend};
use crate::llm::{CompletionClient, CompletionProvider, DisabledProvider, OpenAiCompatProvider};
use crate::persona::PersonaService;
use crate::storage::{seed_from_file, ActivationStore, InMemoryActivationStore, R2ActivationStore};
use crate::transport::ChatTransport;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const PRIVATE_NOTICE_CAPACITY: u64 = 10_000;

/// Run every configured bot until the process is interrupted.
///
/// # Errors
///
/// Returns an error if no token is configured, a bot cannot be reached at
/// startup, or the store cannot be initialized or seeded.
pub async fn run(settings: Arc<Settings>) -> Result<()> {
    let tokens = settings.telegram_tokens();
    if tokens.is_empty() {
        bail!("TELEGRAM_TOKEN is not set");
    }

    let store = init_store(&settings).await?;
    let persona = Arc::new(PersonaService::new(
        store.clone(),
        init_completion(&settings),
        settings.conversation_history_limit,
        Duration::from_secs(settings.external_call_timeout_secs),
    ));
    let transports = connect_bots(&tokens).await?;
    let identities: Vec<_> = transports.iter().map(|t| t.identity().clone()).collect();

    let runtime = Arc::new(RuntimeStateStore::new());
    let tasks = TaskTracker::new();
    let shutdown = CancellationToken::new();
    let notices = NoticeThrottle::new(
        Duration::from_secs(settings.private_notice_cooldown_secs),
        PRIVATE_NOTICE_CAPACITY,
    );
    let started_at = Utc::now();

    let coordinators: Vec<Arc<Coordinator>> = transports
        .iter()
        .map(|transport| {
            let lifecycle = ActivationLifecycle::new(LifecycleDeps {
                store: store.clone(),
                runtime: runtime.clone(),
                transport: transport.clone(),
                hook: persona.clone(),
                responder: persona.clone(),
                fleet: identities.clone(),
                rate_limits: settings.rate_limit(),
                timing: settings.lifecycle_timing(),
                tasks: tasks.clone(),
                shutdown: shutdown.clone(),
            });
            Arc::new(Coordinator::new(lifecycle, started_at, notices.clone()))
        })
        .collect();
    let fleet = Arc::new(Fleet::new(coordinators.clone()));

    spawn_expiry_sweep(
        settings.expiry_sweep_interval_secs,
        fleet.clone(),
        &tasks,
        shutdown.clone(),
    );

    info!(bots = ?identities, "Bot fleet is running...");
    join_all(
        transports
            .iter()
            .zip(coordinators)
            .map(|(transport, coordinator)| {
                run_dispatcher(transport.bot().clone(), coordinator, fleet.clone())
            }),
    )
    .await;

    info!("Dispatchers stopped, draining activation tasks");
    fleet
        .shutdown(Duration::from_secs(settings.shutdown_grace_secs))
        .await;
    Ok(())
}

async fn run_dispatcher(bot: Bot, coordinator: Arc<Coordinator>, fleet: Arc<Fleet>) {
    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![coordinator, fleet])
        .default_handler(|update| async move {
            debug!(update_id = update.id.0, "Unhandled update");
        })
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn init_store(settings: &Settings) -> Result<Arc<dyn ActivationStore>> {
    let store: Arc<dyn ActivationStore> = match settings.storage_backend {
        StorageBackend::Memory => {
            info!("Using in-memory activation store.");
            Arc::new(InMemoryActivationStore::new())
        }
        StorageBackend::R2 => {
            let store = R2ActivationStore::new(settings)
                .await
                .context("failed to initialize R2 storage")?;
            info!("R2 Storage initialized.");
            if let Err(e) = store.check_connection().await {
                error!(error = %e, "R2 Storage connection check returned error.");
            }
            Arc::new(store)
        }
    };

    if let Some(path) = &settings.activation_seed_file {
        let inserted = seed_from_file(store.as_ref(), path)
            .await
            .with_context(|| format!("failed to seed activations from {path}"))?;
        info!(path = %path, inserted, "Activation store seeded");
    }
    Ok(store)
}

fn init_completion(settings: &Settings) -> CompletionClient {
    let provider: Arc<dyn CompletionProvider> = match &settings.llm_api_key {
        Some(key) => {
            info!(model = %settings.llm_model, "Completion client initialized.");
            Arc::new(OpenAiCompatProvider::new(
                key,
                &settings.llm_api_base,
                &settings.llm_model,
                settings.llm_max_tokens,
            ))
        }
        None => {
            warn!("LLM_API_KEY is not set; personas and replies are disabled");
            Arc::new(DisabledProvider)
        }
    };
    CompletionClient::new(
        provider,
        Duration::from_secs(settings.completion_timeout_secs),
    )
}

async fn connect_bots(tokens: &[String]) -> Result<Vec<Arc<TelegramTransport>>> {
    let mut transports = Vec::with_capacity(tokens.len());
    let mut seen = HashSet::new();
    for token in tokens {
        let transport = TelegramTransport::connect(Bot::new(token))
            .await
            .context("failed to connect a Telegram bot")?;
        if !seen.insert(transport.identity().clone()) {
            bail!("bot {} is configured twice", transport.identity());
        }
        transports.push(Arc::new(transport));
    }
    Ok(transports)
}

fn spawn_expiry_sweep(
    interval_secs: u64,
    fleet: Arc<Fleet>,
    tasks: &TaskTracker,
    shutdown: CancellationToken,
) {
    if interval_secs == 0 {
        return;
    }
    info!(interval_secs, "Expiry sweep enabled");
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => sweep_fleet(&fleet).await,
            }
        }
    });
}

async fn sweep_fleet(fleet: &Fleet) {
    for member in fleet.members() {
        let lifecycle = member.lifecycle();
        match lifecycle.sweep_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(expired) => info!(bot = %lifecycle.identity(), expired, "Expired activations swept"),
            Err(e) => warn!(bot = %lifecycle.identity(), error = %e, "Expiry sweep failed"),
        }
    }
}
