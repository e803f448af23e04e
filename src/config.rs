//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! transport retry constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage backend selector
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local store, optionally seeded from a JSON file
    #[default]
    Memory,
    /// Cloudflare R2 / S3 JSON objects
    R2,
}

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token(s); a comma-separated list runs a fleet of bots
    pub telegram_token: String,

    /// Which durable store to use
    #[serde(default)]
    pub storage_backend: StorageBackend,
    /// JSON file with pending activations loaded into the memory store at startup
    pub activation_seed_file: Option<String>,

    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,

    /// API key for the OpenAI-compatible completion endpoint
    pub llm_api_key: Option<String>,
    /// Base URL of the completion endpoint
    #[serde(default = "default_llm_api_base")]
    pub llm_api_base: String,
    /// Model identifier sent with each completion
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Output token cap for completions
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,

    /// Attempts allowed inside one window before the cooldown applies
    #[serde(default = "default_max_attempts")]
    pub activation_max_attempts: u32,
    /// Window in which attempts accumulate
    #[serde(default = "default_attempt_window_secs")]
    pub activation_attempt_window_secs: u64,
    /// Quiet period after which a rate-limited key starts over
    #[serde(default = "default_cooldown_secs")]
    pub activation_cooldown_secs: u64,
    /// How long a pending attempt waits for selection or code
    #[serde(default = "default_pending_attempt_timeout_secs")]
    pub pending_attempt_timeout_secs: u64,
    /// Lifetime of short-lived notices in the group
    #[serde(default = "default_transient_message_ttl_secs")]
    pub transient_message_ttl_secs: u64,
    /// Timeout for a single transport or store call
    #[serde(default = "default_external_call_timeout_secs")]
    pub external_call_timeout_secs: u64,
    /// Timeout for a single completion request
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    /// Interval of the optional expiry sweep; 0 disables it
    #[serde(default)]
    pub expiry_sweep_interval_secs: u64,
    /// Messages of history fed into conversational replies
    #[serde(default = "default_history_limit")]
    pub conversation_history_limit: usize,
    /// Cooldown between "use me in a group" replies to the same user
    #[serde(default = "default_private_notice_cooldown_secs")]
    pub private_notice_cooldown_secs: u64,
    /// Upper bound on draining in-flight tasks at shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_llm_api_base() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "google/gemini-2.5-flash".to_string()
}

const fn default_llm_max_tokens() -> u32 {
    1024
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_attempt_window_secs() -> u64 {
    60
}

const fn default_cooldown_secs() -> u64 {
    300
}

const fn default_pending_attempt_timeout_secs() -> u64 {
    300
}

const fn default_transient_message_ttl_secs() -> u64 {
    30
}

const fn default_external_call_timeout_secs() -> u64 {
    15
}

const fn default_completion_timeout_secs() -> u64 {
    60
}

const fn default_history_limit() -> usize {
    20
}

const fn default_private_notice_cooldown_secs() -> u64 {
    600
}

const fn default_shutdown_grace_secs() -> u64 {
    10
}

/// Build the layered configuration source shared by all settings loaders.
///
/// # Errors
///
/// Returns a `ConfigError` if any source cannot be read.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Not checked into git
        .add_source(File::with_name("config/local").required(false))
        // `APP__LLM_MODEL=... ./activation-bot`
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Plain UPPER_SNAKE_CASE variables; empty values count as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use activation_bot::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let mut settings: Self = build_config()?.try_deserialize()?;

        // Fallback for the R2 variables, which some hosts export with mixed casing
        for (slot, var) in [
            (&mut settings.r2_endpoint_url, "R2_ENDPOINT_URL"),
            (&mut settings.r2_access_key_id, "R2_ACCESS_KEY_ID"),
            (&mut settings.r2_secret_access_key, "R2_SECRET_ACCESS_KEY"),
            (&mut settings.r2_bucket_name, "R2_BUCKET_NAME"),
        ] {
            if slot.is_none() {
                if let Ok(val) = std::env::var(var) {
                    if !val.is_empty() {
                        *slot = Some(val);
                    }
                }
            }
        }

        Ok(settings)
    }

    /// Returns every configured bot token, one per fleet member
    #[must_use]
    pub fn telegram_tokens(&self) -> Vec<String> {
        self.telegram_token
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Rate limiter parameters derived from the settings
    #[must_use]
    pub fn rate_limit(&self) -> RateLimitSettings {
        RateLimitSettings {
            max_attempts: self.activation_max_attempts,
            window: Duration::from_secs(self.activation_attempt_window_secs),
            cooldown: Duration::from_secs(self.activation_cooldown_secs),
        }
    }

    /// Timing parameters of the activation lifecycle
    #[must_use]
    pub fn lifecycle_timing(&self) -> LifecycleTiming {
        LifecycleTiming {
            pending_timeout: Duration::from_secs(self.pending_attempt_timeout_secs),
            transient_ttl: Duration::from_secs(self.transient_message_ttl_secs),
            call_timeout: Duration::from_secs(self.external_call_timeout_secs),
            completion_timeout: Duration::from_secs(self.completion_timeout_secs),
        }
    }
}

/// Parameters of the attempt rate limiter
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    /// Attempts allowed inside one window
    pub max_attempts: u32,
    /// Window in which attempts accumulate
    pub window: Duration,
    /// Quiet period that resets a limited key
    pub cooldown: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window: Duration::from_secs(default_attempt_window_secs()),
            cooldown: Duration::from_secs(default_cooldown_secs()),
        }
    }
}

/// Timeouts and windows used by the lifecycle
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTiming {
    /// Lifetime of a pending attempt
    pub pending_timeout: Duration,
    /// Lifetime of transient notices
    pub transient_ttl: Duration,
    /// Timeout applied to transport and store calls
    pub call_timeout: Duration,
    /// Timeout applied to completion requests
    pub completion_timeout: Duration,
}

impl Default for LifecycleTiming {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_secs(default_pending_attempt_timeout_secs()),
            transient_ttl: Duration::from_secs(default_transient_message_ttl_secs()),
            call_timeout: Duration::from_secs(default_external_call_timeout_secs()),
            completion_timeout: Duration::from_secs(default_completion_timeout_secs()),
        }
    }
}

impl LifecycleTiming {
    /// Upper bound for one conversational reply: the store reads and writes
    /// around it plus every completion attempt
    #[must_use]
    pub fn reply_budget(&self) -> Duration {
        let attempts = u32::try_from(LLM_MAX_RETRIES).unwrap_or(u32::MAX);
        self.call_timeout.saturating_mul(4) + self.completion_timeout.saturating_mul(attempts)
    }
}

// Telegram API retry configuration
/// Maximum retries for a Telegram API call
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Initial backoff for Telegram API retries
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff ceiling for Telegram API retries
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;

// Completion retry configuration
/// Attempts made for one completion request
pub const LLM_MAX_RETRIES: usize = 3;
/// Sampling temperature for persona and replies
pub const LLM_TEMPERATURE: f32 = 0.8;
