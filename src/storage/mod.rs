//! Storage layer for activation rows, agent personas and the message log
//!
//! The durable store is the source of truth for activation status. Every
//! status change goes through [`ActivationStore::compare_and_update`], which
//! only applies when the row still has the expected prior status.

mod memory;
mod r2;

pub use memory::InMemoryActivationStore;
pub use r2::R2ActivationStore;

use crate::activation::{Activation, ActivationPatch, ActivationStatus, BotIdentity, ChatId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error retrieving an object from S3
    #[error("S3 get error: {0}")]
    S3Get(String),
    /// Error putting or deleting an object in S3
    #[error("S3 put error: {0}")]
    S3Put(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
    /// A row with the same id or code already exists
    #[error("Duplicate activation: {0}")]
    Duplicate(String),
    /// The call did not finish in time
    #[error("Storage call timed out")]
    Timeout,
}

/// A message in a pairing's conversation log
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    /// Role of the message sender (user or assistant)
    pub role: String,
    /// Display name of the sender
    pub author: String,
    /// Text content of the message
    pub content: String,
}

impl Message {
    /// Message written by a group member
    #[must_use]
    pub fn user(author: &str, content: &str) -> Self {
        Self {
            role: "user".to_string(),
            author: author.to_string(),
            content: content.to_string(),
        }
    }

    /// Message written by the bot
    #[must_use]
    pub fn assistant(author: &str, content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            author: author.to_string(),
            content: content.to_string(),
        }
    }
}

/// Interface for durable activation storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivationStore: Send + Sync {
    /// Store a new activation row
    async fn insert(&self, activation: Activation) -> Result<(), StorageError>;
    /// Point lookup by verification code
    async fn find_by_code(&self, code: &str) -> Result<Option<Activation>, StorageError>;
    /// Point lookup by id
    async fn get(&self, id: &str) -> Result<Option<Activation>, StorageError>;
    /// Newest active row for a bot in a group
    async fn find_active(
        &self,
        group_id: ChatId,
        bot: &BotIdentity,
    ) -> Result<Option<Activation>, StorageError>;
    /// Apply `patch` only if the row still has status `expected`.
    ///
    /// Returns `false` when the precondition no longer holds.
    async fn compare_and_update(
        &self,
        id: &str,
        expected: ActivationStatus,
        patch: ActivationPatch,
    ) -> Result<bool, StorageError>;
    /// Every row currently marked active
    async fn list_active(&self) -> Result<Vec<Activation>, StorageError>;
    /// Persist generated personality text for an agent
    async fn save_persona(&self, agent_id: &str, persona: &str) -> Result<(), StorageError>;
    /// Load personality text for an agent
    async fn load_persona(&self, agent_id: &str) -> Result<Option<String>, StorageError>;
    /// Append to an activation's message log
    async fn append_message(
        &self,
        activation_id: &str,
        message: Message,
    ) -> Result<(), StorageError>;
    /// Most recent `limit` messages of an activation's log, oldest first
    async fn recent_messages(
        &self,
        activation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError>;
    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), String>;
}

/// Load pending activations from a JSON file into `store`.
///
/// Rows that already exist are skipped.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub async fn seed_from_file(
    store: &dyn ActivationStore,
    path: &str,
) -> Result<usize, StorageError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let rows: Vec<Activation> = serde_json::from_str(&raw)?;
    let mut inserted = 0;
    for row in rows {
        match store.insert(row).await {
            Ok(()) => inserted += 1,
            Err(StorageError::Duplicate(id)) => {
                tracing::debug!(activation_id = %id, "Seed row already present");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(inserted)
}

/// Prefix under which activation rows are stored
pub const ACTIVATION_PREFIX: &str = "activations/";

/// Returns the R2 key for an activation row
#[must_use]
pub fn activation_key(id: &str) -> String {
    format!("{ACTIVATION_PREFIX}{id}.json")
}

/// Returns the R2 key of the code index entry
#[must_use]
pub fn code_index_key(code: &str) -> String {
    format!("codes/{code}.json")
}

/// Prefix under which active pairings are indexed
pub const ACTIVE_INDEX_PREFIX: &str = "active/";

/// Returns the R2 key of the active index entry for a bot in a group
#[must_use]
pub fn active_index_key(group_id: ChatId, bot: &BotIdentity) -> String {
    format!("{ACTIVE_INDEX_PREFIX}{}/{group_id}.json", bot.as_str())
}

/// Returns the R2 key for an agent's persona
#[must_use]
pub fn persona_key(agent_id: &str) -> String {
    format!("personas/{agent_id}.json")
}

/// Returns the R2 key for an activation's message log
#[must_use]
pub fn message_log_key(activation_id: &str) -> String {
    format!("logs/{activation_id}.json")
}
