//! Process-local activation store.
//!
//! Every operation takes the same lock, so the compare-and-update is atomic
//! with respect to all other writers in the process.

use super::{ActivationStore, Message, StorageError};
use crate::activation::{Activation, ActivationPatch, ActivationStatus, BotIdentity, ChatId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    activations: HashMap<String, Activation>,
    personas: HashMap<String, String>,
    logs: HashMap<String, Vec<Message>>,
}

/// In-memory `ActivationStore`
#[derive(Default)]
pub struct InMemoryActivationStore {
    tables: RwLock<Tables>,
}

impl InMemoryActivationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivationStore for InMemoryActivationStore {
    async fn insert(&self, activation: Activation) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let clash = tables.activations.values().any(|row| {
            row.id == activation.id || row.verification_code == activation.verification_code
        });
        if clash {
            return Err(StorageError::Duplicate(activation.id));
        }
        tables.activations.insert(activation.id.clone(), activation);
        Ok(())
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Activation>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .activations
            .values()
            .find(|row| row.verification_code == code)
            .cloned())
    }

    async fn get(&self, id: &str) -> Result<Option<Activation>, StorageError> {
        Ok(self.tables.read().await.activations.get(id).cloned())
    }

    async fn find_active(
        &self,
        group_id: ChatId,
        bot: &BotIdentity,
    ) -> Result<Option<Activation>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .activations
            .values()
            .filter(|row| {
                row.status == ActivationStatus::Active
                    && row.group_id == Some(group_id)
                    && row.selected_bot.as_ref() == Some(bot)
            })
            .max_by_key(|row| row.created_at)
            .cloned())
    }

    async fn compare_and_update(
        &self,
        id: &str,
        expected: ActivationStatus,
        patch: ActivationPatch,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        match tables.activations.get_mut(id) {
            Some(row) if row.status == expected => {
                patch.apply(row, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active(&self) -> Result<Vec<Activation>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .activations
            .values()
            .filter(|row| row.status == ActivationStatus::Active)
            .cloned()
            .collect())
    }

    async fn save_persona(&self, agent_id: &str, persona: &str) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .personas
            .insert(agent_id.to_string(), persona.to_string());
        Ok(())
    }

    async fn load_persona(&self, agent_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self.tables.read().await.personas.get(agent_id).cloned())
    }

    async fn append_message(
        &self,
        activation_id: &str,
        message: Message,
    ) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .logs
            .entry(activation_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn recent_messages(
        &self,
        activation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let tables = self.tables.read().await;
        let log = tables.logs.get(activation_id).map_or(&[][..], Vec::as_slice);
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }

    async fn check_connection(&self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::window_end;

    fn activate_patch(group: ChatId, bot: &str) -> ActivationPatch {
        let now = Utc::now();
        ActivationPatch::activate(group, BotIdentity::new(bot), now, window_end(now, Some(1)))
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_code() -> Result<(), StorageError> {
        let store = InMemoryActivationStore::new();
        store
            .insert(Activation::pending("a", "CODE", "@alice", None))
            .await?;
        let dup = store
            .insert(Activation::pending("b", "CODE", "@bob", None))
            .await;
        assert!(matches!(dup, Err(StorageError::Duplicate(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_update_applies_once() -> Result<(), StorageError> {
        let store = InMemoryActivationStore::new();
        let row = Activation::pending("a", "CODE", "@alice", Some(1));
        let id = row.id.clone();
        store.insert(row).await?;

        let first = store
            .compare_and_update(&id, ActivationStatus::Pending, activate_patch(-1, "b1"))
            .await?;
        let second = store
            .compare_and_update(&id, ActivationStatus::Pending, activate_patch(-2, "b2"))
            .await?;
        assert!(first);
        assert!(!second);

        let stored = store.get(&id).await?;
        assert_eq!(stored.and_then(|r| r.group_id), Some(-1));
        Ok(())
    }

    #[tokio::test]
    async fn test_find_active_filters_group_and_bot() -> Result<(), StorageError> {
        let store = InMemoryActivationStore::new();
        let row = Activation::pending("a", "CODE", "@alice", Some(1));
        let id = row.id.clone();
        store.insert(row).await?;
        store
            .compare_and_update(&id, ActivationStatus::Pending, activate_patch(-1, "b1"))
            .await?;

        let bot = BotIdentity::new("b1");
        assert!(store.find_active(-1, &bot).await?.is_some());
        assert!(store.find_active(-2, &bot).await?.is_none());
        assert!(store
            .find_active(-1, &BotIdentity::new("b2"))
            .await?
            .is_none());
        assert_eq!(store.list_active().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_recent_messages_keeps_tail() -> Result<(), StorageError> {
        let store = InMemoryActivationStore::new();
        for i in 0..5 {
            store
                .append_message("act", Message::user("alice", &format!("m{i}")))
                .await?;
        }
        let recent = store.recent_messages("act", 2).await?;
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert!(store.recent_messages("missing", 2).await?.is_empty());
        Ok(())
    }
}
