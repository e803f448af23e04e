//! R2-backed activation store.
//!
//! Rows are JSON objects. Status transitions use S3 conditional writes: the
//! row is read together with its ETag and written back with `If-Match`, so a
//! concurrent writer makes the update fail with `412 Precondition Failed`
//! instead of being overwritten.

use super::{
    activation_key, active_index_key, code_index_key, message_log_key, persona_key,
    ActivationStore, Message, StorageError, ACTIVATION_PREFIX, ACTIVE_INDEX_PREFIX,
};
use crate::activation::{Activation, ActivationPatch, ActivationStatus, BotIdentity, ChatId};
use crate::config::Settings;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use chrono::Utc;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Index entry pointing at an activation row
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    activation_id: String,
}

/// Persisted persona document
#[derive(Debug, Serialize, Deserialize)]
struct PersonaDoc {
    persona: String,
}

/// Conditional write mode
enum WriteGuard<'a> {
    /// Unconditional overwrite
    None,
    /// Only create; fail if the key exists
    Create,
    /// Only replace the object with this ETag
    Match(&'a str),
}

/// Outcome of a guarded write
enum WriteOutcome {
    Written,
    PreconditionFailed,
}

/// Active rows whose index entry is missing or points at another row.
///
/// `indexed` maps index keys to the activation id they reference.
fn rows_missing_index<'a>(
    rows: &'a [Activation],
    indexed: &HashMap<String, String>,
) -> Vec<&'a Activation> {
    rows.iter()
        .filter(|row| row.status == ActivationStatus::Active)
        .filter(|row| match (row.group_id, row.selected_bot.as_ref()) {
            (Some(group), Some(bot)) => {
                indexed.get(&active_index_key(group, bot)) != Some(&row.id)
            }
            _ => false,
        })
        .collect()
}

fn is_precondition_failed<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::ServiceError(ctx) => matches!(ctx.raw().status().as_u16(), 409 | 412),
        _ => false,
    }
}

/// R2-backed storage implementation
pub struct R2ActivationStore {
    client: Client,
    bucket: String,
    personas: Cache<String, String>,
}

impl R2ActivationStore {
    /// Create a new R2 storage instance
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &Settings) -> Result<Self, StorageError> {
        let endpoint_url = settings
            .r2_endpoint_url
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ENDPOINT_URL is missing".into()))?;
        let access_key = settings
            .r2_access_key_id
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ACCESS_KEY_ID is missing".into()))?;
        let secret_key = settings
            .r2_secret_access_key
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_SECRET_ACCESS_KEY is missing".into()))?;
        let bucket = settings
            .r2_bucket_name
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_BUCKET_NAME is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-storage");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        // Only personas are cached; activation rows are always read fresh
        let personas = Cache::builder()
            .max_capacity(1_000)
            .time_to_live(Duration::from_secs(60 * 60))
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.clone(),
            personas,
        })
    }

    /// Load a JSON object together with its ETag
    async fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, Option<String>)>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                    .into_bytes();
                Ok(Some((serde_json::from_slice(&data)?, etag)))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(StorageError::S3Get(e.to_string())),
        }
    }

    /// Save data as JSON, optionally guarded by a precondition
    async fn save_json<T: Serialize + Sync>(
        &self,
        key: &str,
        data: &T,
        guard: WriteGuard<'_>,
    ) -> Result<WriteOutcome, StorageError> {
        let body = serde_json::to_vec_pretty(data)?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json");
        request = match guard {
            WriteGuard::None => request,
            WriteGuard::Create => request.if_none_match("*"),
            WriteGuard::Match(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(e) if is_precondition_failed(&e) => Ok(WriteOutcome::PreconditionFailed),
            Err(e) => Err(StorageError::S3Put(e.to_string())),
        }
    }

    /// Delete object from R2
    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::S3Put(e.to_string()))?;
        Ok(())
    }

    /// Keep the active index in line with a row that just changed status
    async fn sync_active_index(&self, row: &Activation) -> Result<(), StorageError> {
        let (Some(group), Some(bot)) = (row.group_id, row.selected_bot.as_ref()) else {
            return Ok(());
        };
        let key = active_index_key(group, bot);

        if row.status == ActivationStatus::Active {
            let entry = IndexEntry {
                activation_id: row.id.clone(),
            };
            self.save_json(&key, &entry, WriteGuard::None).await?;
            return Ok(());
        }

        let current: Option<(IndexEntry, Option<String>)> = self.load_json(&key).await?;
        if current.is_some_and(|(entry, _)| entry.activation_id == row.id) {
            self.delete_object(&key).await?;
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StorageError::S3Get(e.to_string()))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    /// Index key to activation id for every active index entry
    async fn load_active_index(&self) -> Result<HashMap<String, String>, StorageError> {
        let mut indexed = HashMap::new();
        for key in self.list_keys(ACTIVE_INDEX_PREFIX).await? {
            let entry: Option<(IndexEntry, Option<String>)> = self.load_json(&key).await?;
            if let Some((entry, _)) = entry {
                indexed.insert(key, entry.activation_id);
            }
        }
        Ok(indexed)
    }
}

#[async_trait]
impl ActivationStore for R2ActivationStore {
    async fn insert(&self, activation: Activation) -> Result<(), StorageError> {
        let index = IndexEntry {
            activation_id: activation.id.clone(),
        };
        let code_key = code_index_key(&activation.verification_code);
        if let WriteOutcome::PreconditionFailed =
            self.save_json(&code_key, &index, WriteGuard::Create).await?
        {
            return Err(StorageError::Duplicate(activation.id));
        }

        let key = activation_key(&activation.id);
        match self.save_json(&key, &activation, WriteGuard::Create).await {
            Ok(WriteOutcome::Written) => Ok(()),
            Ok(WriteOutcome::PreconditionFailed) => {
                self.delete_object(&code_key).await?;
                Err(StorageError::Duplicate(activation.id))
            }
            Err(e) => {
                if let Err(cleanup) = self.delete_object(&code_key).await {
                    warn!(
                        activation_id = %activation.id,
                        error = %cleanup,
                        "Failed to remove code index entry of an unwritten row"
                    );
                }
                Err(e)
            }
        }
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Activation>, StorageError> {
        let entry: Option<(IndexEntry, Option<String>)> =
            self.load_json(&code_index_key(code)).await?;
        match entry {
            Some((entry, _)) => self.get(&entry.activation_id).await,
            None => Ok(None),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Activation>, StorageError> {
        Ok(self
            .load_json::<Activation>(&activation_key(id))
            .await?
            .map(|(row, _)| row))
    }

    async fn find_active(
        &self,
        group_id: ChatId,
        bot: &BotIdentity,
    ) -> Result<Option<Activation>, StorageError> {
        let entry: Option<(IndexEntry, Option<String>)> =
            self.load_json(&active_index_key(group_id, bot)).await?;
        let Some((entry, _)) = entry else {
            return Ok(None);
        };

        // The index is advisory; the row decides
        Ok(self.get(&entry.activation_id).await?.filter(|row| {
            row.status == ActivationStatus::Active
                && row.group_id == Some(group_id)
                && row.selected_bot.as_ref() == Some(bot)
        }))
    }

    async fn compare_and_update(
        &self,
        id: &str,
        expected: ActivationStatus,
        patch: ActivationPatch,
    ) -> Result<bool, StorageError> {
        let key = activation_key(id);
        let Some((mut row, etag)) = self.load_json::<Activation>(&key).await? else {
            return Ok(false);
        };
        if row.status != expected {
            return Ok(false);
        }
        let Some(etag) = etag else {
            warn!(activation_id = %id, "Activation object has no ETag; refusing unguarded write");
            return Ok(false);
        };

        patch.apply(&mut row, Utc::now());
        match self.save_json(&key, &row, WriteGuard::Match(&etag)).await? {
            WriteOutcome::Written => {
                // The row is authoritative; a stale index is repaired by `list_active`
                if let Err(e) = self.sync_active_index(&row).await {
                    warn!(activation_id = %id, error = %e, "Active index update failed");
                }
                debug!(activation_id = %id, from = %expected, to = %row.status, "Activation updated");
                Ok(true)
            }
            WriteOutcome::PreconditionFailed => {
                info!(activation_id = %id, "Lost conditional update race");
                Ok(false)
            }
        }
    }

    async fn list_active(&self) -> Result<Vec<Activation>, StorageError> {
        let mut rows = Vec::new();
        for key in self.list_keys(ACTIVATION_PREFIX).await? {
            let row: Option<(Activation, Option<String>)> = self.load_json(&key).await?;
            if let Some((row, _)) = row {
                if row.status == ActivationStatus::Active {
                    rows.push(row);
                }
            }
        }

        let indexed = self.load_active_index().await?;
        for row in rows_missing_index(&rows, &indexed) {
            match self.sync_active_index(row).await {
                Ok(()) => info!(activation_id = %row.id, "Restored active index entry"),
                Err(e) => warn!(activation_id = %row.id, error = %e, "Active index repair failed"),
            }
        }
        Ok(rows)
    }

    async fn save_persona(&self, agent_id: &str, persona: &str) -> Result<(), StorageError> {
        let doc = PersonaDoc {
            persona: persona.to_string(),
        };
        self.save_json(&persona_key(agent_id), &doc, WriteGuard::None)
            .await?;
        self.personas
            .insert(agent_id.to_string(), persona.to_string())
            .await;
        Ok(())
    }

    async fn load_persona(&self, agent_id: &str) -> Result<Option<String>, StorageError> {
        if let Some(cached) = self.personas.get(agent_id).await {
            return Ok(Some(cached));
        }
        let doc: Option<(PersonaDoc, Option<String>)> =
            self.load_json(&persona_key(agent_id)).await?;
        let persona = doc.map(|(doc, _)| doc.persona);
        if let Some(persona) = &persona {
            self.personas
                .insert(agent_id.to_string(), persona.clone())
                .await;
        }
        Ok(persona)
    }

    async fn append_message(
        &self,
        activation_id: &str,
        message: Message,
    ) -> Result<(), StorageError> {
        let key = message_log_key(activation_id);
        let mut log: Vec<Message> = self
            .load_json(&key)
            .await?
            .map(|(log, _)| log)
            .unwrap_or_default();
        log.push(message);
        self.save_json(&key, &log, WriteGuard::None).await?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        activation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let log: Vec<Message> = self
            .load_json(&message_log_key(activation_id))
            .await?
            .map(|(log, _)| log)
            .unwrap_or_default();
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }

    async fn check_connection(&self) -> Result<(), String> {
        match self.client.list_buckets().send().await {
            Ok(_) => {
                info!("Successfully connected to R2 storage.");
                Ok(())
            }
            Err(e) => {
                let err_msg = format!("R2 connectivity test failed: {e:#?}");
                error!("{}", err_msg);
                Err(err_msg)
            }
        }
    }
}
