//! Agent persona generation and conversational replies
//!
//! After an activation the agent's personality text is generated once and
//! stored next to the activation rows; replies in the group are produced
//! from that persona plus the recent message log.

use crate::activation::{
    Activation, ActivationHook, ConversationResponder, Principal, ReplyError,
};
use crate::llm::{CompletionClient, LlmError};
use crate::storage::{ActivationStore, Message, StorageError};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const FALLBACK_PERSONA: &str =
    "You are a friendly, concise assistant taking part in a group chat.";

/// Errors from persona generation
#[derive(Debug, Error)]
pub enum PersonaError {
    /// Completion service failure
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// Store failure
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A store call did not answer in time
    #[error("store call timed out")]
    Timeout,
}

/// Generates personas after activation and answers group messages
pub struct PersonaService {
    store: Arc<dyn ActivationStore>,
    llm: CompletionClient,
    history_limit: usize,
    call_timeout: Duration,
}

impl PersonaService {
    /// Create a service keeping `history_limit` messages of context.
    ///
    /// Every store call is bounded by `call_timeout`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ActivationStore>,
        llm: CompletionClient,
        history_limit: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            llm,
            history_limit,
            call_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, PersonaError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| PersonaError::Timeout)?
            .map_err(PersonaError::from)
    }

    /// Generate and store the persona for `activation`'s agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the completion or the store write fails.
    pub async fn generate(&self, activation: &Activation) -> Result<String, PersonaError> {
        let persona = self.llm.complete(&persona_prompt(activation)).await?;
        let persona = persona.trim().to_string();
        self.bounded(self.store.save_persona(&activation.agent_id, &persona))
            .await?;
        info!(
            agent_id = %activation.agent_id,
            chars = persona.len(),
            "Persona generated"
        );
        Ok(persona)
    }

    async fn persona_for(&self, activation: &Activation) -> Result<String, PersonaError> {
        match self.bounded(self.store.load_persona(&activation.agent_id)).await? {
            Some(persona) => Ok(persona),
            None => {
                debug!(agent_id = %activation.agent_id, "No stored persona, using fallback");
                Ok(FALLBACK_PERSONA.to_string())
            }
        }
    }

    async fn answer(
        &self,
        activation: &Activation,
        author: &Principal,
        text: &str,
    ) -> Result<String, PersonaError> {
        let persona = self.persona_for(activation).await?;
        let history = self
            .bounded(self.store.recent_messages(&activation.id, self.history_limit))
            .await?;
        let author = author.display();
        let answer = self
            .llm
            .complete(&reply_prompt(&persona, &history, &author, text))
            .await?;

        let bot = activation
            .selected_bot
            .as_ref()
            .map_or_else(|| "agent".to_string(), ToString::to_string);
        for message in [Message::user(&author, text), Message::assistant(&bot, &answer)] {
            if let Err(e) = self
                .bounded(self.store.append_message(&activation.id, message))
                .await
            {
                warn!(activation_id = %activation.id, error = %e, "Failed to append message log");
            }
        }
        Ok(answer)
    }
}

#[async_trait]
impl ActivationHook for PersonaService {
    async fn on_activated(&self, activation: &Activation) -> anyhow::Result<()> {
        self.generate(activation).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationResponder for PersonaService {
    async fn reply(
        &self,
        activation: &Activation,
        author: &Principal,
        text: &str,
    ) -> Result<String, ReplyError> {
        self.answer(activation, author, text)
            .await
            .map_err(|e| match e {
                PersonaError::Llm(LlmError::RateLimit { wait_secs, .. }) => {
                    ReplyError::Busy { wait_secs }
                }
                other => ReplyError::Failed(other.to_string()),
            })
    }
}

fn persona_prompt(activation: &Activation) -> String {
    let window = activation.duration_hours.map_or_else(
        || "for an open-ended period".to_string(),
        |hours| format!("for the next {hours} hours"),
    );
    format!(
        "Write a short personality description (at most 120 words) for an AI agent \
         named \"{agent}\" that will take part in a Telegram group chat {window}. \
         Describe its tone, interests and how it addresses people. \
         Answer with the description only, in the second person (\"You are ...\").",
        agent = activation.agent_id,
    )
}

fn reply_prompt(persona: &str, history: &[Message], author: &str, text: &str) -> String {
    let mut prompt = format!("{persona}\n\n");
    if !history.is_empty() {
        prompt.push_str("Recent conversation:\n");
        for message in history {
            let _ = writeln!(prompt, "{}: {}", message.author, message.content);
        }
        prompt.push('\n');
    }
    let _ = write!(
        prompt,
        "New message from {author}:\n{text}\n\nReply in character, briefly, in the language of the message."
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompletionProvider;
    use crate::storage::InMemoryActivationStore;
    use std::time::Duration;

    fn service(store: Arc<InMemoryActivationStore>, mock: MockCompletionProvider) -> PersonaService {
        let llm = CompletionClient::new(Arc::new(mock), Duration::from_secs(5))
            .with_base_backoff(Duration::from_millis(1));
        PersonaService::new(store, llm, 4, Duration::from_secs(5))
    }

    fn alice() -> Principal {
        Principal {
            user_id: 1,
            username: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn test_hook_stores_persona() {
        let store = Arc::new(InMemoryActivationStore::new());
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete()
            .times(1)
            .returning(|_| Ok("  You are Captain Byte.  ".to_string()));
        let service = service(store.clone(), mock);

        let activation = Activation::pending("agent-9", "CODE", "@alice", Some(2));
        assert!(service.on_activated(&activation).await.is_ok());
        let stored = store.load_persona("agent-9").await.ok().flatten();
        assert_eq!(stored.as_deref(), Some("You are Captain Byte."));
    }

    #[tokio::test]
    async fn test_reply_uses_persona_and_logs_exchange() {
        let store = Arc::new(InMemoryActivationStore::new());
        store.save_persona("agent-9", "You are Captain Byte.").await.ok();

        let mut mock = MockCompletionProvider::new();
        mock.expect_complete()
            .withf(|prompt| prompt.starts_with("You are Captain Byte.") && prompt.contains("hello there"))
            .times(1)
            .returning(|_| Ok("Ahoy!".to_string()));
        let service = service(store.clone(), mock);

        let activation = Activation::pending("agent-9", "CODE", "@alice", None);
        let answer = service.reply(&activation, &alice(), "hello there").await;
        assert_eq!(answer.ok().as_deref(), Some("Ahoy!"));

        let log = store.recent_messages(&activation.id, 10).await.unwrap_or_default();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].author, "@alice");
        assert_eq!(log[1].content, "Ahoy!");
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_busy() {
        let store = Arc::new(InMemoryActivationStore::new());
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete().returning(|_| {
            Err(LlmError::RateLimit {
                wait_secs: None,
                message: "429".to_string(),
            })
        });
        let service = service(store, mock);
        let activation = Activation::pending("agent-9", "CODE", "@alice", None);
        let result = service.reply(&activation, &alice(), "hi").await;
        assert!(matches!(result, Err(ReplyError::Busy { wait_secs: None })));
    }

    #[tokio::test]
    async fn test_api_error_maps_to_failure() {
        let store = Arc::new(InMemoryActivationStore::new());
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete()
            .times(1)
            .returning(|_| Err(LlmError::ApiError("HTTP 400 bad request".to_string())));
        let service = service(store, mock);
        let activation = Activation::pending("agent-9", "CODE", "@alice", None);
        let result = service.reply(&activation, &alice(), "hi").await;
        assert!(matches!(result, Err(ReplyError::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_store_call_times_out() {
        let store = Arc::new(InMemoryActivationStore::new());
        let service = service(store, MockCompletionProvider::new());
        let result = service
            .bounded(std::future::pending::<Result<(), StorageError>>())
            .await;
        assert!(matches!(result, Err(PersonaError::Timeout)));
    }

    #[test]
    fn test_reply_prompt_includes_history() {
        let history = vec![Message::user("@bob", "first"), Message::assistant("@bot", "second")];
        let prompt = reply_prompt("You are X.", &history, "@alice", "third");
        assert!(prompt.contains("@bob: first"));
        assert!(prompt.contains("@bot: second"));
        assert!(prompt.contains("New message from @alice:\nthird"));
    }
}
