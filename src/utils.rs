//! Telegram call helpers: retry with backoff and message length limits.

use anyhow::Result;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

/// Longest text Telegram accepts in one message
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Error fragments that no retry can fix
const PERMANENT_ERRORS: &[&str] = &[
    "message to delete not found",
    "message can't be deleted",
    "chat not found",
    "bot was kicked",
    "bot is not a member",
    "not enough rights",
    "forbidden",
];

/// Whether a Telegram error is worth retrying
#[must_use]
pub fn is_transient_telegram_error(error: &anyhow::Error) -> bool {
    let message = error.to_string().to_lowercase();
    !PERMANENT_ERRORS
        .iter()
        .any(|fragment| message.contains(fragment))
}

/// Truncate a string to at most `max_chars` characters
#[must_use]
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Executes a Telegram API operation with retry logic.
///
/// Transient failures are retried with exponential backoff and jitter;
/// permanent ones (see [`is_transient_telegram_error`]) fail immediately.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted.
///
/// # Examples
///
/// ```no_run
/// use activation_bot::utils::retry_telegram_operation;
/// use anyhow::Result;
///
/// async fn fetch_admins() -> Result<Vec<i64>> {
///     Ok(vec![])
/// }
///
/// # async fn example() -> Result<()> {
/// let admins = retry_telegram_operation(|| async { fetch_admins().await }).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::config::{
        TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
    };

    let retry_strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    RetryIf::spawn(retry_strategy, operation, is_transient_telegram_error)
        .await
        .map_err(|e| {
            warn!(
                max_retries = TELEGRAM_API_MAX_RETRIES,
                error = %e,
                "Telegram API operation failed"
            );
            e
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_truncate_str_unicode() {
        let s = "Привет, мир!";
        assert_eq!(truncate_str(s, 6), "Привет");
        assert_eq!(truncate_str(s, 50), "Привет, мир!");
    }

    #[test]
    fn test_permanent_errors_are_not_transient() {
        let gone = anyhow::anyhow!("Bad Request: message to delete not found");
        assert!(!is_transient_telegram_error(&gone));
        let network = anyhow::anyhow!("A network error: connection reset");
        assert!(is_transient_telegram_error(&network));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failure() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = retry_telegram_operation(|| async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow::anyhow!("timed out"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = retry_telegram_operation(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("Forbidden: bot was kicked from the group chat"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
