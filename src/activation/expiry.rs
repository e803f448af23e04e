//! Lazy activation expiry
//!
//! Expiry is evaluated on access: every conversational event for an active
//! pairing checks the window end first. A pairing that receives no traffic
//! after its end stays `active` in storage until the next access or the
//! optional sweep.

use super::{Activation, ActivationPatch, ActivationStatus};
use crate::storage::{ActivationStore, StorageError};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Whether a window ending at `end` is over at `now`.
///
/// `None` is an indefinite window. The end instant itself is still inside.
#[must_use]
pub fn is_expired(end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    end.is_some_and(|end| now > end)
}

/// Result of an expiry check on an active row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Window still open; proceed
    Live,
    /// This call moved the row to `expired`
    Expired,
    /// The row was already moved by a concurrent writer
    AlreadyClosed,
}

/// Expire `activation` if its window is over, using a guarded update.
///
/// # Errors
///
/// Returns a `StorageError` if the conditional update fails.
pub async fn expire_if_due(
    store: &dyn ActivationStore,
    activation: &Activation,
    now: DateTime<Utc>,
) -> Result<ExpiryOutcome, StorageError> {
    if !is_expired(activation.activation_end, now) {
        return Ok(ExpiryOutcome::Live);
    }

    let applied = store
        .compare_and_update(
            &activation.id,
            ActivationStatus::Active,
            ActivationPatch::close(ActivationStatus::Expired, None),
        )
        .await?;

    if applied {
        info!(
            activation_id = %activation.id,
            group = ?activation.group_id,
            "Activation expired"
        );
        Ok(ExpiryOutcome::Expired)
    } else {
        debug!(activation_id = %activation.id, "Activation already closed by another writer");
        Ok(ExpiryOutcome::AlreadyClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{window_end, BotIdentity};
    use crate::storage::{InMemoryActivationStore, MockActivationStore};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    #[test]
    fn test_three_hour_window_boundaries() {
        let end = window_end(t0(), Some(3));
        assert!(!is_expired(end, t0()));
        assert!(!is_expired(end, t0() + Duration::hours(3)));
        assert!(is_expired(end, t0() + Duration::hours(3) + Duration::seconds(1)));
    }

    #[test]
    fn test_indefinite_never_expires() {
        assert!(!is_expired(None, t0() + Duration::days(10_000)));
    }

    async fn active_row(store: &InMemoryActivationStore, hours: u32) -> Activation {
        let row = Activation::pending("agent", "CODE1", "@alice", Some(hours));
        let id = row.id.clone();
        let _ = store.insert(row).await;
        let patch = ActivationPatch::activate(-1, BotIdentity::new("b1"), t0(), window_end(t0(), Some(hours)));
        let _ = store.compare_and_update(&id, ActivationStatus::Pending, patch).await;
        store.get(&id).await.ok().flatten().unwrap_or_else(|| panic!("row exists"))
    }

    #[tokio::test]
    async fn test_expire_if_due_transitions_once() {
        let store = InMemoryActivationStore::new();
        let row = active_row(&store, 3).await;
        let late = t0() + Duration::hours(4);

        assert_eq!(expire_if_due(&store, &row, late).await.ok(), Some(ExpiryOutcome::Expired));
        assert_eq!(
            expire_if_due(&store, &row, late).await.ok(),
            Some(ExpiryOutcome::AlreadyClosed)
        );
        let stored = store.get(&row.id).await.ok().flatten();
        assert_eq!(stored.map(|r| r.status), Some(ActivationStatus::Expired));
    }

    #[tokio::test]
    async fn test_live_row_does_not_touch_store() {
        let mut store = MockActivationStore::new();
        store.expect_compare_and_update().never();
        let mut row = Activation::pending("agent", "CODE1", "@alice", Some(3));
        row.status = ActivationStatus::Active;
        row.activation_end = window_end(t0(), Some(3));

        let outcome = expire_if_due(&store, &row, t0() + Duration::hours(1)).await;
        assert_eq!(outcome.ok(), Some(ExpiryOutcome::Live));
    }

    proptest! {
        /// A bounded window reports expired exactly when `now` is past the end.
        #[test]
        fn expired_iff_past_end(hours in 1u32..1000, offset_secs in -100_000i64..100_000) {
            let end = window_end(t0(), Some(hours));
            let now = t0() + Duration::hours(i64::from(hours)) + Duration::seconds(offset_secs);
            prop_assert_eq!(is_expired(end, now), offset_secs > 0);
        }
    }
}
