//! Private-chat notice flood protection
//!
//! Users who send `/activate` to a bot directly get one explanation per
//! cooldown period; further attempts are silently dropped.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cooldown cache keyed by user id
#[derive(Clone)]
pub struct NoticeThrottle {
    cache: Cache<i64, ()>,
    silenced_count: Arc<AtomicU64>,
}

impl NoticeThrottle {
    /// Create a throttle answering each user at most once per `cooldown`
    #[must_use]
    pub fn new(cooldown: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(cooldown)
            .build();

        Self {
            cache,
            silenced_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether `user_id` should be answered now.
    ///
    /// A `true` result starts the cooldown for that user.
    pub async fn should_send(&self, user_id: i64) -> bool {
        let entry = self.cache.entry(user_id).or_insert(()).await;
        if entry.is_fresh() {
            return true;
        }

        let count = self.silenced_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(silenced = count, recent_user = user_id, "Private notices silenced");
        }
        false
    }

    /// Total number of silenced notices
    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced_count.load(Ordering::Relaxed)
    }
}
