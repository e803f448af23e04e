//! Activation attempt rate limiting
//!
//! Attempts for a bot/group pair are counted until a gap longer than the
//! window passes between two admitted attempts, which resets the count.
//! Once the limit is reached further attempts are refused until the pair has
//! been quiet for the cooldown period, measured from the last admitted
//! attempt.

use super::runtime_state::{ActivationRuntimeState, RuntimeKey, RuntimeStateStore};
use crate::config::RateLimitSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The attempt may proceed
    Allowed,
    /// The attempt is refused; retry after `wait`
    Limited {
        /// Remaining cooldown
        wait: Duration,
    },
}

/// Decide on an attempt and update the record in place
#[must_use]
pub fn evaluate(
    state: &mut ActivationRuntimeState,
    limits: &RateLimitSettings,
    now: Instant,
) -> RateDecision {
    let elapsed = state.last_attempt.map(|last| now.saturating_duration_since(last));

    if state.attempts >= limits.max_attempts {
        match elapsed {
            Some(elapsed) if elapsed < limits.cooldown => {
                // Refusals are counted but do not move the cooldown anchor
                state.attempts = state.attempts.saturating_add(1);
                return RateDecision::Limited {
                    wait: limits.cooldown - elapsed,
                };
            }
            _ => state.attempts = 0,
        }
    } else if elapsed.is_some_and(|elapsed| elapsed > limits.window) {
        state.attempts = 0;
    }

    state.attempts += 1;
    state.last_attempt = Some(now);
    RateDecision::Allowed
}

/// Rate limiter over the shared runtime state
#[derive(Clone)]
pub struct RateLimiter {
    runtime: Arc<RuntimeStateStore>,
    limits: RateLimitSettings,
}

impl RateLimiter {
    /// Create a limiter reading and writing `runtime`
    #[must_use]
    pub const fn new(runtime: Arc<RuntimeStateStore>, limits: RateLimitSettings) -> Self {
        Self { runtime, limits }
    }

    /// Check whether a new attempt for `key` is permitted now
    pub async fn check(&self, key: &RuntimeKey) -> RateDecision {
        self.check_at(key, Instant::now()).await
    }

    /// Check at an explicit instant
    pub async fn check_at(&self, key: &RuntimeKey, now: Instant) -> RateDecision {
        let limits = self.limits;
        let (decision, attempts) = self
            .runtime
            .with_state(key, |state| (evaluate(state, &limits, now), state.attempts))
            .await;

        match decision {
            RateDecision::Allowed => {
                debug!(bot = %key.bot, group = key.group, attempts, "Activation attempt admitted");
            }
            RateDecision::Limited { wait } => {
                info!(
                    bot = %key.bot,
                    group = key.group,
                    attempts,
                    wait_secs = wait.as_secs(),
                    "Activation attempt rate limited"
                );
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::BotIdentity;
    use proptest::prelude::*;

    fn limits() -> RateLimitSettings {
        RateLimitSettings {
            max_attempts: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_sixth_attempt_in_window_is_rejected() {
        let mut state = ActivationRuntimeState::default();
        let start = Instant::now();

        for i in 0..5 {
            let now = start + Duration::from_secs(i * 10);
            assert_eq!(evaluate(&mut state, &limits(), now), RateDecision::Allowed);
        }

        let sixth = start + Duration::from_secs(50);
        let RateDecision::Limited { wait } = evaluate(&mut state, &limits(), sixth) else {
            panic!("sixth attempt must be limited");
        };
        // Cooldown is anchored at the fifth admitted attempt (t=40s)
        assert_eq!(wait, Duration::from_secs(290));
    }

    #[test]
    fn test_counter_resets_after_cooldown() {
        let mut state = ActivationRuntimeState::default();
        let start = Instant::now();
        for _ in 0..5 {
            let _ = evaluate(&mut state, &limits(), start);
        }
        assert!(matches!(
            evaluate(&mut state, &limits(), start + Duration::from_secs(1)),
            RateDecision::Limited { .. }
        ));

        let later = start + Duration::from_secs(300);
        assert_eq!(evaluate(&mut state, &limits(), later), RateDecision::Allowed);
        assert_eq!(state.attempts, 1);
    }

    #[test]
    fn test_window_expiry_resets_below_limit() {
        let mut state = ActivationRuntimeState::default();
        let start = Instant::now();
        for _ in 0..4 {
            let _ = evaluate(&mut state, &limits(), start);
        }
        let after_window = start + Duration::from_secs(61);
        assert_eq!(
            evaluate(&mut state, &limits(), after_window),
            RateDecision::Allowed
        );
        assert_eq!(state.attempts, 1);
    }

    #[test]
    fn test_refusal_counts_but_keeps_anchor() {
        let mut state = ActivationRuntimeState::default();
        let start = Instant::now();
        for _ in 0..5 {
            let _ = evaluate(&mut state, &limits(), start);
        }
        let _ = evaluate(&mut state, &limits(), start + Duration::from_secs(5));
        assert_eq!(state.attempts, 6);
        assert_eq!(state.last_attempt, Some(start));
    }

    #[tokio::test]
    async fn test_limiter_uses_shared_state() {
        let runtime = Arc::new(RuntimeStateStore::new());
        let limiter = RateLimiter::new(runtime.clone(), limits());
        let key = RuntimeKey::new(BotIdentity::new("b1"), -1);

        let now = Instant::now();
        assert_eq!(limiter.check_at(&key, now).await, RateDecision::Allowed);
        assert_eq!(runtime.state(&key).await.attempts, 1);
    }

    proptest! {
        /// Within one window no more than `max_attempts` attempts are admitted.
        #[test]
        fn never_admits_more_than_max_in_window(offsets in proptest::collection::vec(0u64..60, 1..40)) {
            let mut sorted = offsets;
            sorted.sort_unstable();
            let mut state = ActivationRuntimeState::default();
            let start = Instant::now();
            let admitted = sorted
                .iter()
                .filter(|secs| {
                    evaluate(&mut state, &limits(), start + Duration::from_secs(**secs))
                        == RateDecision::Allowed
                })
                .count();
            prop_assert!(admitted <= 5);
        }
    }
}
