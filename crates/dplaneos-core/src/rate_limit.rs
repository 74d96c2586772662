//! Per-IP rate limiting (C6).
//!
//! A plain sliding-window counter per key, held behind an `RwLock<HashMap>`.
//! The login bucket additionally tracks consecutive failures and grows its
//! own backoff on top of the shared window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::RateLimitError;

struct Window {
    hits: Vec<Instant>,
}

struct FailureState {
    consecutive: u32,
    locked_until: Instant,
}

/// Ceiling on the exponential backoff applied after repeated consecutive
/// failures, so a key is never locked out longer than 15 minutes.
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

pub struct RateLimiter {
    windows: RwLock<HashMap<String, Window>>,
    failures: RwLock<HashMap<String, FailureState>>,
    limit: usize,
    period: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: usize, period: Duration) -> Self {
        Self { windows: RwLock::new(HashMap::new()), failures: RwLock::new(HashMap::new()), limit, period }
    }

    /// Default general-purpose limiter: 100 requests/minute per key.
    #[must_use]
    pub fn default_general() -> Self {
        Self::new(100, Duration::from_secs(60))
    }

    /// Stricter login-bucket limiter: 5 attempts/minute per key.
    #[must_use]
    pub fn default_login() -> Self {
        Self::new(5, Duration::from_secs(60))
    }

    /// Records a hit for `key` and returns an error once the sliding
    /// window limit is exceeded.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exceeded`] once `key` has made more than
    /// `limit` requests within `period`.
    pub async fn check(&self, key: &str) -> Result<(), RateLimitError> {
        let now = Instant::now();

        if let Some(state) = self.failures.read().await.get(key) {
            if now < state.locked_until {
                let retry_after = state.locked_until.duration_since(now).as_secs().max(1);
                return Err(RateLimitError::Exceeded { retry_after_secs: retry_after });
            }
        }

        let mut windows = self.windows.write().await;
        let window = windows.entry(key.to_string()).or_insert_with(|| Window { hits: Vec::new() });
        window.hits.retain(|t| now.duration_since(*t) < self.period);

        if window.hits.len() >= self.limit {
            let retry_after = self
                .period
                .saturating_sub(now.duration_since(window.hits[0]))
                .as_secs();
            return Err(RateLimitError::Exceeded { retry_after_secs: retry_after.max(1) });
        }

        window.hits.push(now);
        Ok(())
    }

    /// Records a failed attempt for `key`, doubling its lockout window each
    /// consecutive failure (1s, 2s, 4s, ... capped at [`MAX_BACKOFF`]). Call
    /// this from callers that know whether the request behind a `check()`
    /// ultimately failed, e.g. a login handler after a bad password.
    pub async fn record_failure(&self, key: &str) {
        let mut failures = self.failures.write().await;
        let consecutive = failures.get(key).map_or(1, |s| s.consecutive.saturating_add(1));
        let backoff = Duration::from_secs(1 << consecutive.min(10)).min(MAX_BACKOFF);
        failures.insert(key.to_string(), FailureState { consecutive, locked_until: Instant::now() + backoff });
    }

    /// Clears any accumulated backoff for `key` after a successful attempt.
    pub async fn record_success(&self, key: &str) {
        self.failures.write().await.remove(key);
    }

    /// Drops any windows that have had no activity for a full period,
    /// bounding memory use for long-running processes seeing many
    /// distinct IPs.
    pub async fn sweep_idle(&self) {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        windows.retain(|_, window| {
            window.hits.retain(|t| now.duration_since(*t) < self.period);
            !window.hits.is_empty()
        });
        self.failures.write().await.retain(|_, state| now < state.locked_until);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            limiter.check("1.2.3.4").await.unwrap();
        }
        let err = limiter.check("1.2.3.4").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Exceeded { .. }));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.check("a").await.unwrap();
        limiter.check("b").await.unwrap();
    }

    #[tokio::test]
    async fn consecutive_failures_lock_out_the_key() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60));
        limiter.record_failure("1.2.3.4").await;
        let err = limiter.check("1.2.3.4").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Exceeded { retry_after_secs } if retry_after_secs >= 1));
    }

    #[tokio::test]
    async fn success_clears_the_lockout() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60));
        limiter.record_failure("1.2.3.4").await;
        limiter.record_success("1.2.3.4").await;
        limiter.check("1.2.3.4").await.unwrap();
    }
}
