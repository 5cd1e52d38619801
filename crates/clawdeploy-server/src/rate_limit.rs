//! Per-owner sliding-window limiter for the mutating instance endpoints.
//!
//! Each owner keeps the timestamps of its admitted requests inside the
//! window. Owners with no recent requests are dropped by a cleanup pass that
//! runs at most once per cleanup interval.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Returned when an owner is over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAfter {
    pub secs: u64,
}

#[derive(Debug)]
struct LimiterState {
    requests: HashMap<String, Vec<Instant>>,
    last_cleanup: Instant,
}

#[derive(Debug)]
pub struct OwnerRateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl OwnerRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                requests: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Admits and records one request for `owner`, or reports how long to wait.
    pub fn check(&self, owner: &str) -> Result<(), RetryAfter> {
        self.check_at(owner, Instant::now())
    }

    fn check_at(&self, owner: &str, now: Instant) -> Result<(), RetryAfter> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if now.saturating_duration_since(state.last_cleanup) >= self.config.cleanup_interval {
            let window = self.config.window;
            let before = state.requests.len();
            state.requests.retain(|_, timestamps| {
                timestamps.retain(|&t| now.saturating_duration_since(t) < window);
                !timestamps.is_empty()
            });
            debug!(
                dropped = before - state.requests.len(),
                tracked = state.requests.len(),
                "rate limiter cleanup"
            );
            state.last_cleanup = now;
        }

        let window = self.config.window;
        let timestamps = state.requests.entry(owner.to_string()).or_default();
        timestamps.retain(|&t| now.saturating_duration_since(t) < window);

        if timestamps.len() >= self.config.max_requests {
            let oldest = timestamps[0];
            let remaining = (oldest + window).saturating_duration_since(now);
            let secs = remaining.as_millis().div_ceil(1000).max(1) as u64;
            warn!(
                owner_id = %owner,
                requests = timestamps.len(),
                max = self.config.max_requests,
                retry_after = secs,
                "rate limit exceeded"
            );
            return Err(RetryAfter { secs });
        }

        timestamps.push(now);
        Ok(())
    }

    #[cfg(test)]
    fn tracked_owners(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .requests
            .len()
    }
}
