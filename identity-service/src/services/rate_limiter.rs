//! Sliding-window rate limiting.
//!
//! The Redis limiter keeps one sorted set per key (`ratelimit:<key>`) with a
//! member per accepted attempt scored by its timestamp. `LocalRateLimiter`
//! keeps keyed `governor` quotas in process memory instead.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use governor::{
    clock::{Clock, DefaultClock},
    middleware::StateInformationMiddleware,
    state::keyed::DashMapStateStore,
    Quota,
};
use redis::Script;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

use super::redis::RedisService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Attempts left in the current window after this one.
    pub remaining: u32,
    /// Seconds until the oldest attempt leaves the window. Zero when allowed.
    pub retry_after_seconds: u64,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record an attempt on `key` if fewer than `limit` were accepted in the
    /// last `window_seconds`.
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, anyhow::Error>;
}

// KEYS[1] window set
// ARGV[1] now ms, ARGV[2] window ms, ARGV[3] limit, ARGV[4] member
fn sliding_window_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        Script::new(
            r#"
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])
            redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
            local count = redis.call('ZCARD', KEYS[1])
            if count >= limit then
                local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
                local oldest_ms = tonumber(oldest[2]) or now
                return {0, 0, oldest_ms + window - now}
            end
            redis.call('ZADD', KEYS[1], now, ARGV[4])
            redis.call('PEXPIRE', KEYS[1], window)
            return {1, limit - count - 1, 0}
            "#,
        )
    })
}

fn retry_after(millis: i64) -> u64 {
    // Round up so callers never retry inside the window.
    (millis.max(0) as u64).div_ceil(1000)
}

#[async_trait]
impl RateLimiter for RedisService {
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, anyhow::Error> {
        let mut conn = self.connection();
        let (allowed, remaining, retry_ms): (i64, i64, i64) = sliding_window_script()
            .key(format!("ratelimit:{}", key))
            .arg(Utc::now().timestamp_millis())
            .arg(window_seconds.saturating_mul(1000))
            .arg(limit)
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Rate limiter check failed: {}", e))?;

        Ok(RateLimitDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u32,
            retry_after_seconds: retry_after(retry_ms),
        })
    }
}

type KeyedLimiter =
    governor::RateLimiter<String, DashMapStateStore<String>, DefaultClock, StateInformationMiddleware>;

/// Keys a single quota may track before replenished entries are swept.
const SWEEP_THRESHOLD: usize = 10_000;

/// `limit` attempts as a burst, refilled one every `window / limit`.
fn quota(limit: u32, window_seconds: u64) -> Result<Quota, anyhow::Error> {
    let burst = NonZeroU32::new(limit)
        .ok_or_else(|| anyhow::anyhow!("Rate limit must allow at least one attempt"))?;
    let period = Duration::from_millis(window_seconds.saturating_mul(1000) / u64::from(limit));

    Quota::with_period(period)
        .map(|quota| quota.allow_burst(burst))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Rate limit window of {}s is too short for {} attempts",
                window_seconds,
                limit
            )
        })
}

/// In-process limiter for single-instance deployments and tests. One keyed
/// `governor` limiter per distinct (limit, window) pair.
pub struct LocalRateLimiter {
    limiters: DashMap<(u32, u64), Arc<KeyedLimiter>>,
    sweep_threshold: usize,
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRateLimiter {
    pub fn new() -> Self {
        Self::with_sweep_threshold(SWEEP_THRESHOLD)
    }

    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        Self {
            limiters: DashMap::new(),
            sweep_threshold,
        }
    }

    fn limiter(&self, limit: u32, window_seconds: u64) -> Result<Arc<KeyedLimiter>, anyhow::Error> {
        if let Some(limiter) = self.limiters.get(&(limit, window_seconds)) {
            return Ok(limiter.clone());
        }

        let quota = quota(limit, window_seconds)?;
        Ok(self
            .limiters
            .entry((limit, window_seconds))
            .or_insert_with(|| {
                Arc::new(
                    governor::RateLimiter::dashmap(quota)
                        .with_middleware::<StateInformationMiddleware>(),
                )
            })
            .clone())
    }

    /// Forget keys whose quota has fully replenished.
    pub fn sweep(&self) {
        for limiter in self.limiters.iter() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiters.iter().map(|limiter| limiter.len()).sum()
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, anyhow::Error> {
        let limiter = self.limiter(limit, window_seconds)?;

        let decision = match limiter.check_key(&key.to_string()) {
            Ok(snapshot) => RateLimitDecision {
                allowed: true,
                remaining: snapshot.remaining_burst_capacity(),
                retry_after_seconds: 0,
            },
            Err(negative) => {
                let wait = negative.wait_time_from(DefaultClock::default().now());
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after_seconds: retry_after(wait.as_millis() as i64),
                }
            }
        };

        if limiter.len() > self.sweep_threshold {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_then_reject() {
        let limiter = LocalRateLimiter::new();

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check("login:a@example.com", 5, 900).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = limiter.check("login:a@example.com", 5, 900).await.unwrap();
        assert!(!decision.allowed);
        // One attempt comes back every 900 / 5 seconds.
        assert!((1..=180).contains(&decision.retry_after_seconds));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = LocalRateLimiter::new();

        assert!(limiter.check("login:a", 1, 60).await.unwrap().allowed);
        assert!(limiter.check("login:b", 1, 60).await.unwrap().allowed);
        assert!(!limiter.check("login:a", 1, 60).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_quotas_are_separate_per_limit() {
        let limiter = LocalRateLimiter::new();

        assert!(limiter.check("mfa:t", 1, 60).await.unwrap().allowed);
        assert!(limiter.check("mfa:t", 2, 60).await.unwrap().allowed);
        assert!(!limiter.check("mfa:t", 1, 60).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_replenished_keys_are_swept() {
        let limiter = LocalRateLimiter::with_sweep_threshold(1);

        assert!(limiter.check("login:old", 1, 1).await.unwrap().allowed);
        limiter.sweep();
        assert_eq!(limiter.tracked_keys(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // Crossing the threshold sweeps the replenished key.
        assert!(limiter.check("login:new", 1, 1).await.unwrap().allowed);
        assert_eq!(limiter.tracked_keys(), 1);
        assert!(!limiter.check("login:new", 1, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_degenerate_limits_are_errors() {
        let limiter = LocalRateLimiter::new();
        assert!(limiter.check("k", 0, 60).await.is_err());
        assert!(limiter.check("k", 5000, 1).await.is_err());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after(1), 1);
        assert_eq!(retry_after(1000), 1);
        assert_eq!(retry_after(1001), 2);
        assert_eq!(retry_after(-5), 0);
    }
}
