use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A token bucket ran dry.
///
/// ```rust
/// use sm_harness::rate_limiter::{RateLimiter, RateLimitConfig, RateLimitError};
///
/// let limiter = RateLimiter::new(RateLimitConfig::per_second(1));
/// limiter.check("connect:alice").unwrap();
/// match limiter.check("connect:alice") {
///     Err(RateLimitError::Exceeded { retry_after, .. }) => assert!(retry_after.as_millis() > 0),
///     Ok(()) => unreachable!(),
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for key `{key}`, retry after {retry_after:?}")]
    Exceeded {
        /// The bucket key that ran out.
        key: String,
        /// Time until one token is available again.
        retry_after: Duration,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub tokens_per_second: f64,
    /// Bucket capacity.
    pub max_burst: f64,
}

impl RateLimitConfig {
    pub fn per_second(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64,
            max_burst: count as f64,
        }
    }

    pub fn per_minute(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64 / 60.0,
            max_burst: count as f64,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.max_burst = burst as f64;
        self
    }
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_burst: f64) -> Self {
        Self {
            tokens: max_burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, config: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.tokens_per_second).min(config.max_burst);
        self.last_refill = now;
    }

    fn try_consume(&mut self, cost: f64, config: &RateLimitConfig) -> Result<(), Duration> {
        self.refill(config);
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else if config.tokens_per_second <= 0.0 {
            Err(Duration::MAX)
        } else {
            Err(Duration::from_secs_f64(
                (cost - self.tokens) / config.tokens_per_second,
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Token bucket per key. Keys are created lazily on first check.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        self.check_with_cost(key, 1.0)
    }

    pub fn check_with_cost(&self, key: &str, cost: f64) -> Result<(), RateLimitError> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.max_burst));

        bucket
            .try_consume(cost, &self.config)
            .map_err(|retry_after| {
                warn!(key, ?retry_after, "rate limit exceeded");
                RateLimitError::Exceeded {
                    key: key.to_string(),
                    retry_after,
                }
            })
    }

    /// Approximate tokens left for `key`.
    pub fn remaining(&self, key: &str) -> f64 {
        match self.buckets.get(key) {
            Some(bucket) => {
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                (bucket.tokens + elapsed * self.config.tokens_per_second).min(self.config.max_burst)
            }
            None => self.config.max_burst,
        }
    }

    /// Drop buckets that would be full again; they carry no state worth keeping.
    pub fn prune(&self) -> usize {
        let before = self.buckets.len();
        let config = &self.config;
        self.buckets.retain(|_, bucket| {
            let elapsed = bucket.last_refill.elapsed().as_secs_f64();
            bucket.tokens + elapsed * config.tokens_per_second < config.max_burst
        });
        before - self.buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

// ---------------------------------------------------------------------------
// ServiceLimits
// ---------------------------------------------------------------------------

/// Per-principal limits for the two expensive entry points: opening a
/// remote session and asking the AI assistant.
#[derive(Debug)]
pub struct ServiceLimits {
    connect: RateLimiter,
    ai: RateLimiter,
}

impl ServiceLimits {
    pub fn new(connect: RateLimitConfig, ai: RateLimitConfig) -> Self {
        Self {
            connect: RateLimiter::new(connect),
            ai: RateLimiter::new(ai),
        }
    }

    pub fn per_minute(connect_per_minute: u64, ai_per_minute: u64) -> Self {
        Self::new(
            RateLimitConfig::per_minute(connect_per_minute),
            RateLimitConfig::per_minute(ai_per_minute),
        )
    }

    /// Limits high enough to never trigger in practice.
    pub fn unlimited() -> Self {
        Self::per_minute(u32::MAX as u64, u32::MAX as u64)
    }

    pub fn check_connect(&self, principal: &str) -> Result<(), RateLimitError> {
        self.connect.check(&format!("connect:{principal}"))
    }

    pub fn check_ai(&self, principal: &str) -> Result<(), RateLimitError> {
        self.ai.check(&format!("ai:{principal}"))
    }

    pub fn prune(&self) -> usize {
        self.connect.prune() + self.ai.prune()
    }
}
