use std::time::Duration;

// ---------------------------------------------------------------------------
// BackoffConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped.round() as u64)
    }
}

// ---------------------------------------------------------------------------
// Backoff state machine
// ---------------------------------------------------------------------------

/// Where a retry loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    /// Next call to `next_delay` starts attempt `attempt` (1-based).
    Ready { attempt: u32 },
    /// Every allowed attempt has been used.
    Exhausted { attempts: u32 },
}

/// Explicit bounded retry schedule.
///
/// ```rust
/// use sm_harness::backoff::{Backoff, BackoffConfig};
/// use std::time::Duration;
///
/// let mut b = Backoff::new(BackoffConfig::new(2, Duration::from_millis(10)));
/// assert_eq!(b.next_delay(), Some(Duration::ZERO));           // first attempt
/// assert_eq!(b.next_delay(), Some(Duration::from_millis(10))); // retry 1
/// assert_eq!(b.next_delay(), Some(Duration::from_millis(20))); // retry 2
/// assert_eq!(b.next_delay(), None);
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    state: BackoffState,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: BackoffState::Ready { attempt: 1 },
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        match self.state {
            BackoffState::Ready { attempt } => attempt - 1,
            BackoffState::Exhausted { attempts } => attempts,
        }
    }

    /// Advance to the next attempt. Returns how long to wait before making it,
    /// or `None` once the schedule is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let BackoffState::Ready { attempt } = self.state else {
            return None;
        };
        let total = self.config.max_retries + 1;
        self.state = if attempt >= total {
            BackoffState::Exhausted { attempts: attempt }
        } else {
            BackoffState::Ready {
                attempt: attempt + 1,
            }
        };
        if attempt == 1 {
            Some(Duration::ZERO)
        } else {
            Some(self.config.delay_for(attempt - 2))
        }
    }

    /// Give up early (e.g. on a non-retryable error).
    pub fn abort(&mut self) {
        self.state = BackoffState::Exhausted {
            attempts: self.attempts(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_retries_allows_one_attempt() {
        let mut b = Backoff::new(BackoffConfig::new(0, Duration::from_millis(5)));
        assert_eq!(b.next_delay(), Some(Duration::ZERO));
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.state(), BackoffState::Exhausted { attempts: 1 });
        assert_eq!(b.attempts(), 1);
    }

    #[test]
    fn delays_grow_and_cap() {
        let config = BackoffConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            multiplier: 2.0,
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(300));
        assert_eq!(config.delay_for(7), Duration::from_millis(300));
    }

    #[test]
    fn abort_stops_schedule() {
        let mut b = Backoff::new(BackoffConfig::new(3, Duration::from_millis(1)));
        b.next_delay();
        b.abort();
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempts(), 1);
    }
}
