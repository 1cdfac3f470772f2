//! Composable policy structs replacing the source's decorator-based
//! retry/circuit-breaker/cron wrappers (spec §9).
//!
//! These are plain data; each consumer (the broker adapter, the discovery
//! worker's outbound HTTP client, the scheduler's cron wiring) interprets
//! the policy itself rather than being wrapped by it.

use std::time::Duration;

/// `tries=3, delay=2s, backoff=1, max_delay=5s` mirrors
/// `retry_async.retry(...)` in the original `rmq_publisher.py`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub tries: u32,
    pub delay: Duration,
    pub backoff: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(tries: u32, delay: Duration, backoff: u32, max_delay: Duration) -> Self {
        Self {
            tries,
            delay,
            backoff,
            max_delay,
        }
    }

    /// Delay before the `attempt`-th retry (1-indexed), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff <= 1 {
            return self.delay.min(self.max_delay);
        }
        let scaled = self.delay.as_millis() as u64 * (self.backoff as u64).pow(attempt.saturating_sub(1));
        Duration::from_millis(scaled).min(self.max_delay)
    }
}

/// Default broker publish retry policy from spec §4.3: 3 tries, 2s/2s
/// delays, capped at 5s.
pub const BROKER_PUBLISH_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(2), 1, Duration::from_secs(5));

/// Outbound discovery-worker HTTP retry policy from spec §7.
pub const DISCOVERY_HTTP_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(2), 1, Duration::from_secs(5));

/// Per-attempt total timeout for the discovery worker's outbound HTTP GET, spec §6.
pub const DISCOVERY_HTTP_TIMEOUT: Duration = Duration::from_secs(3);

/// `failure_threshold=3, recovery_timeout=5s` from spec §7.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

pub const DISCOVERY_BREAKER: BreakerPolicy = BreakerPolicy {
    failure_threshold: 3,
    recovery_timeout: Duration::from_secs(5),
};

/// A minimal circuit breaker: counts consecutive failures, opens for
/// `recovery_timeout` once `failure_threshold` is reached, half-opens on
/// the next call after that.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    consecutive_failures: u32,
    opened_at: Option<std::time::Instant>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Returns `true` if a call should be rejected without attempting it.
    pub fn is_open(&mut self) -> bool {
        match self.opened_at {
            Some(at) if at.elapsed() >= self.policy.recovery_timeout => {
                // Half-open: allow the next call through, reset bookkeeping
                // eagerly so a single success fully closes the breaker.
                self.opened_at = None;
                self.consecutive_failures = 0;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.policy.failure_threshold {
            self.opened_at = Some(std::time::Instant::now());
        }
    }
}

/// Cron cadence for a scheduler tick loop plus an optional repetition cap,
/// used for tests that need a bounded loop.
#[derive(Debug, Clone)]
pub struct CronPolicy {
    pub expression: String,
    pub max_repetitions: Option<u64>,
}

impl CronPolicy {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            max_repetitions: None,
        }
    }
}

/// `*/5 * * * *` — spec §4.2 scheduled-item loop cadence.
pub const SCHEDULED_CRON: &str = "0 */5 * * * *";
/// `*/10 * * * *` — spec §4.2 predefined-item loop cadence.
pub const PREDEFINED_CRON: &str = "0 */10 * * * *";
