//! Per-connection token bucket
//!
//! Capacity `burst`, refill `ops_per_sec`. Tokens refill lazily on each
//! admission check as `floor(elapsed_ms * rate / 1000)`, clamped to
//! capacity. The clock is monotonic.

use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub ops_per_sec: u64,
    pub burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ops_per_sec: 10,
            burst: 20,
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            tokens: config.burst,
            last_refill: Instant::now(),
        }
    }

    /// Admit one operation if a token is available.
    pub fn allow(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_refill).as_millis() as u64;
        let earned = elapsed_ms * self.config.ops_per_sec / 1000;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.config.burst);
            // advance only by the time the earned tokens account for, so
            // fractional progress is not lost between calls
            self.last_refill += std::time::Duration::from_millis(
                earned * 1000 / self.config.ops_per_sec.max(1),
            );
        }
    }

    #[cfg(test)]
    fn refill_at(&mut self, now: Instant) {
        self.refill(now);
    }

    #[cfg(test)]
    fn tokens(&self) -> u64 {
        self.tokens
    }
}
