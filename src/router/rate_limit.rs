//! Token-bucket throttle shared by every inbound message in a context.
//!
//! [`consume`] is a pure function over [`RateLimiterState`]; [`RateLimiter`]
//! wraps one bucket behind a mutex so concurrent routes update it in a single
//! critical section.

use std::sync::Mutex;

use tokio::time::Instant;

/// Bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Bucket capacity. Must be positive.
    pub max_tokens: u32,
    /// Tokens added per second. Must be positive.
    pub refill_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 20,
            refill_rate: 5.0,
        }
    }
}

/// Bucket contents at `last_refill`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterState {
    pub tokens: f64,
    pub last_refill: Instant,
}

impl RateLimiterState {
    /// A full bucket.
    pub fn create(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.max_tokens),
            last_refill: now,
        }
    }
}

/// Outcome of one [`consume`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub new_state: RateLimiterState,
}

/// Refill for the elapsed time, then try to take one token.
///
/// A clock reading earlier than `last_refill` counts as zero elapsed time.
pub fn consume(state: &RateLimiterState, config: &RateLimiterConfig, now: Instant) -> RateDecision {
    let elapsed = now.saturating_duration_since(state.last_refill);
    let refill = elapsed.as_secs_f64() * config.refill_rate;
    let max = f64::from(config.max_tokens);
    let candidate = (state.tokens.max(0.0) + refill).min(max);

    let (allowed, tokens) = if candidate >= 1.0 {
        (true, candidate - 1.0)
    } else {
        (false, candidate)
    };

    RateDecision {
        allowed,
        new_state: RateLimiterState {
            tokens,
            last_refill: now,
        },
    }
}

/// Shared bucket for a router.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RateLimiterState::create(&config, Instant::now())),
        }
    }

    /// Try to consume one token now. Returns `true` if allowed.
    pub fn check(&self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let decision = consume(&state, &self.config, now);
        *state = decision.new_state;
        decision.allowed
    }

    /// Tokens available at `now`, without consuming.
    pub fn available_at(&self, now: Instant) -> f64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(state.last_refill);
        (state.tokens + elapsed.as_secs_f64() * self.config.refill_rate)
            .min(f64::from(self.config.max_tokens))
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Back to a full bucket.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = RateLimiterState::create(&self.config, Instant::now());
    }
}
