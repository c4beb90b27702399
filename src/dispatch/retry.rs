use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::record::Outcome;
use crate::service::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Capped exponential backoff with additive jitter.
///
/// `delay = min(max_delay, base * 2^attempt) + jitter`, jitter uniform in
/// `[0, delay / 2]`. Gives up once `attempt` reaches `max_attempts` or the
/// outcome is fatal.
#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(config: &RetryConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &RetryConfig, rng: StdRng) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            rng: Mutex::new(rng),
        }
    }

    /// `attempt` is the zero-based index of the attempt that just failed.
    pub fn decide(&self, attempt: u32, outcome: &Outcome) -> RetryDecision {
        match outcome {
            Outcome::Success => RetryDecision::GiveUp,
            Outcome::FatalFailure(_) => RetryDecision::GiveUp,
            Outcome::RetryableFailure(_) if attempt >= self.max_attempts => RetryDecision::GiveUp,
            Outcome::RetryableFailure(_) => RetryDecision::RetryAfter(self.backoff(attempt)),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        let jitter_ms = self.rng.lock().gen_range(0..=delay_ms / 2);
        Duration::from_millis(delay_ms + jitter_ms)
    }
}
