//! The client's reconnect backoff policy (`spec.md` §4.4 `retryWait`, §9
//! Design Note "Retry backoff").
//!
//! Grounded on the shape of `subxt`'s reconnecting RPC client, which
//! accepts any `Iterator<Item = Duration>` as a retry policy (re-exporting
//! `finito::ExponentialBackoff`/`FibonacciBackoff`/`FixedInterval`) and
//! clones it fresh for each reconnect sequence. This crate exposes the
//! same shape as a small trait instead of relying on an external backoff
//! crate, since the policy here is keyed by attempt number (`retryWait(n)`
//! per `spec.md`) rather than driven as a plain iterator.
//!
//! Per the Design Note, jitter is injectable so tests can make backoff
//! deterministic.

use std::time::Duration;

/// A source of jitter in `[0.0, 1.0)`, injectable so retry delays are
/// reproducible in tests.
pub trait Jitter: Send + Sync + 'static {
    /// Returns the next jitter sample.
    fn sample(&self) -> f64;
}

/// The default jitter source, backed by `rand::thread_rng`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngJitter;

impl Jitter for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// A fixed jitter value, for deterministic tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Computes the delay before reconnect attempt `attempt` (1-indexed).
pub trait RetryPolicy: Send + Sync + 'static {
    /// Returns how long to wait before making attempt number `attempt`.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with full jitter, the default `retryWait`
/// described informally in `spec.md` §4.4 ("default is exponential
/// jittered backoff").
///
/// `delay(n) = min(max_delay, base * 2^(n-1)) * jitter`, where `jitter` is
/// sampled uniformly in `[0.0, 1.0)` so retries from many clients don't
/// all land on the same instant (a thundering herd).
pub struct ExponentialBackoff<J = ThreadRngJitter> {
    base: Duration,
    max_delay: Duration,
    jitter: J,
}

impl ExponentialBackoff<ThreadRngJitter> {
    /// Builds the default policy: 300ms base, capped at 30s, full jitter
    /// from the thread RNG.
    pub fn new() -> Self {
        Self {
            base: Duration::from_millis(300),
            max_delay: Duration::from_secs(30),
            jitter: ThreadRngJitter,
        }
    }
}

impl Default for ExponentialBackoff<ThreadRngJitter> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Jitter> ExponentialBackoff<J> {
    /// Overrides the base delay (the delay before attempt 1, before
    /// jitter).
    #[must_use]
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Overrides the maximum delay, before jitter is applied.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Replaces the jitter source, e.g. with a [`FixedJitter`] for
    /// deterministic tests.
    #[must_use]
    pub fn with_jitter<J2: Jitter>(self, jitter: J2) -> ExponentialBackoff<J2> {
        ExponentialBackoff {
            base: self.base,
            max_delay: self.max_delay,
            jitter,
        }
    }
}

impl<J: Jitter> RetryPolicy for ExponentialBackoff<J> {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let unjittered = self
            .base
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
            .min(self.max_delay);
        unjittered.mul_f64(self.jitter.sample())
    }
}

/// A fixed delay for every attempt, useful for tests that want
/// predictable timing (`spec.md` §8 scenario S5 uses a fixed
/// `retryTimeout`).
pub struct FixedInterval(pub Duration);

impl RetryPolicy for FixedInterval {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}
