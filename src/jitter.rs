//! Jitter applied to retry delays to keep many failing requests from retrying in lockstep.
//!
//! - `None`: deterministic delays, for tests or tightly controlled workflows.
//! - `Symmetric(factor)`: uniform in `[delay * (1 - factor), delay * (1 + factor)]`.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`. Nanosecond conversions saturate to `u64::MAX`.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the backoff delay unchanged.
    None,
    /// Symmetric jitter of up to `±factor` of the delay. `factor` is clamped to `[0, 1]`.
    Symmetric(f64),
}

impl Jitter {
    /// ±50%, the default randomization.
    pub fn symmetric() -> Self {
        Jitter::Symmetric(0.5)
    }

    /// Symmetric jitter with a custom factor; `0.0` behaves like [`Jitter::None`].
    pub fn with_factor(factor: f64) -> Self {
        if factor <= 0.0 || factor.is_nan() {
            Jitter::None
        } else {
            Jitter::Symmetric(factor.min(1.0))
        }
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_internal(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        self.apply_internal(delay, rng)
    }

    fn as_nanos_saturated(duration: Duration) -> u64 {
        duration.as_nanos().try_into().unwrap_or(u64::MAX)
    }

    fn apply_internal<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Symmetric(factor) => {
                let nanos = Self::as_nanos_saturated(delay);
                if nanos == 0 {
                    return Duration::ZERO;
                }
                let factor = factor.clamp(0.0, 1.0);
                let spread = (nanos as f64 * factor) as u64;
                let lower = nanos.saturating_sub(spread);
                let upper = nanos.saturating_add(spread);
                Duration::from_nanos(rng.random_range(lower..=upper))
            }
        }
    }
}
