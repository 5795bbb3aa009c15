//! Random sources for ambient trigger draws and inter-cycle delays.
//!
//! The scheduler never touches a global RNG directly; it draws through a
//! [`RandomSource`] so tests can pin every draw.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of the three kinds of draws the ambient scheduler makes.
pub trait RandomSource: Send {
    /// Uniform percentage in `0..100`.
    fn percent(&mut self) -> u8;

    /// Uniform delay in `[min, max]` at millisecond resolution.
    ///
    /// Returns `min` when the range is empty or inverted.
    fn delay_between(&mut self, min: Duration, max: Duration) -> Duration;

    /// Uniform index in `0..len`. `len` must be non-zero.
    fn index(&mut self, len: usize) -> usize;
}

/// [`RandomSource`] backed by `rand`'s standard RNG.
#[derive(Debug, Clone)]
pub struct StdRandom {
    rng: StdRng,
}

impl StdRandom {
    /// Seed from the operating system.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Reproducible sequence for a given seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for StdRandom {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl RandomSource for StdRandom {
    fn percent(&mut self) -> u8 {
        self.rng.random_range(0..100u8)
    }

    fn delay_between(&mut self, min: Duration, max: Duration) -> Duration {
        let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        if max_ms <= min_ms {
            return min;
        }
        Duration::from_millis(self.rng.random_range(min_ms..=max_ms))
    }

    fn index(&mut self, len: usize) -> usize {
        self.rng.random_range(0..len.max(1))
    }
}

/// Degenerate source that returns the same percentage on every draw.
///
/// Delays are always the range minimum and picks always the first element,
/// which makes cycle timing and effect choice fully predictable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantRandom {
    percent: u8,
}

impl ConstantRandom {
    /// `percent` is clamped into `0..100`.
    #[must_use]
    pub fn new(percent: u8) -> Self {
        Self {
            percent: percent.min(99),
        }
    }
}

impl RandomSource for ConstantRandom {
    fn percent(&mut self) -> u8 {
        self.percent
    }

    fn delay_between(&mut self, min: Duration, _max: Duration) -> Duration {
        min
    }

    fn index(&mut self, _len: usize) -> usize {
        0
    }
}
