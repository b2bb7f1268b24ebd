/// Randomness for poll intervals and probe-target selection.
///
/// The source is any `rand::RngCore`, so tests can pin it with a seed or a
/// `StepRng` and get repeatable schedules.
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::time::Duration;

pub const DEFAULT_INTERVAL_LOW_MS: u64 = 5000;
pub const DEFAULT_INTERVAL_HIGH_MS: u64 = 10000;

/// Half-open millisecond range `[low, high)` for poll intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBounds {
    low_ms: u64,
    high_ms: u64,
}

impl IntervalBounds {
    /// Returns `None` unless `low < high`.
    pub fn new(low_ms: u64, high_ms: u64) -> Option<Self> {
        (low_ms < high_ms).then_some(Self { low_ms, high_ms })
    }

    pub fn low_ms(&self) -> u64 {
        self.low_ms
    }

    pub fn high_ms(&self) -> u64 {
        self.high_ms
    }

    pub fn contains(&self, ms: u64) -> bool {
        (self.low_ms..self.high_ms).contains(&ms)
    }
}

impl Default for IntervalBounds {
    fn default() -> Self {
        Self {
            low_ms: DEFAULT_INTERVAL_LOW_MS,
            high_ms: DEFAULT_INTERVAL_HIGH_MS,
        }
    }
}

/// Injectable random source.
pub struct Jitter {
    rng: Box<dyn RngCore + Send>,
}

impl Jitter {
    /// Seeded for reproducibility, or from OS entropy.
    pub fn seeded(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self::from_rng(rng)
    }

    pub fn from_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self { rng: Box::new(rng) }
    }

    /// Draw the next poll interval, uniform over `bounds`.
    pub fn interval(&mut self, bounds: &IntervalBounds) -> Duration {
        let ms = self.rng.gen_range(bounds.low_ms..bounds.high_ms);
        debug_assert!(bounds.contains(ms));
        Duration::from_millis(ms)
    }

    /// Uniform pick from a pool. `None` only for an empty pool.
    pub fn pick<'a, T>(&mut self, pool: &'a [T]) -> Option<&'a T> {
        if pool.is_empty() {
            return None;
        }
        pool.get(self.rng.gen_range(0..pool.len()))
    }
}

impl std::fmt::Debug for Jitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jitter").finish_non_exhaustive()
    }
}
