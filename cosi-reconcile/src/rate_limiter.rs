use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Default delay of the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
/// Default ceiling for the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, u32>,
}

impl<T> Default for ExponentialBackoff<T>
where
    T: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<T> ExponentialBackoff<T>
where
    T: Hash + Eq + Clone,
{
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: HashMap::new(),
        }
    }

    /// Delay before the next retry of `item`. Every call counts as a failure.
    pub fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Clears the failure history of `item`.
    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or_default()
    }

    /// Number of items that currently carry a failure history.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
