use std::time::Duration;

use crate::config::SettlementConfig;

/// Multiplicative increase/decrease controller for the settlement batch size.
///
/// Owned by a single engine loop. Cycles slower than 1.5x the target shrink
/// the next batch by a fifth, cycles faster than half the target that filled
/// their batch grow it by a fifth. The size always stays within `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSizeController {
    current: usize,
    min: usize,
    max: usize,
    target: Duration
}

impl BatchSizeController {
    pub fn new(initial: usize, min: usize, max: usize, target: Duration) -> Self {
        let min = min.max(1);
        let max = max.max(min);

        Self {
            current: initial.clamp(min, max),
            min,
            max,
            target
        }
    }

    pub fn from_config(config: &SettlementConfig) -> Self {
        Self::new(config.initial_batch_size, config.min_batch_size, config.max_batch_size, config.target_cycle())
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Feeds back the duration of a completed cycle and how many rows it
    /// claimed. Returns the size for the next cycle.
    pub fn record(&mut self, elapsed: Duration, claimed: usize) -> usize {
        if elapsed > self.target * 3 / 2 {
            self.current = (self.current * 4 / 5).max(self.min);
        } else if elapsed < self.target / 2 && claimed >= self.current {
            // Rounded up so small sizes still grow.
            self.current = (self.current * 6).div_ceil(5).min(self.max);
        }

        self.current
    }

    /// Halves the size after a batch had to be reverted.
    pub fn on_failure(&mut self) -> usize {
        self.current = (self.current / 2).max(self.min);
        self.current
    }
}
