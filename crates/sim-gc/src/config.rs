//! Collector configuration

use serde::{Deserialize, Serialize};

/// GC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Work units performed by one paced step (default: 1KB)
    pub step_size: usize,
    /// Percentage applied to `step_size` for each paced step (default: 200)
    pub step_multiplier: usize,
    /// Heap growth, as a percentage of the live estimate, before the next
    /// cycle starts (default: 150)
    pub pause_percent: usize,
    /// Work charged for visiting one object during sweep (default: 50)
    pub sweep_cost: usize,
    /// Accounted bytes before the first cycle starts (default: 256KB)
    pub initial_threshold: usize,
    /// Check the tri-color invariant after every mark step in debug builds
    pub verify_barriers: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            step_size: 1024,
            step_multiplier: 200,
            pause_percent: 150,
            sweep_cost: 50,
            initial_threshold: 256 * 1024,
            verify_barriers: cfg!(debug_assertions),
        }
    }
}

impl GcConfig {
    /// Work budget of one paced step
    pub fn step_budget(&self) -> usize {
        (self.step_size.saturating_mul(self.step_multiplier) / 100).max(1)
    }

    /// Threshold for the next cycle given the surviving estimate
    pub fn next_threshold(&self, estimate: usize) -> usize {
        (estimate / 100).saturating_mul(self.pause_percent).max(self.step_size)
    }
}
