//! Frequency detuning against phase cancellation.
//!
//! Two voices starting the same pitch within a few tens of milliseconds
//! cancel and crackle. The detuner keeps a map from quantized frequency
//! (one decimal place, so near-duplicates share a bucket) to the time that
//! bucket was last triggered. A re-trigger inside the conflict window gets
//! nudged by a small random offset; outside the window the frequency passes
//! through untouched. The bucket timestamp is updated on every call,
//! whichever branch is taken.
//!
//! The branch taken is deterministic given the history state; only the
//! offset magnitude is random. When disabled the detuner is the identity
//! function and keeps no other state.

use std::collections::HashMap;

/// Default conflict window in seconds.
pub const CONFLICT_WINDOW: f64 = 0.050;
/// Maximum relative offset applied on collision (0.1%).
pub const MAX_OFFSET_RATIO: f32 = 0.001;
/// Entries idle this long are dropped when pruning runs. Correctness never
/// depends on pruning; it only bounds memory on long sessions.
const PRUNE_AGE: f64 = 10.0;
/// Prune at most once per this many triggers.
const PRUNE_INTERVAL: u64 = 4096;

pub struct FrequencyDetuner {
    enabled: bool,
    /// Quantized frequency -> last trigger time in seconds.
    history: HashMap<i64, f64>,
    /// 1.0 normally, 2.0 while crackling risk is HIGH.
    window_scale: f64,
    rng: fastrand::Rng,
    triggers: u64,
}

impl FrequencyDetuner {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            history: HashMap::new(),
            window_scale: 1.0,
            rng: fastrand::Rng::new(),
            triggers: 0,
        }
    }

    /// Deterministic offsets for tests.
    pub fn with_seed(enabled: bool, seed: u64) -> Self {
        let mut detuner = Self::new(enabled);
        detuner.rng = fastrand::Rng::with_seed(seed);
        detuner
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.history.clear();
        }
    }

    /// Widens the conflict window while the crackling risk is HIGH.
    pub fn set_high_risk(&mut self, high: bool) {
        self.window_scale = if high { 2.0 } else { 1.0 };
    }

    #[inline]
    fn bucket(frequency: f32) -> i64 {
        (frequency as f64 * 10.0).round() as i64
    }

    /// Returns the frequency to use for a trigger at time `now` (seconds).
    pub fn detune(&mut self, frequency: f32, now: f64) -> f32 {
        if !self.enabled {
            return frequency;
        }

        let bucket = Self::bucket(frequency);
        let window = CONFLICT_WINDOW * self.window_scale;
        let collided = self
            .history
            .get(&bucket)
            .is_some_and(|last| now - last < window);

        self.history.insert(bucket, now);
        self.triggers += 1;
        if self.triggers % PRUNE_INTERVAL == 0 {
            self.prune(now);
        }

        if collided {
            // Uniform in [-1, 1] scaled to the offset bound.
            let unit = self.rng.f32() * 2.0 - 1.0;
            frequency + frequency * MAX_OFFSET_RATIO * unit
        } else {
            frequency
        }
    }

    fn prune(&mut self, now: f64) {
        self.history.retain(|_, last| now - *last < PRUNE_AGE);
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.history.len()
    }
}
