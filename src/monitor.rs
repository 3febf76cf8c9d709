//! Performance monitoring for the real-time path.
//!
//! The monitor collects per-operation timings (voice allocation is the
//! timing-critical operation) plus voice counts and a CPU proxy, keeps them
//! in a rolling window, and derives two read-only observability values:
//!
//! - a processing stability score, `1 - coefficient_of_variation` of recent
//!   latencies clamped to [0,1], and
//! - a crackling risk tier, thresholded on max latency, average latency and
//!   the stability score. HIGH risk widens the detuner's conflict window.
//!
//! Samples are append-only; consumers only ever see windowed summaries.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// How many samples the rolling window keeps.
const WINDOW_CAPACITY: usize = 256;

/// Latency above which a single operation counts as a spike, in ms.
pub const SPIKE_THRESHOLD_MS: f64 = 15.0;
/// Average latency above which risk is at least MEDIUM, in ms.
const MEDIUM_AVG_MS: f64 = 5.0;
/// Stability below which risk is HIGH.
const HIGH_STABILITY_FLOOR: f64 = 0.5;
/// Stability below which risk is at least MEDIUM.
const MEDIUM_STABILITY_FLOOR: f64 = 0.75;

/// Qualitative phase-cancellation risk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum CracklingRisk {
    Low,
    Medium,
    High,
}

/// One timestamped snapshot of the real-time path. Never mutated after
/// creation.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceSample {
    /// Engine time in seconds when the sample was taken.
    pub at: f64,
    /// Observed voice-allocation latency in milliseconds.
    pub alloc_latency_ms: f64,
    /// Live voices across all instruments at sample time.
    pub active_voices: usize,
    /// Estimated CPU load, 0..1 (render time / buffer deadline).
    pub cpu_proxy: f64,
}

/// Windowed summary handed to the adaptive quality controller.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSummary {
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub cpu_proxy: f64,
    pub stability: f64,
    pub crackling_risk: CracklingRisk,
    pub active_voices: usize,
}

impl Default for MetricsSummary {
    fn default() -> Self {
        Self {
            avg_latency_ms: 0.0,
            max_latency_ms: 0.0,
            cpu_proxy: 0.0,
            stability: 1.0,
            crackling_risk: CracklingRisk::Low,
            active_voices: 0,
        }
    }
}

pub struct PerformanceMonitor {
    window: VecDeque<PerformanceSample>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_CAPACITY),
        }
    }

    /// Appends one sample, evicting the oldest once the window is full.
    pub fn record(&mut self, sample: PerformanceSample) {
        if self.window.len() == WINDOW_CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    /// Convenience wrapper for the allocation hot path.
    pub fn record_allocation(&mut self, at: f64, elapsed: Duration, active_voices: usize, cpu: f64) {
        self.record(PerformanceSample {
            at,
            alloc_latency_ms: elapsed.as_secs_f64() * 1000.0,
            active_voices,
            cpu_proxy: cpu,
        });
    }

    /// Processing stability score: 1 - CV of recent latencies, clamped.
    pub fn stability(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 1.0;
        }
        let mean = self
            .window
            .iter()
            .map(|s| s.alloc_latency_ms)
            .sum::<f64>()
            / n as f64;
        if mean <= f64::EPSILON {
            return 1.0;
        }
        let variance = self
            .window
            .iter()
            .map(|s| {
                let d = s.alloc_latency_ms - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;
        (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
    }

    /// Summarizes the current window.
    pub fn summarize(&self) -> MetricsSummary {
        if self.window.is_empty() {
            return MetricsSummary::default();
        }
        let n = self.window.len() as f64;
        let avg_latency_ms = self.window.iter().map(|s| s.alloc_latency_ms).sum::<f64>() / n;
        let max_latency_ms = self
            .window
            .iter()
            .map(|s| s.alloc_latency_ms)
            .fold(0.0, f64::max);
        let cpu_proxy = self.window.iter().map(|s| s.cpu_proxy).sum::<f64>() / n;
        let stability = self.stability();
        let active_voices = self.window.back().map(|s| s.active_voices).unwrap_or(0);

        let crackling_risk = if max_latency_ms > SPIKE_THRESHOLD_MS || stability < HIGH_STABILITY_FLOOR
        {
            CracklingRisk::High
        } else if avg_latency_ms > MEDIUM_AVG_MS || stability < MEDIUM_STABILITY_FLOOR {
            CracklingRisk::Medium
        } else {
            CracklingRisk::Low
        };

        MetricsSummary {
            avg_latency_ms,
            max_latency_ms,
            cpu_proxy,
            stability,
            crackling_risk,
            active_voices,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
