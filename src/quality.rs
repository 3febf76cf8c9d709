//! Quality levels and the adaptive controller that drives them.
//!
//! `QualityLevel` is a small ordered set; each level fixes a global voice
//! ceiling, which per-instrument effect stages survive, and a target sample
//! rate. The controller is the single writer; the real-time path reads the
//! published value through [`QualityHandle`] with one atomic load and no
//! locks.
//!
//! Transitions use hysteresis twice over: the step-up thresholds sit well
//! below the step-down thresholds (>15% margin), and at most one level
//! change happens per cooldown interval. Oscillating between levels is
//! itself audible, so this is a correctness requirement, not tuning.
//!
//! EmergencyMode sits outside the ordered set: any level enters it
//! immediately when the CPU proxy crosses the hard ceiling, bypassing the
//! cooldown, and leaves it only after metrics stay healthy for a longer
//! window than a normal step-up requires.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::monitor::MetricsSummary;

/// Ordered quality tiers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum QualityLevel {
    Low = 0,
    Medium = 1,
    High = 2,
    Ultra = 3,
}

impl QualityLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Ultra,
        }
    }

    pub fn step_down(self) -> Self {
        Self::from_u8((self as u8).saturating_sub(1))
    }

    pub fn step_up(self) -> Self {
        Self::from_u8(((self as u8) + 1).min(Self::Ultra as u8))
    }

    /// The constraints each level imposes on the rest of the engine.
    /// Chorus is the first stage to go, then filter, then reverb; the
    /// master bus never degrades.
    pub fn profile(self) -> QualityProfile {
        match self {
            Self::Ultra => QualityProfile {
                max_total_voices: 64,
                chorus_enabled: true,
                filter_enabled: true,
                reverb_enabled: true,
                sample_rate: 48_000,
            },
            Self::High => QualityProfile {
                max_total_voices: 48,
                chorus_enabled: false,
                filter_enabled: true,
                reverb_enabled: true,
                sample_rate: 44_100,
            },
            Self::Medium => QualityProfile {
                max_total_voices: 32,
                chorus_enabled: false,
                filter_enabled: false,
                reverb_enabled: true,
                sample_rate: 44_100,
            },
            Self::Low => QualityProfile {
                max_total_voices: 16,
                chorus_enabled: false,
                filter_enabled: false,
                reverb_enabled: false,
                sample_rate: 22_050,
            },
        }
    }
}

/// Emergency voice cap, tighter than even the Low profile.
pub const EMERGENCY_MAX_VOICES: usize = 8;

/// What a quality level permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityProfile {
    pub max_total_voices: usize,
    pub chorus_enabled: bool,
    pub filter_enabled: bool,
    pub reverb_enabled: bool,
    pub sample_rate: u32,
}

impl QualityProfile {
    /// The profile in force under EmergencyMode: the Low profile with an
    /// aggressive voice cap and every optional stage off.
    pub fn emergency() -> Self {
        QualityProfile {
            max_total_voices: EMERGENCY_MAX_VOICES,
            chorus_enabled: false,
            filter_enabled: false,
            reverb_enabled: false,
            sample_rate: 22_050,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    level: AtomicU8,
    emergency: AtomicBool,
}

/// Cloneable handle to the published quality state. Single writer
/// (the controller), many wait-free readers.
#[derive(Clone)]
pub struct QualityHandle {
    shared: Arc<Shared>,
}

impl QualityHandle {
    pub fn new(initial: QualityLevel) -> Self {
        let shared = Shared::default();
        shared.level.store(initial as u8, Ordering::Relaxed);
        Self {
            shared: Arc::new(shared),
        }
    }

    #[inline]
    pub fn level(&self) -> QualityLevel {
        QualityLevel::from_u8(self.shared.level.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn emergency(&self) -> bool {
        self.shared.emergency.load(Ordering::Relaxed)
    }

    /// The effective constraints right now, emergency cap included.
    #[inline]
    pub fn profile(&self) -> QualityProfile {
        if self.emergency() {
            QualityProfile::emergency()
        } else {
            self.level().profile()
        }
    }

    pub(crate) fn publish(&self, level: QualityLevel, emergency: bool) {
        self.shared.level.store(level as u8, Ordering::Relaxed);
        self.shared.emergency.store(emergency, Ordering::Relaxed);
    }
}

/// Thresholds and timing for the controller. Step-up bounds keep a >15%
/// margin under the step-down bounds.
#[derive(Debug, Clone, Copy)]
pub struct ControllerTuning {
    pub step_down_latency_ms: f64,
    pub step_up_latency_ms: f64,
    pub step_down_cpu: f64,
    pub step_up_cpu: f64,
    pub emergency_cpu: f64,
    /// Minimum seconds between any two level changes.
    pub cooldown: f64,
    /// Seconds metrics must stay healthy before a step up.
    pub step_up_sustain: f64,
    /// Seconds metrics must stay healthy before leaving EmergencyMode.
    pub emergency_exit_sustain: f64,
}

impl Default for ControllerTuning {
    fn default() -> Self {
        Self {
            step_down_latency_ms: 5.0,
            step_up_latency_ms: 2.0,
            step_down_cpu: 0.80,
            step_up_cpu: 0.65,
            emergency_cpu: 0.90,
            cooldown: 0.5,
            step_up_sustain: 2.0,
            emergency_exit_sustain: 3.0,
        }
    }
}

/// Single writer of the shared [`QualityHandle`]. Driven from the
/// monitoring loop, never from the real-time path.
pub struct AdaptiveQualityController {
    handle: QualityHandle,
    tuning: ControllerTuning,
    level: QualityLevel,
    emergency: bool,
    last_change_at: f64,
    healthy_since: Option<f64>,
}

impl AdaptiveQualityController {
    pub fn new(handle: QualityHandle, tuning: ControllerTuning) -> Self {
        let level = handle.level();
        Self {
            handle,
            tuning,
            level,
            emergency: false,
            last_change_at: f64::NEG_INFINITY,
            healthy_since: None,
        }
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    pub fn in_emergency(&self) -> bool {
        self.emergency
    }

    /// Consumes one windowed summary at time `now` (seconds) and publishes
    /// any resulting transition. Returns true if the published state
    /// changed.
    pub fn update(&mut self, summary: &MetricsSummary, now: f64) -> bool {
        let t = &self.tuning;

        let healthy = summary.avg_latency_ms < t.step_up_latency_ms
            && summary.cpu_proxy < t.step_up_cpu;
        if healthy {
            self.healthy_since.get_or_insert(now);
        } else {
            self.healthy_since = None;
        }

        // Emergency entry bypasses the cooldown entirely.
        if !self.emergency && summary.cpu_proxy >= t.emergency_cpu {
            warn!(
                cpu = summary.cpu_proxy,
                "CPU ceiling breached, entering emergency mode"
            );
            self.emergency = true;
            self.level = QualityLevel::Low;
            self.last_change_at = now;
            self.handle.publish(self.level, true);
            return true;
        }

        if self.emergency {
            // Exit needs a longer sustained healthy window than a step up.
            let healthy_for = self
                .healthy_since
                .map(|since| now - since)
                .unwrap_or(0.0);
            if healthy_for >= t.emergency_exit_sustain {
                info!("metrics recovered, leaving emergency mode");
                self.emergency = false;
                self.healthy_since = Some(now);
                self.last_change_at = now;
                self.handle.publish(self.level, false);
                return true;
            }
            return false;
        }

        // Normal transitions honor the cooldown.
        if now - self.last_change_at < t.cooldown {
            return false;
        }

        let overloaded = summary.avg_latency_ms > t.step_down_latency_ms
            || summary.cpu_proxy > t.step_down_cpu;
        if overloaded && self.level > QualityLevel::Low {
            let next = self.level.step_down();
            warn!(
                from = ?self.level,
                to = ?next,
                avg_latency_ms = summary.avg_latency_ms,
                cpu = summary.cpu_proxy,
                "stepping quality down"
            );
            self.level = next;
            self.last_change_at = now;
            self.handle.publish(self.level, false);
            return true;
        }

        let healthy_for = self.healthy_since.map(|since| now - since).unwrap_or(0.0);
        if healthy_for >= t.step_up_sustain && self.level < QualityLevel::Ultra {
            let next = self.level.step_up();
            info!(from = ?self.level, to = ?next, "stepping quality up");
            self.level = next;
            self.last_change_at = now;
            // Step-up spends the accumulated healthy credit.
            self.healthy_since = Some(now);
            self.handle.publish(self.level, false);
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::CracklingRisk;

    fn summary(avg_ms: f64, cpu: f64) -> MetricsSummary {
        MetricsSummary {
            avg_latency_ms: avg_ms,
            max_latency_ms: avg_ms,
            cpu_proxy: cpu,
            stability: 1.0,
            crackling_risk: CracklingRisk::Low,
            active_voices: 0,
        }
    }

    fn controller() -> AdaptiveQualityController {
        AdaptiveQualityController::new(
            QualityHandle::new(QualityLevel::Ultra),
            ControllerTuning::default(),
        )
    }

    #[test]
    fn steps_down_one_level_on_overload() {
        let mut c = controller();
        assert!(c.update(&summary(8.0, 0.3), 1.0));
        assert_eq!(c.level(), QualityLevel::High);
    }

    #[test]
    fn cooldown_prevents_double_transition() {
        let mut c = controller();
        assert!(c.update(&summary(8.0, 0.3), 1.0));
        // Still overloaded 100ms later: must not move again.
        assert!(!c.update(&summary(8.0, 0.3), 1.1));
        assert_eq!(c.level(), QualityLevel::High);
        // After the cooldown it may.
        assert!(c.update(&summary(8.0, 0.3), 1.6));
        assert_eq!(c.level(), QualityLevel::Medium);
    }

    #[test]
    fn step_up_requires_sustained_health() {
        let mut c = controller();
        c.update(&summary(8.0, 0.3), 1.0);
        assert_eq!(c.level(), QualityLevel::High);

        // Healthy, but not for long enough.
        assert!(!c.update(&summary(0.5, 0.2), 2.0));
        // Sustained health: steps back up.
        assert!(c.update(&summary(0.5, 0.2), 4.1));
        assert_eq!(c.level(), QualityLevel::Ultra);
    }

    #[test]
    fn transient_spike_changes_level_at_most_once_per_cooldown() {
        let mut c = controller();
        let mut changes = 0;
        // Spike crossing down and immediately back, sampled every 50ms.
        for i in 0..10 {
            let now = 1.0 + i as f64 * 0.05;
            let s = if i == 0 {
                summary(8.0, 0.3)
            } else {
                summary(0.5, 0.2)
            };
            if c.update(&s, now) {
                changes += 1;
            }
        }
        assert!(changes <= 1, "oscillated {changes} times within cooldown");
    }

    #[test]
    fn emergency_entry_bypasses_cooldown() {
        let mut c = controller();
        assert!(c.update(&summary(8.0, 0.3), 1.0));
        // 10ms later, hard CPU ceiling: enters emergency despite cooldown.
        assert!(c.update(&summary(8.0, 0.95), 1.01));
        assert!(c.in_emergency());
        assert_eq!(c.level(), QualityLevel::Low);
    }

    #[test]
    fn emergency_exit_needs_longer_healthy_window() {
        let mut c = controller();
        c.update(&summary(1.0, 0.95), 1.0);
        assert!(c.in_emergency());

        // Healthy for 2s: enough for a normal step up, not for exit.
        assert!(!c.update(&summary(0.5, 0.2), 2.0));
        assert!(!c.update(&summary(0.5, 0.2), 4.0));
        assert!(c.in_emergency());

        // Healthy for >3s since 2.0: exits.
        assert!(c.update(&summary(0.5, 0.2), 5.1));
        assert!(!c.in_emergency());
    }

    #[test]
    fn handle_reflects_published_state() {
        let handle = QualityHandle::new(QualityLevel::Ultra);
        let mut c =
            AdaptiveQualityController::new(handle.clone(), ControllerTuning::default());
        c.update(&summary(8.0, 0.3), 1.0);
        assert_eq!(handle.level(), QualityLevel::High);
        assert!(!handle.emergency());

        c.update(&summary(1.0, 0.95), 2.0);
        assert!(handle.emergency());
        assert_eq!(
            handle.profile().max_total_voices,
            EMERGENCY_MAX_VOICES
        );
    }

    #[test]
    fn low_cannot_step_below_low() {
        let mut c = AdaptiveQualityController::new(
            QualityHandle::new(QualityLevel::Low),
            ControllerTuning::default(),
        );
        assert!(!c.update(&summary(8.0, 0.85), 1.0));
        assert_eq!(c.level(), QualityLevel::Low);
    }
}
