//! Master bus: EQ -> compressor -> limiter.
//!
//! Always present and never bypassable. The limiter at the end is the
//! safety invariant for the whole engine: no matter how many voices pile up
//! or how an effect is misconfigured upstream, the final output stays below
//! the ceiling.

use std::f32::consts::PI;

/// Limiter threshold in dB. Signals above it are clamped to the ceiling.
const LIMIT_THRESHOLD_DB: f32 = -3.0;
/// Limiter ceiling in dB, slightly under 0 dBFS for headroom.
const LIMIT_CEILING_DB: f32 = -0.3;

/// Compressor threshold in dB.
const COMP_THRESHOLD_DB: f32 = -12.0;
const COMP_RATIO: f32 = 4.0;
const COMP_ATTACK: f32 = 0.005;
const COMP_RELEASE: f32 = 0.1;

#[inline]
fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// One-pole shelving EQ: low shelf at 200 Hz, high shelf at 4 kHz.
/// Gentle fixed curve that keeps the sonified mix from getting muddy.
struct ShelvingEq {
    low_state: f32,
    high_state: f32,
    low_coeff: f32,
    high_coeff: f32,
    low_gain: f32,
    high_gain: f32,
}

impl ShelvingEq {
    fn new(sample_rate: f32) -> Self {
        let coeff = |freq: f32| {
            let x = (-2.0 * PI * freq / sample_rate).exp();
            1.0 - x
        };
        Self {
            low_state: 0.0,
            high_state: 0.0,
            low_coeff: coeff(200.0),
            high_coeff: coeff(4000.0),
            low_gain: db_to_linear(-1.5),
            high_gain: db_to_linear(1.0),
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        self.low_state += self.low_coeff * (input - self.low_state);
        self.high_state += self.high_coeff * (input - self.high_state);
        let low = self.low_state;
        let high = input - self.high_state;
        let mid = input - low - high;
        low * self.low_gain + mid + high * self.high_gain
    }
}

/// Feed-forward compressor with an envelope follower.
struct Compressor {
    envelope: f32,
    attack_coeff: f32,
    release_coeff: f32,
    threshold: f32,
}

impl Compressor {
    fn new(sample_rate: f32) -> Self {
        Self {
            envelope: 0.0,
            attack_coeff: (-1.0 / (COMP_ATTACK * sample_rate)).exp(),
            release_coeff: (-1.0 / (COMP_RELEASE * sample_rate)).exp(),
            threshold: db_to_linear(COMP_THRESHOLD_DB),
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let level = input.abs();
        let coeff = if level > self.envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope = coeff * self.envelope + (1.0 - coeff) * level;

        if self.envelope > self.threshold {
            // Gain reduction toward threshold + excess/ratio.
            let target = self.threshold + (self.envelope - self.threshold) / COMP_RATIO;
            input * (target / self.envelope)
        } else {
            input
        }
    }
}

/// Hard limiter. Anything above threshold is pinned at the ceiling.
struct Limiter {
    threshold: f32,
    ceiling: f32,
}

impl Limiter {
    fn new() -> Self {
        Self {
            threshold: db_to_linear(LIMIT_THRESHOLD_DB),
            ceiling: db_to_linear(LIMIT_CEILING_DB),
        }
    }

    #[inline]
    fn process(&self, input: f32) -> f32 {
        if input.abs() > self.threshold {
            input.signum() * self.ceiling
        } else {
            input
        }
    }
}

pub struct MasterBus {
    eq: ShelvingEq,
    compressor: Compressor,
    limiter: Limiter,
}

impl MasterBus {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            eq: ShelvingEq::new(sample_rate),
            compressor: Compressor::new(sample_rate),
            limiter: Limiter::new(),
        }
    }

    pub fn process_block(&mut self, buf: &mut [f32]) {
        for sample in buf.iter_mut() {
            let eq = self.eq.process(*sample);
            let compressed = self.compressor.process(eq);
            *sample = self.limiter.process(compressed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_pins_hot_signal_to_ceiling() {
        let limiter = Limiter::new();
        let ceiling = db_to_linear(LIMIT_CEILING_DB);
        assert!((limiter.process(10.0) - ceiling).abs() < 1e-6);
        assert!((limiter.process(-10.0) + ceiling).abs() < 1e-6);
    }

    #[test]
    fn limiter_is_transparent_below_threshold() {
        let limiter = Limiter::new();
        assert_eq!(limiter.process(0.3), 0.3);
        assert_eq!(limiter.process(-0.3), -0.3);
    }

    #[test]
    fn master_output_never_exceeds_unity() {
        let mut bus = MasterBus::new(48000.0);
        // Pathological input: sum of many unattenuated voices.
        let mut buf: Vec<f32> = (0..4096)
            .map(|i| ((i as f32 * 0.1).sin()) * 20.0)
            .collect();
        bus.process_block(&mut buf);
        for s in &buf {
            assert!(s.abs() <= 1.0, "clipped sample {s}");
        }
    }

    #[test]
    fn compressor_reduces_loud_passages_more_than_quiet() {
        let sr = 48000.0;
        let mut comp = Compressor::new(sr);
        let loud: Vec<f32> = (0..4800)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / sr).sin() * 0.9)
            .map(|s| comp.process(s))
            .collect();
        let loud_peak = loud[2400..].iter().fold(0.0_f32, |a, s| a.max(s.abs()));
        assert!(loud_peak < 0.9, "no gain reduction applied: {loud_peak}");

        let mut comp = Compressor::new(sr);
        let quiet: Vec<f32> = (0..4800)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / sr).sin() * 0.1)
            .map(|s| comp.process(s))
            .collect();
        let quiet_peak = quiet[2400..].iter().fold(0.0_f32, |a, s| a.max(s.abs()));
        assert!(
            (quiet_peak - 0.1).abs() < 0.02,
            "quiet signal should pass nearly untouched: {quiet_peak}"
        );
    }
}
