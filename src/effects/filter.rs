//! Filter stage - state-variable filter with selectable response.
//!
//! Chamberlin SVF in the trapezoidal form (two integrator states), cheap
//! enough for per-instrument use and stable under fast cutoff ramps.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use super::{FilterParams, Ramp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    #[default]
    LowPass,
    HighPass,
    BandPass,
}

pub struct Filter {
    params: FilterParams,
    cutoff: Ramp,
    ic1eq: f32,
    ic2eq: f32,
    sample_rate: f32,
}

impl Filter {
    pub fn new(params: FilterParams, sample_rate: f32) -> Self {
        let mut cutoff = Ramp::new(0.0);
        cutoff.snap(Self::clamp_cutoff(params.cutoff, sample_rate));
        Self {
            params,
            cutoff,
            ic1eq: 0.0,
            ic2eq: 0.0,
            sample_rate,
        }
    }

    fn clamp_cutoff(cutoff: f32, sample_rate: f32) -> f32 {
        cutoff.clamp(20.0, sample_rate * 0.45)
    }

    pub fn set_params(&mut self, params: FilterParams) {
        self.params = params;
        self.cutoff.set_target(
            Self::clamp_cutoff(params.cutoff, self.sample_rate),
            self.sample_rate,
        );
    }

    pub fn reset(&mut self) {
        self.ic1eq = 0.0;
        self.ic2eq = 0.0;
    }

    pub fn process_block(&mut self, buf: &mut [f32]) {
        let resonance = self.params.resonance.clamp(0.0, 0.98);
        let k = 2.0 - 2.0 * resonance;

        for sample in buf.iter_mut() {
            let cutoff = self.cutoff.advance();
            let g = (PI * cutoff / self.sample_rate).tan();
            let a1 = 1.0 / (1.0 + g * (g + k));
            let a2 = g * a1;
            let a3 = g * a2;

            let v3 = *sample - self.ic2eq;
            let v1 = a1 * self.ic1eq + a2 * v3;
            let v2 = self.ic2eq + a2 * self.ic1eq + a3 * v3;
            self.ic1eq = 2.0 * v1 - self.ic1eq;
            self.ic2eq = 2.0 * v2 - self.ic2eq;

            *sample = match self.params.kind {
                FilterKind::LowPass => v2,
                FilterKind::BandPass => v1,
                FilterKind::HighPass => *sample - k * v1 - v2,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_sine(freq: f32, sample_rate: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    fn rms(buf: &[f32]) -> f32 {
        (buf.iter().map(|s| s * s).sum::<f32>() / buf.len() as f32).sqrt()
    }

    #[test]
    fn lowpass_attenuates_high_frequencies() {
        let sr = 44100.0;
        let params = FilterParams {
            enabled: true,
            cutoff: 500.0,
            resonance: 0.0,
            kind: FilterKind::LowPass,
        };

        let mut low = render_sine(100.0, sr, 4096);
        let mut high = render_sine(8000.0, sr, 4096);
        Filter::new(params, sr).process_block(&mut low);
        Filter::new(params, sr).process_block(&mut high);

        // Skip the transient at the start.
        let low_rms = rms(&low[1024..]);
        let high_rms = rms(&high[1024..]);
        assert!(
            high_rms < low_rms * 0.2,
            "8 kHz should be well below 100 Hz: {high_rms} vs {low_rms}"
        );
    }

    #[test]
    fn highpass_attenuates_low_frequencies() {
        let sr = 44100.0;
        let params = FilterParams {
            enabled: true,
            cutoff: 2000.0,
            resonance: 0.0,
            kind: FilterKind::HighPass,
        };

        let mut low = render_sine(100.0, sr, 4096);
        let mut high = render_sine(8000.0, sr, 4096);
        Filter::new(params, sr).process_block(&mut low);
        Filter::new(params, sr).process_block(&mut high);

        assert!(rms(&low[1024..]) < rms(&high[1024..]) * 0.2);
    }

    #[test]
    fn stays_finite_with_extreme_parameters() {
        let sr = 44100.0;
        let params = FilterParams {
            enabled: true,
            cutoff: 1_000_000.0, // clamped internally
            resonance: 5.0,      // clamped internally
            kind: FilterKind::BandPass,
        };
        let mut filter = Filter::new(params, sr);
        let mut buf = render_sine(440.0, sr, 2048);
        for _ in 0..20 {
            filter.process_block(&mut buf);
            for s in &buf {
                assert!(s.is_finite());
            }
        }
    }
}
