//! Chorus stage - modulated delay line.
//!
//! Medium delays (5-50 ms) with a slow sine LFO create the illusion of
//! several detuned copies of the signal. Optional feedback pushes it toward
//! flanger territory; kept low by default.

use std::f32::consts::PI;

use super::{ChorusParams, Ramp};

/// Maximum delay the buffer accommodates, in seconds.
const MAX_DELAY: f32 = 0.05;
/// Base delay before modulation, in seconds.
const BASE_DELAY: f32 = 0.005;

pub struct Chorus {
    params: ChorusParams,
    buffer: Vec<f32>,
    write_pos: usize,
    phase: f32,
    wet: Ramp,
    sample_rate: f32,
}

impl Chorus {
    pub fn new(params: ChorusParams, sample_rate: f32) -> Self {
        let buffer_size = (MAX_DELAY * sample_rate).ceil() as usize;
        let mut wet = Ramp::new(0.0);
        wet.snap(params.wet.clamp(0.0, 1.0));
        Self {
            params,
            buffer: vec![0.0; buffer_size],
            write_pos: 0,
            phase: 0.0,
            wet,
            sample_rate,
        }
    }

    pub fn set_params(&mut self, params: ChorusParams) {
        self.params = params;
        self.wet
            .set_target(params.wet.clamp(0.0, 1.0), self.sample_rate);
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.phase = 0.0;
    }

    pub fn process_block(&mut self, buf: &mut [f32]) {
        let buffer_len = self.buffer.len();
        let rate = self.params.rate.clamp(0.01, 10.0);
        let depth = self.params.depth.clamp(0.0, 0.02);
        let feedback = self.params.feedback.clamp(0.0, 0.9);

        for sample in buf.iter_mut() {
            let dry = *sample;
            let wet_level = self.wet.advance();

            let lfo = (self.phase * 2.0 * PI).sin() * 0.5 + 0.5;
            let delay_samples = (BASE_DELAY + depth * lfo) * self.sample_rate;

            // Linear interpolation read behind the write head.
            let read_pos = (self.write_pos as f32 + buffer_len as f32 - delay_samples)
                .rem_euclid(buffer_len as f32);
            let index = read_pos as usize;
            let frac = read_pos - index as f32;
            let delayed = self.buffer[index]
                + frac * (self.buffer[(index + 1) % buffer_len] - self.buffer[index]);

            self.buffer[self.write_pos] = dry + delayed * feedback;
            self.write_pos = (self.write_pos + 1) % buffer_len;

            self.phase += rate / self.sample_rate;
            while self.phase >= 1.0 {
                self.phase -= 1.0;
            }

            *sample = dry * (1.0 - wet_level) + delayed * wet_level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(wet: f32) -> ChorusParams {
        ChorusParams {
            enabled: true,
            rate: 1.0,
            depth: 0.01,
            feedback: 0.0,
            wet,
        }
    }

    #[test]
    fn zero_wet_passes_dry_signal() {
        let mut chorus = Chorus::new(params(0.0), 44100.0);
        let mut buf = vec![1.0_f32; 512];
        chorus.process_block(&mut buf);
        let avg = buf.iter().sum::<f32>() / buf.len() as f32;
        assert!((avg - 1.0).abs() < 0.01, "dry path altered: {avg}");
    }

    #[test]
    fn output_stays_bounded_without_feedback() {
        let mut chorus = Chorus::new(params(1.0), 44100.0);
        let mut peak = 0.0_f32;
        for _ in 0..50 {
            let mut buf = vec![1.0_f32; 512];
            chorus.process_block(&mut buf);
            for s in &buf {
                assert!(s.is_finite());
                peak = peak.max(s.abs());
            }
        }
        assert!(peak < 1.5, "chorus without feedback must not grow: {peak}");
    }

    #[test]
    fn wet_change_ramps_rather_than_steps() {
        let mut chorus = Chorus::new(params(0.0), 44100.0);
        let mut warmup = vec![0.8_f32; 256];
        chorus.process_block(&mut warmup);

        let mut p = params(1.0);
        p.wet = 1.0;
        chorus.set_params(p);

        // Right after the retarget the wet level is still near zero, so the
        // first samples must remain close to dry.
        let mut buf = vec![0.8_f32; 16];
        chorus.process_block(&mut buf);
        assert!(
            (buf[0] - 0.8).abs() < 0.1,
            "parameter change stepped instead of ramping: {}",
            buf[0]
        );
    }

    #[test]
    fn clear_resets_state() {
        let mut chorus = Chorus::new(params(0.5), 44100.0);
        let mut buf = vec![1.0_f32; 512];
        chorus.process_block(&mut buf);
        chorus.clear();
        assert_eq!(chorus.write_pos, 0);
        assert_eq!(chorus.phase, 0.0);
        assert!(chorus.buffer.iter().all(|s| *s == 0.0));
    }
}
