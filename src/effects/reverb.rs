//! Reverb stage - Schroeder topology, mono.
//!
//! Four parallel feedback combs into two serial allpasses. Not a concert
//! hall, but smooth enough for ambience on sonified events and cheap enough
//! to run per instrument.

use super::{Ramp, ReverbParams};

/// Comb delay lengths in seconds, mutually prime at 44.1 kHz.
const COMB_DELAYS: [f32; 4] = [0.0297, 0.0371, 0.0411, 0.0437];
const ALLPASS_DELAYS: [f32; 2] = [0.005, 0.0017];
const ALLPASS_GAIN: f32 = 0.5;

struct Comb {
    buffer: Vec<f32>,
    pos: usize,
}

impl Comb {
    fn new(delay: f32, sample_rate: f32) -> Self {
        let len = (delay * sample_rate).ceil().max(1.0) as usize;
        Self {
            buffer: vec![0.0; len],
            pos: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32, feedback: f32) -> f32 {
        let out = self.buffer[self.pos];
        self.buffer[self.pos] = input + out * feedback;
        self.pos = (self.pos + 1) % self.buffer.len();
        out
    }
}

struct Allpass {
    buffer: Vec<f32>,
    pos: usize,
}

impl Allpass {
    fn new(delay: f32, sample_rate: f32) -> Self {
        let len = (delay * sample_rate).ceil().max(1.0) as usize;
        Self {
            buffer: vec![0.0; len],
            pos: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.buffer[self.pos];
        let out = -input * ALLPASS_GAIN + delayed;
        self.buffer[self.pos] = input + delayed * ALLPASS_GAIN;
        self.pos = (self.pos + 1) % self.buffer.len();
        out
    }
}

pub struct Reverb {
    params: ReverbParams,
    combs: [Comb; 4],
    allpasses: [Allpass; 2],
    wet: Ramp,
    sample_rate: f32,
}

impl Reverb {
    pub fn new(params: ReverbParams, sample_rate: f32) -> Self {
        let mut wet = Ramp::new(0.0);
        wet.snap(params.wet.clamp(0.0, 1.0));
        Self {
            params,
            combs: [
                Comb::new(COMB_DELAYS[0], sample_rate),
                Comb::new(COMB_DELAYS[1], sample_rate),
                Comb::new(COMB_DELAYS[2], sample_rate),
                Comb::new(COMB_DELAYS[3], sample_rate),
            ],
            allpasses: [
                Allpass::new(ALLPASS_DELAYS[0], sample_rate),
                Allpass::new(ALLPASS_DELAYS[1], sample_rate),
            ],
            wet,
            sample_rate,
        }
    }

    pub fn set_params(&mut self, params: ReverbParams) {
        self.params = params;
        self.wet
            .set_target(params.wet.clamp(0.0, 1.0), self.sample_rate);
    }

    pub fn clear(&mut self) {
        for comb in &mut self.combs {
            comb.buffer.fill(0.0);
        }
        for ap in &mut self.allpasses {
            ap.buffer.fill(0.0);
        }
    }

    pub fn process_block(&mut self, buf: &mut [f32]) {
        // decay 0..1 maps onto comb feedback below the stability bound.
        let feedback = 0.5 + self.params.decay.clamp(0.0, 1.0) * 0.45;

        for sample in buf.iter_mut() {
            let dry = *sample;
            let wet_level = self.wet.advance();

            let mut wet = 0.0;
            for comb in &mut self.combs {
                wet += comb.process(dry, feedback);
            }
            wet *= 0.25;
            for ap in &mut self.allpasses {
                wet = ap.process(wet);
            }

            *sample = dry * (1.0 - wet_level) + wet * wet_level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impulse_produces_a_tail() {
        let params = ReverbParams {
            enabled: true,
            decay: 0.7,
            wet: 1.0,
        };
        let mut reverb = Reverb::new(params, 44100.0);

        let mut buf = vec![0.0_f32; 8192];
        buf[0] = 1.0;
        reverb.process_block(&mut buf);

        // Energy must appear well after the impulse.
        let tail: f32 = buf[4000..].iter().map(|s| s.abs()).sum();
        assert!(tail > 0.01, "no reverb tail: {tail}");
    }

    #[test]
    fn tail_decays_not_explodes() {
        let params = ReverbParams {
            enabled: true,
            decay: 1.0, // max decay still maps below the stability bound
            wet: 1.0,
        };
        let mut reverb = Reverb::new(params, 44100.0);

        let mut buf = vec![0.0_f32; 512];
        buf[0] = 1.0;
        reverb.process_block(&mut buf);

        let mut peaks = Vec::new();
        for _ in 0..100 {
            let mut silence = vec![0.0_f32; 512];
            reverb.process_block(&mut silence);
            peaks.push(silence.iter().fold(0.0_f32, |a, s| a.max(s.abs())));
        }
        for p in &peaks {
            assert!(p.is_finite() && *p < 4.0);
        }
        // The shortest comb delay is ~30ms, a few blocks at this rate, so
        // the tail only reaches the output after the first blocks. Compare
        // an early window after onset against a late one.
        let early: f32 = peaks[4..14].iter().sum();
        let late: f32 = peaks[86..96].iter().sum();
        assert!(early > 0.0, "no tail energy after onset");
        assert!(
            late < early * 0.5,
            "tail must decay over time: early {early}, late {late}"
        );
    }

    #[test]
    fn zero_wet_is_transparent() {
        let params = ReverbParams {
            enabled: true,
            decay: 0.5,
            wet: 0.0,
        };
        let mut reverb = Reverb::new(params, 44100.0);
        let mut buf = vec![0.3_f32; 256];
        reverb.process_block(&mut buf);
        for s in &buf {
            assert!((s - 0.3).abs() < 1e-6);
        }
    }
}
