//! Synthesis backends for voices.
//!
//! Two backends sit behind one seam: [`VoiceSource::Procedural`] renders an
//! oscillator, [`VoiceSource::Sample`] replays a pitched WAV asset. The
//! engine picks per instrument and falls back from sample to procedural
//! when an asset cannot be loaded, so a misconfigured instrument degrades
//! to a plain tone instead of going silent.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::instrument::InstrumentFamily;

/// Reference pitch for sample playback ratio. Assets are assumed to be
/// recorded near this pitch; the ratio shifts them to the requested one.
const SAMPLE_ROOT_HZ: f32 = 261.63; // C4

/// Oscillator waveforms for the procedural backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Saw,
    Square,
    Triangle,
}

/// ADSR envelope parameters, times in seconds.
#[derive(Debug, Clone, Copy)]
pub struct AdsrParams {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrParams {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopePhase {
    Attack,
    Decay,
    Sustain,
    Release,
    Done,
}

/// Per-voice ADSR state machine.
#[derive(Debug, Clone, Copy)]
pub struct AdsrEnvelope {
    params: AdsrParams,
    phase: EnvelopePhase,
    level: f32,
    time_in_phase: f32,
    release_start_level: f32,
}

impl AdsrEnvelope {
    pub fn new(params: AdsrParams) -> Self {
        Self {
            params,
            phase: EnvelopePhase::Attack,
            level: 0.0,
            time_in_phase: 0.0,
            release_start_level: 0.0,
        }
    }

    /// Begins the release phase from the current level.
    pub fn note_off(&mut self) {
        if self.phase != EnvelopePhase::Release && self.phase != EnvelopePhase::Done {
            self.release_start_level = self.level;
            self.phase = EnvelopePhase::Release;
            self.time_in_phase = 0.0;
        }
    }

    /// Shortens the tail for a stolen voice so the slot frees quickly
    /// without a click.
    pub fn fast_release(&mut self) {
        self.note_off();
        self.params.release = self.params.release.min(0.005);
    }

    pub fn is_done(&self) -> bool {
        self.phase == EnvelopePhase::Done
    }

    /// True once the note-off has been issued (or the voice is finished).
    pub fn is_releasing(&self) -> bool {
        self.phase == EnvelopePhase::Release || self.phase == EnvelopePhase::Done
    }

    /// Advances by one sample and returns the current level.
    #[inline]
    pub fn next(&mut self, sample_rate: f32) -> f32 {
        let dt = 1.0 / sample_rate;
        self.time_in_phase += dt;
        match self.phase {
            EnvelopePhase::Attack => {
                if self.params.attack <= 0.0 {
                    self.level = 1.0;
                } else {
                    self.level = (self.time_in_phase / self.params.attack).min(1.0);
                }
                if self.level >= 1.0 {
                    self.phase = EnvelopePhase::Decay;
                    self.time_in_phase = 0.0;
                }
            }
            EnvelopePhase::Decay => {
                if self.params.decay <= 0.0 {
                    self.level = self.params.sustain;
                } else {
                    let t = (self.time_in_phase / self.params.decay).min(1.0);
                    self.level = 1.0 + (self.params.sustain - 1.0) * t;
                }
                if self.level <= self.params.sustain {
                    self.level = self.params.sustain;
                    self.phase = EnvelopePhase::Sustain;
                    self.time_in_phase = 0.0;
                }
            }
            EnvelopePhase::Sustain => {
                self.level = self.params.sustain;
            }
            EnvelopePhase::Release => {
                if self.params.release <= 0.0 {
                    self.level = 0.0;
                } else {
                    let t = (self.time_in_phase / self.params.release).min(1.0);
                    self.level = self.release_start_level * (1.0 - t);
                }
                if self.level <= 0.0005 {
                    self.level = 0.0;
                    self.phase = EnvelopePhase::Done;
                }
            }
            EnvelopePhase::Done => {
                self.level = 0.0;
            }
        }
        self.level
    }
}

/// The sound-producing half of a voice.
pub enum VoiceSource {
    Procedural {
        waveform: Waveform,
        phase: f32,
    },
    Sample {
        data: Arc<Vec<f32>>,
        /// Fractional read position.
        position: f64,
        /// Playback ratio: requested frequency over the asset's root pitch.
        ratio: f64,
    },
}

impl VoiceSource {
    pub fn procedural(waveform: Waveform) -> Self {
        Self::Procedural {
            waveform,
            phase: 0.0,
        }
    }

    pub fn sample(data: Arc<Vec<f32>>, frequency: f32) -> Self {
        Self::Sample {
            data,
            position: 0.0,
            ratio: (frequency / SAMPLE_ROOT_HZ) as f64,
        }
    }

    /// Produces one sample. Sample sources return 0.0 once exhausted.
    #[inline]
    pub fn next(&mut self, frequency: f32, sample_rate: f32) -> f32 {
        match self {
            Self::Procedural { waveform, phase } => {
                let out = match waveform {
                    Waveform::Sine => (*phase * 2.0 * PI).sin(),
                    Waveform::Saw => 2.0 * *phase - 1.0,
                    Waveform::Square => {
                        if *phase < 0.5 {
                            1.0
                        } else {
                            -1.0
                        }
                    }
                    Waveform::Triangle => {
                        if *phase < 0.5 {
                            4.0 * *phase - 1.0
                        } else {
                            3.0 - 4.0 * *phase
                        }
                    }
                };
                *phase += frequency / sample_rate;
                while *phase >= 1.0 {
                    *phase -= 1.0;
                }
                out
            }
            Self::Sample {
                data,
                position,
                ratio,
            } => {
                let idx = *position as usize;
                if idx + 1 >= data.len() {
                    return 0.0;
                }
                // Linear interpolation, pitched by the playback ratio.
                let frac = (*position - idx as f64) as f32;
                let out = data[idx] * (1.0 - frac) + data[idx + 1] * frac;
                *position += *ratio;
                out
            }
        }
    }

    /// True once a sample source has run off the end of its data.
    pub fn exhausted(&self) -> bool {
        match self {
            Self::Procedural { .. } => false,
            Self::Sample { data, position, .. } => *position as usize + 1 >= data.len(),
        }
    }
}

/// Default procedural patch per family. Chosen so the fallback tone sits in
/// the same register as the instruments it stands in for.
pub fn patch_for_family(family: InstrumentFamily) -> (Waveform, AdsrParams) {
    match family {
        InstrumentFamily::Lead => (
            Waveform::Triangle,
            AdsrParams {
                attack: 0.005,
                decay: 0.15,
                sustain: 0.6,
                release: 0.25,
            },
        ),
        InstrumentFamily::Harmony => (
            Waveform::Sine,
            AdsrParams {
                attack: 0.03,
                decay: 0.2,
                sustain: 0.7,
                release: 0.4,
            },
        ),
        InstrumentFamily::Bass => (
            Waveform::Saw,
            AdsrParams {
                attack: 0.008,
                decay: 0.12,
                sustain: 0.8,
                release: 0.2,
            },
        ),
        InstrumentFamily::Ambient => (
            Waveform::Sine,
            AdsrParams {
                attack: 0.25,
                decay: 0.3,
                sustain: 0.8,
                release: 1.0,
            },
        ),
        InstrumentFamily::Percussion => (
            Waveform::Square,
            AdsrParams {
                attack: 0.001,
                decay: 0.08,
                sustain: 0.0,
                release: 0.05,
            },
        ),
    }
}

/// Cached WAV assets for sample-backed instruments. Load failures are
/// cached too so a missing asset costs one decode attempt, not one per
/// trigger.
pub struct SampleBank {
    cache: HashMap<String, Option<Arc<Vec<f32>>>>,
}

impl SampleBank {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Returns the decoded mono asset, or `None` after a failed load.
    /// Decoding happens once; the bounded-time fallback guarantee comes
    /// from this being a plain file read, not a streaming operation.
    pub fn get(&mut self, path: &str) -> Option<Arc<Vec<f32>>> {
        if let Some(cached) = self.cache.get(path) {
            return cached.clone();
        }
        let started = Instant::now();
        let loaded = match load_wav_mono(Path::new(path)) {
            Ok(data) => {
                info!(
                    path,
                    frames = data.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "loaded sample asset"
                );
                Some(Arc::new(data))
            }
            Err(err) => {
                warn!(path, %err, "sample load failed, procedural fallback will be used");
                None
            }
        };
        self.cache.insert(path.to_string(), loaded.clone());
        loaded
    }

    /// Drops a cached entry so the next `get` retries the load. Used by
    /// settings updates that change an instrument's asset.
    pub fn invalidate(&mut self, path: &str) {
        self.cache.remove(path);
    }
}

impl Default for SampleBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a WAV file to mono f32, folding stereo by averaging.
/// Handles int16, int24 and float32 the way the reference assets come.
fn load_wav_mono(path: &Path) -> Result<Vec<f32>, hound::Error> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<_, _>>()?
        }
    };

    let channels = spec.channels.max(1) as usize;
    if channels == 1 {
        return Ok(interleaved);
    }
    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect())
}
