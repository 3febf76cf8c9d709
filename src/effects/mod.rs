//! Per-instrument effect chains and the shared master bus.
//!
//! Every instrument owns an independent chain of optional stages
//! (reverb, chorus, filter). All chains feed one master bus
//! (EQ -> compressor -> limiter) which is always present: whatever upstream
//! misconfiguration happens, the limiter keeps the output out of clipping.
//!
//! Parameter changes never step instantaneously. Each stage ramps its
//! audible parameters over [`RAMP_SECONDS`] so a settings update arriving
//! mid-buffer cannot pop.

mod chorus;
mod filter;
mod master;
mod reverb;

pub use chorus::Chorus;
pub use filter::{Filter, FilterKind};
pub use master::MasterBus;
pub use reverb::Reverb;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::quality::QualityProfile;

/// Ramp length for parameter changes, in seconds. Long enough to be
/// pop-free, short enough to feel immediate.
pub const RAMP_SECONDS: f32 = 0.03;

/// A parameter that glides toward its target instead of stepping.
#[derive(Debug, Clone, Copy)]
pub struct Ramp {
    current: f32,
    target: f32,
    step: f32,
}

impl Ramp {
    pub fn new(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            step: 0.0,
        }
    }

    /// Retarget over `RAMP_SECONDS` at the given sample rate.
    pub fn set_target(&mut self, target: f32, sample_rate: f32) {
        self.target = target;
        let frames = (RAMP_SECONDS * sample_rate).max(1.0);
        self.step = (target - self.current) / frames;
    }

    /// Jump without ramping. Only used at construction time.
    pub fn snap(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.step = 0.0;
    }

    #[inline]
    pub fn advance(&mut self) -> f32 {
        if self.step != 0.0 {
            self.current += self.step;
            let done = (self.step > 0.0 && self.current >= self.target)
                || (self.step < 0.0 && self.current <= self.target);
            if done {
                self.current = self.target;
                self.step = 0.0;
            }
        }
        self.current
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.current
    }
}

/// Reverb stage parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReverbParams {
    pub enabled: bool,
    /// Tail decay, 0..1 (comb feedback scaling).
    pub decay: f32,
    /// Wet level, 0..1.
    pub wet: f32,
}

impl Default for ReverbParams {
    fn default() -> Self {
        Self {
            enabled: false,
            decay: 0.5,
            wet: 0.25,
        }
    }
}

/// Chorus stage parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChorusParams {
    pub enabled: bool,
    /// LFO rate in Hz.
    pub rate: f32,
    /// Delay modulation depth in seconds.
    pub depth: f32,
    /// Feedback amount, 0..0.9.
    pub feedback: f32,
    /// Wet level, 0..1.
    pub wet: f32,
}

impl Default for ChorusParams {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 0.8,
            depth: 0.008,
            feedback: 0.0,
            wet: 0.5,
        }
    }
}

/// Filter stage parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterParams {
    pub enabled: bool,
    /// Cutoff frequency in Hz.
    pub cutoff: f32,
    /// Resonance, 0..1.
    pub resonance: f32,
    pub kind: FilterKind,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            enabled: false,
            cutoff: 8000.0,
            resonance: 0.2,
            kind: FilterKind::LowPass,
        }
    }
}

/// Full effect parameter block for one instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EffectChainParams {
    pub reverb: ReverbParams,
    pub chorus: ChorusParams,
    pub filter: FilterParams,
}

/// Names an individual stage in settings updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectStage {
    Reverb,
    Chorus,
    Filter,
}

/// Parameter payload for [`EffectBusManager::update_effect`].
#[derive(Debug, Clone, Copy)]
pub enum EffectUpdate {
    Reverb(ReverbParams),
    Chorus(ChorusParams),
    Filter(FilterParams),
}

/// One instrument's signal chain. Processing order is chorus -> filter ->
/// reverb so the reverb tail is not re-filtered on every cutoff move.
pub struct InstrumentChain {
    params: EffectChainParams,
    chorus: Chorus,
    filter: Filter,
    reverb: Reverb,
}

impl InstrumentChain {
    pub fn new(params: EffectChainParams, sample_rate: f32) -> Self {
        Self {
            params,
            chorus: Chorus::new(params.chorus, sample_rate),
            filter: Filter::new(params.filter, sample_rate),
            reverb: Reverb::new(params.reverb, sample_rate),
        }
    }

    pub fn params(&self) -> &EffectChainParams {
        &self.params
    }

    fn apply(&mut self, update: EffectUpdate) {
        match update {
            EffectUpdate::Reverb(p) => {
                self.params.reverb = p;
                self.reverb.set_params(p);
            }
            EffectUpdate::Chorus(p) => {
                self.params.chorus = p;
                self.chorus.set_params(p);
            }
            EffectUpdate::Filter(p) => {
                self.params.filter = p;
                self.filter.set_params(p);
            }
        }
    }

    fn process(&mut self, buf: &mut [f32], profile: &QualityProfile) {
        if self.params.chorus.enabled && profile.chorus_enabled {
            self.chorus.process_block(buf);
        }
        if self.params.filter.enabled && profile.filter_enabled {
            self.filter.process_block(buf);
        }
        if self.params.reverb.enabled && profile.reverb_enabled {
            self.reverb.process_block(buf);
        }
    }
}

/// Owns every instrument chain plus the master bus.
pub struct EffectBusManager {
    chains: HashMap<String, InstrumentChain>,
    master: MasterBus,
    sample_rate: f32,
}

impl EffectBusManager {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            chains: HashMap::new(),
            master: MasterBus::new(sample_rate),
            sample_rate,
        }
    }

    /// Registers (or replaces) the chain for one instrument.
    pub fn insert_chain(&mut self, instrument: &str, params: EffectChainParams) {
        self.chains.insert(
            instrument.to_string(),
            InstrumentChain::new(params, self.sample_rate),
        );
    }

    /// Updates one stage's parameters. Unknown instruments are ignored:
    /// settings validation happens at the engine boundary.
    pub fn update_effect(&mut self, instrument: &str, update: EffectUpdate) {
        if let Some(chain) = self.chains.get_mut(instrument) {
            debug!(instrument, ?update, "effect update");
            chain.apply(update);
        }
    }

    /// Flips one stage's enable flag, keeping its other parameters.
    pub fn toggle_effect(&mut self, instrument: &str, stage: EffectStage, enabled: bool) {
        if let Some(chain) = self.chains.get_mut(instrument) {
            let mut params = chain.params;
            let update = match stage {
                EffectStage::Reverb => {
                    params.reverb.enabled = enabled;
                    EffectUpdate::Reverb(params.reverb)
                }
                EffectStage::Chorus => {
                    params.chorus.enabled = enabled;
                    EffectUpdate::Chorus(params.chorus)
                }
                EffectStage::Filter => {
                    params.filter.enabled = enabled;
                    EffectUpdate::Filter(params.filter)
                }
            };
            chain.apply(update);
        }
    }

    /// Runs one instrument's dry buffer through its chain in place.
    /// The quality profile gates non-essential stages (chorus drops first,
    /// then filter, then reverb); the master bus is never gated.
    pub fn process_instrument(&mut self, instrument: &str, buf: &mut [f32], profile: &QualityProfile) {
        if let Some(chain) = self.chains.get_mut(instrument) {
            chain.process(buf, profile);
        }
    }

    /// Runs the summed mix through EQ -> compressor -> limiter in place.
    pub fn process_master(&mut self, buf: &mut [f32]) {
        self.master.process_block(buf);
    }

    pub fn chain_params(&self, instrument: &str) -> Option<&EffectChainParams> {
        self.chains.get(instrument).map(|c| c.params())
    }
}
