//! Instrument registry: per-instrument configuration and lookup.
//!
//! Instruments are keyed by a stable string and constructed once at engine
//! initialization. The registry is pure data; mutation happens only through
//! explicit settings updates and instruments are never destroyed during a
//! session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::effects::EffectChainParams;

/// Instrument family, used by the cross-instrument steal heuristic.
/// Families earlier in the steal order give up voices first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentFamily {
    Ambient,
    Harmony,
    Percussion,
    Bass,
    Lead,
}

impl InstrumentFamily {
    /// Default steal order: background layers first, foreground last.
    pub const DEFAULT_STEAL_ORDER: [InstrumentFamily; 5] = [
        InstrumentFamily::Ambient,
        InstrumentFamily::Harmony,
        InstrumentFamily::Percussion,
        InstrumentFamily::Bass,
        InstrumentFamily::Lead,
    ];
}

/// Which synthesis backend an instrument uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// WAV asset pitched to the requested frequency. Falls back to
    /// `Procedural` if the asset cannot be loaded.
    Sample,
    /// Oscillator plus ADSR, always available.
    #[default]
    Procedural,
}

/// Per-instrument configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub enabled: bool,
    /// Linear gain applied to the instrument's dry signal.
    pub gain: f32,
    /// Per-instrument polyphony cap, >= 1.
    pub max_voices: usize,
    pub backend: BackendKind,
    pub family: InstrumentFamily,
    /// Path to the WAV asset for sample-backed instruments.
    pub sample_path: Option<String>,
    pub effects: EffectChainParams,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gain: 0.8,
            max_voices: 8,
            backend: BackendKind::Procedural,
            family: InstrumentFamily::Lead,
            sample_path: None,
            effects: EffectChainParams::default(),
        }
    }
}

/// Lookup table for every configured instrument plus the family steal
/// order. No concurrency: lives inside the engine and is read from the
/// real-time path, written only at block boundaries.
pub struct InstrumentRegistry {
    instruments: HashMap<String, InstrumentConfig>,
    steal_order: Vec<InstrumentFamily>,
}

impl InstrumentRegistry {
    pub fn new(
        instruments: HashMap<String, InstrumentConfig>,
        steal_order: Vec<InstrumentFamily>,
    ) -> Self {
        let steal_order = if steal_order.is_empty() {
            InstrumentFamily::DEFAULT_STEAL_ORDER.to_vec()
        } else {
            steal_order
        };
        let mut registry = Self {
            instruments,
            steal_order,
        };
        for config in registry.instruments.values_mut() {
            config.max_voices = config.max_voices.max(1);
        }
        registry
    }

    pub fn get(&self, key: &str) -> Option<&InstrumentConfig> {
        self.instruments.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut InstrumentConfig> {
        self.instruments.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.instruments.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.instruments.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstrumentConfig)> {
        self.instruments.iter()
    }

    /// Steal priority rank for a family: lower rank is stolen first.
    /// Families missing from the configured order are stolen last.
    pub fn steal_rank(&self, family: InstrumentFamily) -> usize {
        self.steal_order
            .iter()
            .position(|f| *f == family)
            .unwrap_or(usize::MAX)
    }
}
