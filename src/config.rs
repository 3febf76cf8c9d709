//! Engine configuration: instruments, performance mode, load from TOML.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::effects::EffectChainParams;
use crate::error::EngineError;
use crate::instrument::{BackendKind, InstrumentConfig, InstrumentFamily};
use crate::quality::QualityLevel;

/// Performance mode: adapt under load, or pin a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    #[default]
    Adaptive,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub mode: PerformanceMode,
    /// Level used as the starting point (adaptive) or pinned (fixed).
    pub quality: QualityLevel,
    pub enable_frequency_detuning: bool,
    /// Optional hard cap below the quality ceiling.
    pub max_concurrent_voices: Option<usize>,
    /// Gates the monitoring/adaptation loop as a whole.
    pub enable_audio_optimizations: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            mode: PerformanceMode::Adaptive,
            quality: QualityLevel::Ultra,
            enable_frequency_detuning: true,
            max_concurrent_voices: None,
            enable_audio_optimizations: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Linear gain on the summed mix before the master bus.
    pub master_gain: f32,
    /// Cross-instrument steal order, first family gives up voices first.
    /// Empty means the built-in default order.
    pub steal_order: Vec<InstrumentFamily>,
    pub performance: PerformanceConfig,
    pub instruments: HashMap<String, InstrumentConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 512,
            master_gain: 0.8,
            performance: PerformanceConfig::default(),
            instruments: default_instruments(),
            steal_order: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Sample rate for offline rendering. A pinned quality level renders at
    /// its target rate; adaptive mode keeps the configured device rate,
    /// since the level may change mid-render.
    pub fn offline_sample_rate(&self) -> u32 {
        match self.performance.mode {
            PerformanceMode::Fixed => self.performance.quality.profile().sample_rate,
            PerformanceMode::Adaptive => self.sample_rate,
        }
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| EngineError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// The stock graph-sonification orchestra: node visits on piano, edge
/// traversals on harmony, cluster drones on the pad, structural accents on
/// bass and percussion.
fn default_instruments() -> HashMap<String, InstrumentConfig> {
    let mut instruments = HashMap::new();
    instruments.insert(
        "piano".to_string(),
        InstrumentConfig {
            family: InstrumentFamily::Lead,
            max_voices: 8,
            ..InstrumentConfig::default()
        },
    );
    instruments.insert(
        "strings".to_string(),
        InstrumentConfig {
            family: InstrumentFamily::Harmony,
            max_voices: 8,
            gain: 0.6,
            ..InstrumentConfig::default()
        },
    );
    instruments.insert(
        "pad".to_string(),
        InstrumentConfig {
            family: InstrumentFamily::Ambient,
            max_voices: 12,
            gain: 0.4,
            effects: EffectChainParams {
                reverb: crate::effects::ReverbParams {
                    enabled: true,
                    decay: 0.7,
                    wet: 0.35,
                },
                ..EffectChainParams::default()
            },
            ..InstrumentConfig::default()
        },
    );
    instruments.insert(
        "bass".to_string(),
        InstrumentConfig {
            family: InstrumentFamily::Bass,
            max_voices: 4,
            gain: 0.7,
            ..InstrumentConfig::default()
        },
    );
    instruments.insert(
        "clicks".to_string(),
        InstrumentConfig {
            family: InstrumentFamily::Percussion,
            max_voices: 6,
            gain: 0.5,
            backend: BackendKind::Procedural,
            ..InstrumentConfig::default()
        },
    );
    instruments
}

/// Partial per-instrument settings change. `None` leaves a field alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentUpdate {
    pub enabled: Option<bool>,
    pub gain: Option<f32>,
    pub max_voices: Option<usize>,
    /// New WAV asset for a sample-backed instrument. The cached entry for
    /// the path is dropped so the next trigger reloads it.
    pub sample_path: Option<String>,
    pub effects: Option<EffectChainParams>,
}

/// A settings update from outside the real-time path. Validated when
/// submitted, applied at the next block boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub instruments: HashMap<String, InstrumentUpdate>,
    pub performance: Option<PerformanceConfig>,
    pub master_gain: Option<f32>,
}
