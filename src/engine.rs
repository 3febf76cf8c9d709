//! The engine facade: triggering, sequencing, settings updates, and block
//! rendering.
//!
//! Everything audible funnels through [`AudioEngine::render_block`], which
//! the output stream calls once per buffer. Triggers and settings arrive
//! from other call sites between blocks; settings are queued and applied at
//! the next block boundary so a half-rendered buffer never sees a config
//! change.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PerformanceMode, SettingsUpdate};
use crate::detune::FrequencyDetuner;
use crate::effects::{EffectBusManager, EffectUpdate, Ramp};
use crate::error::EngineError;
use crate::instrument::{BackendKind, InstrumentRegistry};
use crate::monitor::{CracklingRisk, MetricsSummary, PerformanceMonitor, PerformanceSample};
use crate::quality::{QualityHandle, QualityLevel};
use crate::synth::{patch_for_family, AdsrEnvelope, SampleBank, VoiceSource};
use crate::voice::VoiceHandle;
use crate::voice_manager::{AllocRequest, VoiceManager};

/// How late a non-zero-offset sequence event may fire before it is dropped
/// rather than played out of time.
pub const LATE_TOLERANCE_SECONDS: f64 = 0.1;

/// One pre-timed note in a sequence. `timing` is the offset in seconds from
/// the start of the sequence; an offset of exactly zero means "now" and is
/// always admitted, even when the transport has been running for a while.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub instrument: String,
    pub frequency: f32,
    pub velocity: f32,
    /// Scheduled note duration in seconds.
    pub duration: f32,
    pub timing: f64,
}

/// Heap entry for pending sequence events, ordered soonest-first.
struct Scheduled {
    frame: u64,
    seq: u64,
    event: SequencedEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the BinaryHeap pops the earliest frame first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .frame
            .cmp(&self.frame)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Read-only snapshot for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub quality: QualityLevel,
    pub emergency: bool,
    pub active_voices: usize,
    pub avg_alloc_latency_ms: f64,
    pub max_alloc_latency_ms: f64,
    pub cpu_proxy: f64,
    pub stability: f64,
    pub crackling_risk: CracklingRisk,
}

pub struct AudioEngine {
    config: EngineConfig,
    registry: InstrumentRegistry,
    detuner: FrequencyDetuner,
    voices: VoiceManager,
    effects: EffectBusManager,
    monitor: PerformanceMonitor,
    quality: QualityHandle,
    samples: SampleBank,
    master_gain: Ramp,
    sample_rate: f32,
    /// Engine clock in frames since construction.
    frame: u64,
    /// Frame the current sequence's offsets are measured from.
    transport: Option<u64>,
    scheduled: BinaryHeap<Scheduled>,
    sched_seq: u64,
    pending_settings: Vec<SettingsUpdate>,
    /// Latest windowed summary, swapped in once per block so readers never
    /// contend with the render path.
    published: Arc<ArcSwap<MetricsSummary>>,
    last_alloc_latency_ms: f64,
    last_cpu_proxy: f64,
    scratch: Vec<f32>,
}

impl AudioEngine {
    pub fn new(config: EngineConfig) -> Self {
        let sample_rate = config.sample_rate as f32;
        let quality = QualityHandle::new(config.performance.quality);
        let registry =
            InstrumentRegistry::new(config.instruments.clone(), config.steal_order.clone());

        let mut voices = VoiceManager::new(quality.clone(), sample_rate);
        voices.sync_with_registry(&registry);
        voices.set_hard_cap(config.performance.max_concurrent_voices);

        let mut effects = EffectBusManager::new(sample_rate);
        for (key, instrument) in registry.iter() {
            effects.insert_chain(key, instrument.effects);
        }

        let detuner = FrequencyDetuner::new(config.performance.enable_frequency_detuning);
        let master_gain = Ramp::new(config.master_gain.clamp(0.0, 1.0));

        info!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            instruments = config.instruments.len(),
            quality = ?config.performance.quality,
            "engine initialized"
        );

        Self {
            config,
            registry,
            detuner,
            voices,
            effects,
            monitor: PerformanceMonitor::new(),
            quality,
            samples: SampleBank::new(),
            master_gain,
            sample_rate,
            frame: 0,
            transport: None,
            scheduled: BinaryHeap::new(),
            sched_seq: 0,
            pending_settings: Vec::new(),
            published: Arc::new(ArcSwap::from_pointee(MetricsSummary::default())),
            last_alloc_latency_ms: 0.0,
            last_cpu_proxy: 0.0,
            scratch: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn quality_handle(&self) -> QualityHandle {
        self.quality.clone()
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices.active_voice_count()
    }

    /// Engine time in seconds, derived from the frame clock.
    pub fn now_seconds(&self) -> f64 {
        self.frame as f64 / self.sample_rate as f64
    }

    /// Fires one note right now. Returns the voice handle on success; a
    /// failed trigger (bad parameters, disabled instrument, exhausted pool)
    /// is logged and dropped without disturbing playback.
    pub fn trigger_immediate(
        &mut self,
        instrument: &str,
        frequency: f32,
        velocity: f32,
        duration: f32,
    ) -> Option<VoiceHandle> {
        let started = Instant::now();
        let now = self.now_seconds();

        let frequency = self.detuner.detune(frequency, now);
        let (source, envelope) = self.voice_patch(instrument, frequency)?;
        let req = AllocRequest {
            instrument,
            frequency,
            velocity,
            duration,
        };
        match self
            .voices
            .allocate(&self.registry, req, source, envelope, self.frame)
        {
            Ok(handle) => {
                let elapsed = started.elapsed();
                self.last_alloc_latency_ms = elapsed.as_secs_f64() * 1_000.0;
                self.monitor.record_allocation(
                    now,
                    elapsed,
                    self.voices.active_voice_count(),
                    self.last_cpu_proxy,
                );
                Some(handle)
            }
            Err(err) => {
                debug!(instrument, %err, "dropping trigger");
                None
            }
        }
    }

    /// Releases a voice early. Stale handles are no-ops.
    pub fn release(&mut self, handle: &VoiceHandle) {
        self.voices.release(handle);
    }

    /// Queues a list of pre-timed events. The first call starts the
    /// transport; offsets are measured from that point. Events whose slot
    /// already passed by more than [`LATE_TOLERANCE_SECONDS`] are dropped,
    /// except zero-offset events, which always play immediately.
    pub fn play_sequence(&mut self, events: Vec<SequencedEvent>) {
        let start = *self.transport.get_or_insert(self.frame);
        let tolerance = (LATE_TOLERANCE_SECONDS * self.sample_rate as f64) as u64;

        for event in events {
            if event.timing <= 0.0 {
                self.trigger_immediate(
                    &event.instrument,
                    event.frequency,
                    event.velocity,
                    event.duration,
                );
                continue;
            }
            let target = start + (event.timing * self.sample_rate as f64) as u64;
            if target + tolerance < self.frame {
                warn!(
                    instrument = %event.instrument,
                    timing = event.timing,
                    "dropping late sequence event"
                );
                continue;
            }
            if target <= self.frame {
                self.trigger_immediate(
                    &event.instrument,
                    event.frequency,
                    event.velocity,
                    event.duration,
                );
            } else {
                let seq = self.sched_seq;
                self.sched_seq += 1;
                self.scheduled.push(Scheduled {
                    frame: target,
                    seq,
                    event,
                });
            }
        }
    }

    /// Stops playback synchronously: pending events are discarded, the
    /// transport resets, and every live voice is released. By the time this
    /// returns, no stale voice can sound in a later block.
    pub fn stop(&mut self) {
        self.scheduled.clear();
        self.transport = None;
        self.voices.release_all();
        info!("playback stopped");
    }

    /// Validates a settings update and queues it for the next block
    /// boundary. Rejects unknown instrument keys and non-finite gains up
    /// front so a bad update never reaches the render path.
    pub fn update_settings(&mut self, update: SettingsUpdate) -> Result<(), EngineError> {
        for (key, patch) in &update.instruments {
            if !self.registry.contains(key) {
                return Err(EngineError::UnknownInstrument(key.clone()));
            }
            if patch.gain.is_some_and(|g| !g.is_finite() || g < 0.0) {
                return Err(EngineError::InvalidSettings(format!("{key}: gain")));
            }
        }
        if update
            .master_gain
            .is_some_and(|g| !g.is_finite() || g < 0.0)
        {
            return Err(EngineError::InvalidSettings("master_gain".to_string()));
        }
        self.pending_settings.push(update);
        Ok(())
    }

    /// Current metrics snapshot plus the published quality state.
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let summary = self.monitor.summarize();
        PerformanceMetrics {
            quality: self.quality.level(),
            emergency: self.quality.emergency(),
            active_voices: self.voices.active_voice_count(),
            avg_alloc_latency_ms: summary.avg_latency_ms,
            max_alloc_latency_ms: summary.max_latency_ms,
            cpu_proxy: summary.cpu_proxy,
            stability: summary.stability,
            crackling_risk: summary.crackling_risk,
        }
    }

    /// Windowed summary for the adaptation loop.
    pub fn monitor_summary(&self) -> MetricsSummary {
        self.monitor.summarize()
    }

    /// Shared cell the render path refreshes once per block. The monitor
    /// thread reads this instead of taking the engine lock.
    pub fn metrics_cell(&self) -> Arc<ArcSwap<MetricsSummary>> {
        self.published.clone()
    }

    /// Renders one mono block into `out`. This is the real-time path: it
    /// applies queued settings, fires due sequence events, renders and
    /// mixes every sounding instrument through its effect chain, then runs
    /// the master bus and advances the clock.
    pub fn render_block(&mut self, out: &mut [f32]) {
        if out.is_empty() {
            return;
        }
        let started = Instant::now();

        self.apply_pending_settings();
        self.fire_due_events();

        let profile = self.quality.profile();
        if self.quality.emergency() {
            self.voices.cull_to(profile.max_total_voices);
        }

        out.fill(0.0);
        self.scratch.resize(out.len(), 0.0);
        for instrument in self.voices.live_instruments() {
            self.scratch.fill(0.0);
            self.voices
                .render_instrument(&instrument, &mut self.scratch, self.frame);
            self.effects
                .process_instrument(&instrument, &mut self.scratch, &profile);
            for (mixed, sample) in out.iter_mut().zip(self.scratch.iter()) {
                *mixed += *sample;
            }
        }

        for sample in out.iter_mut() {
            *sample *= self.master_gain.advance();
        }
        self.effects.process_master(out);

        self.frame += out.len() as u64;

        // One sample per block keeps the window fed even between triggers.
        let deadline = out.len() as f64 / self.sample_rate as f64;
        self.last_cpu_proxy = started.elapsed().as_secs_f64() / deadline;
        self.monitor.record(PerformanceSample {
            at: self.now_seconds(),
            alloc_latency_ms: self.last_alloc_latency_ms,
            active_voices: self.voices.active_voice_count(),
            cpu_proxy: self.last_cpu_proxy,
        });

        let summary = self.monitor.summarize();
        self.detuner
            .set_high_risk(summary.crackling_risk == CracklingRisk::High);
        self.published.store(Arc::new(summary));
    }

    /// Renders `seconds` of audio offline at the configured block size.
    /// Used by the render subcommand and by tests that need deterministic
    /// output without a device.
    pub fn render_offline(&mut self, seconds: f64) -> Vec<f32> {
        let total = (seconds * self.sample_rate as f64) as usize;
        let block = self.config.block_size.max(1);
        let mut rendered = vec![0.0f32; total];
        for chunk in rendered.chunks_mut(block) {
            self.render_block(chunk);
        }
        rendered
    }

    fn voice_patch(
        &mut self,
        instrument: &str,
        frequency: f32,
    ) -> Option<(VoiceSource, AdsrEnvelope)> {
        let config = self.registry.get(instrument)?;
        let (waveform, adsr) = patch_for_family(config.family);

        if config.backend == BackendKind::Sample {
            if let Some(path) = config.sample_path.as_deref() {
                if let Some(data) = self.samples.get(path) {
                    return Some((
                        VoiceSource::sample(data, frequency),
                        AdsrEnvelope::new(adsr),
                    ));
                }
            }
            // Load failed or no path configured: the note still plays.
            debug!(instrument, "sample backend unavailable, using procedural");
        }

        Some((VoiceSource::procedural(waveform), AdsrEnvelope::new(adsr)))
    }

    fn fire_due_events(&mut self) {
        loop {
            match self.scheduled.peek() {
                Some(next) if next.frame <= self.frame => {}
                _ => break,
            }
            if let Some(due) = self.scheduled.pop() {
                self.trigger_immediate(
                    &due.event.instrument,
                    due.event.frequency,
                    due.event.velocity,
                    due.event.duration,
                );
            }
        }
    }

    fn apply_pending_settings(&mut self) {
        if self.pending_settings.is_empty() {
            return;
        }
        let updates: Vec<SettingsUpdate> = self.pending_settings.drain(..).collect();
        for update in updates {
            for (key, patch) in update.instruments {
                let Some(instrument) = self.registry.get_mut(&key) else {
                    continue;
                };
                if let Some(enabled) = patch.enabled {
                    instrument.enabled = enabled;
                    if !enabled {
                        self.voices.release_instrument(&key);
                    }
                }
                if let Some(gain) = patch.gain {
                    instrument.gain = gain.clamp(0.0, 1.0);
                }
                if let Some(max_voices) = patch.max_voices {
                    instrument.max_voices = max_voices.max(1);
                }
                if let Some(path) = patch.sample_path {
                    self.samples.invalidate(&path);
                    if let Some(old) = instrument.sample_path.replace(path) {
                        self.samples.invalidate(&old);
                    }
                }
                if let Some(effects) = patch.effects {
                    instrument.effects = effects;
                    // Per-stage updates so each parameter ramps in place.
                    self.effects
                        .update_effect(&key, EffectUpdate::Reverb(effects.reverb));
                    self.effects
                        .update_effect(&key, EffectUpdate::Chorus(effects.chorus));
                    self.effects
                        .update_effect(&key, EffectUpdate::Filter(effects.filter));
                }
            }
            if let Some(performance) = update.performance {
                self.detuner
                    .set_enabled(performance.enable_frequency_detuning);
                self.voices
                    .set_hard_cap(performance.max_concurrent_voices);
                if performance.mode == PerformanceMode::Fixed {
                    self.quality.publish(performance.quality, false);
                }
                self.config.performance = performance;
            }
            if let Some(gain) = update.master_gain {
                let gain = gain.clamp(0.0, 1.0);
                self.config.master_gain = gain;
                self.master_gain.set_target(gain, self.sample_rate);
            }
        }
        self.voices.sync_with_registry(&self.registry);
    }
}
