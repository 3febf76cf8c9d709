//! Voice allocation, stealing and release across all instruments.
//!
//! This is the timing-critical heart of the engine: every graph event lands
//! here, often in bursts when many nodes appear at once. The allocation
//! policy, in order:
//!
//! 1. Fresh slot, if the instrument is under its own cap and the system is
//!    under the quality ceiling.
//! 2. Otherwise steal the oldest voice of the *same* instrument, whether
//!    its own cap or the global ceiling is what binds. Oldest-first keeps
//!    the newest layer of a burst intact, which sounds far better than
//!    dropping the note that just triggered.
//! 3. Only when the instrument has no voice to give up and the global
//!    ceiling is saturated, steal the oldest voice of the
//!    lowest-steal-priority family (ambient first by default, order
//!    configurable). Refuse only when nothing anywhere is live.
//!
//! The hot path is a free-list pop; steals scan a single bounded pool (at
//! most one instrument's `max_voices` slots), never the full voice set.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::AllocationError;
use crate::instrument::InstrumentRegistry;
use crate::quality::QualityHandle;
use crate::synth::{AdsrEnvelope, VoiceSource};
use crate::voice::{Voice, VoiceHandle, VoicePool};

/// One allocation request, frequency already detuned.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest<'a> {
    pub instrument: &'a str,
    pub frequency: f32,
    pub velocity: f32,
    /// Scheduled duration in seconds.
    pub duration: f32,
}

pub struct VoiceManager {
    pools: HashMap<Arc<str>, VoicePool>,
    quality: QualityHandle,
    /// Optional configured cap below the quality ceiling.
    hard_cap: Option<usize>,
    total_live: usize,
    next_seq: u64,
    sample_rate: f32,
}

impl VoiceManager {
    pub fn new(quality: QualityHandle, sample_rate: f32) -> Self {
        Self {
            pools: HashMap::new(),
            quality,
            hard_cap: None,
            total_live: 0,
            next_seq: 0,
            sample_rate,
        }
    }

    /// Creates or resizes pools to match the registry. Disabled
    /// instruments have their in-flight voices dropped immediately.
    pub fn sync_with_registry(&mut self, registry: &InstrumentRegistry) {
        for (key, config) in registry.iter() {
            match self.pools.get_mut(key.as_str()) {
                Some(pool) => {
                    let before = pool.live();
                    pool.resize(config.max_voices);
                    self.total_live -= before - pool.live();
                    if !config.enabled && pool.live() > 0 {
                        self.total_live -= pool.live();
                        pool.clear();
                    }
                }
                None => {
                    let key: Arc<str> = Arc::from(key.as_str());
                    self.pools
                        .insert(key.clone(), VoicePool::new(key, config.max_voices));
                }
            }
        }
    }

    pub fn active_voice_count(&self) -> usize {
        self.total_live
    }

    /// Sets the configured voice cap; effective ceiling is the minimum of
    /// this and the current quality ceiling.
    pub fn set_hard_cap(&mut self, cap: Option<usize>) {
        self.hard_cap = cap;
    }

    pub fn instrument_voice_count(&self, instrument: &str) -> usize {
        self.pools.get(instrument).map(|p| p.live()).unwrap_or(0)
    }

    /// Allocates a voice per the three-step policy. Validation failures and
    /// disabled instruments are local errors the caller simply drops.
    pub fn allocate(
        &mut self,
        registry: &InstrumentRegistry,
        req: AllocRequest<'_>,
        source: VoiceSource,
        envelope: AdsrEnvelope,
        now_frame: u64,
    ) -> Result<VoiceHandle, AllocationError> {
        if !req.frequency.is_finite()
            || !req.velocity.is_finite()
            || !req.duration.is_finite()
            || !(0.0..=1.0).contains(&req.velocity)
            || req.duration <= 0.0
            || req.frequency <= 0.0
        {
            return Err(AllocationError::InvalidParameters);
        }

        let config = registry
            .get(req.instrument)
            .filter(|c| c.enabled)
            .ok_or(AllocationError::InstrumentDisabled)?;

        if !self.pools.contains_key(req.instrument) {
            return Err(AllocationError::InstrumentDisabled);
        }

        let mut ceiling = self.quality.profile().max_total_voices;
        if let Some(cap) = self.hard_cap {
            ceiling = ceiling.min(cap);
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        let duration_frames = (req.duration * self.sample_rate).ceil() as u64;
        let voice = Voice {
            frequency: req.frequency,
            velocity: req.velocity,
            gain: config.gain * req.velocity,
            started_frame: now_frame,
            end_frame: now_frame + duration_frames,
            seq,
            source,
            envelope,
        };

        let own_live = self.instrument_voice_count(req.instrument);

        // Step 1: fresh slot.
        if own_live < config.max_voices && self.total_live < ceiling {
            let pool = self.pools.get_mut(req.instrument).expect("pool exists");
            if !pool.is_full() {
                self.total_live += 1;
                return Ok(pool.insert(voice));
            }
        }

        // Step 2: steal the instrument's own oldest voice, whether its cap
        // or the global ceiling is what binds. Total live count is
        // unchanged, so the ceiling holds.
        if own_live > 0 {
            let pool = self.pools.get_mut(req.instrument).expect("pool exists");
            let slot = pool.oldest_slot().expect("live count implies live voice");
            debug!(
                instrument = req.instrument,
                slot, "stealing oldest voice of same instrument"
            );
            pool.release_slot(slot);
            return Ok(pool.insert(voice));
        }

        // Step 3: the instrument has nothing to give up and the global
        // ceiling is saturated. Steal from the family that gives up voices
        // first; ties broken by oldest voice.
        let victim = self
            .pools
            .iter()
            .filter(|(_, pool)| pool.live() > 0)
            .filter_map(|(key, pool)| {
                let family = registry.get(key)?.family;
                let oldest = pool.oldest_seq()?;
                Some((registry.steal_rank(family), oldest, key.clone()))
            })
            .min_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)))
            .map(|(_, _, key)| key);

        let Some(victim_key) = victim else {
            return Err(AllocationError::PoolExhausted);
        };

        let victim_pool = self.pools.get_mut(&victim_key).expect("victim exists");
        let slot = victim_pool.oldest_slot().expect("victim has live voice");
        debug!(
            instrument = req.instrument,
            victim = %victim_key,
            slot,
            "global ceiling saturated, cross-instrument steal"
        );
        victim_pool.release_slot(slot);
        let pool = self.pools.get_mut(req.instrument).expect("pool exists");
        Ok(pool.insert(voice))
    }

    /// Idempotent release. Double release and release-after-steal are
    /// no-ops by generation check.
    pub fn release(&mut self, handle: &VoiceHandle) {
        if let Some(pool) = self.pools.get_mut(handle.instrument.as_ref()) {
            if pool.release(handle) {
                self.total_live -= 1;
            }
        }
    }

    /// Drops every live voice of one instrument.
    pub fn release_instrument(&mut self, instrument: &str) {
        if let Some(pool) = self.pools.get_mut(instrument) {
            self.total_live -= pool.live();
            pool.clear();
        }
    }

    /// Drops every live voice. Synchronous: when this returns nothing is
    /// scheduled to sound.
    pub fn release_all(&mut self) {
        for pool in self.pools.values_mut() {
            pool.clear();
        }
        self.total_live = 0;
    }

    /// Renders one instrument's live voices additively into `buf`, starting
    /// at engine frame `start_frame`. Voices whose duration elapses inside
    /// the block get their note-off there; voices whose envelope finishes
    /// are freed afterwards.
    pub fn render_instrument(&mut self, instrument: &str, buf: &mut [f32], start_frame: u64) {
        let sample_rate = self.sample_rate;
        let Some(pool) = self.pools.get_mut(instrument) else {
            return;
        };

        let mut finished: Vec<usize> = Vec::new();
        for (slot, voice) in pool.iter_live_mut() {
            for (i, out) in buf.iter_mut().enumerate() {
                let frame = start_frame + i as u64;
                if frame >= voice.end_frame {
                    voice.envelope.note_off();
                }
                if voice.envelope.is_done() {
                    break;
                }
                let level = voice.envelope.next(sample_rate);
                let sample = voice.source.next(voice.frequency, sample_rate);
                *out += sample * level * voice.gain;
            }
            if voice.envelope.is_done() || voice.source.exhausted() {
                finished.push(slot);
            }
        }
        for slot in finished {
            if pool.release_slot(slot) {
                self.total_live -= 1;
            }
        }
    }

    /// Fast-releases the oldest voices until at most `limit` are still
    /// holding. Runs when the emergency cap lands while more voices are
    /// live than it allows; the released voices free themselves once their
    /// shortened tails finish.
    pub fn cull_to(&mut self, limit: usize) {
        let mut holding: Vec<(Arc<str>, usize, u64)> = Vec::new();
        for (key, pool) in &self.pools {
            for (slot, voice) in pool.iter_live() {
                if !voice.envelope.is_releasing() {
                    holding.push((key.clone(), slot, voice.seq));
                }
            }
        }
        if holding.len() <= limit {
            return;
        }
        holding.sort_by_key(|(_, _, seq)| *seq);
        let excess = holding.len() - limit;
        for (key, slot, _) in holding.drain(..excess) {
            if let Some(voice) = self.pools.get_mut(&key).and_then(|p| p.voice_mut(slot)) {
                voice.envelope.fast_release();
            }
        }
    }

    /// Instrument keys that currently have at least one live voice.
    pub fn live_instruments(&self) -> Vec<Arc<str>> {
        self.pools
            .iter()
            .filter(|(_, pool)| pool.live() > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InstrumentConfig, InstrumentFamily};
    use crate::quality::{QualityHandle, QualityLevel};
    use crate::synth::{patch_for_family, Waveform};

    fn registry(entries: &[(&str, InstrumentFamily, usize, bool)]) -> InstrumentRegistry {
        let instruments = entries
            .iter()
            .map(|(key, family, max_voices, enabled)| {
                (
                    key.to_string(),
                    InstrumentConfig {
                        enabled: *enabled,
                        family: *family,
                        max_voices: *max_voices,
                        ..InstrumentConfig::default()
                    },
                )
            })
            .collect();
        InstrumentRegistry::new(instruments, Vec::new())
    }

    fn manager(registry: &InstrumentRegistry) -> VoiceManager {
        let mut vm = VoiceManager::new(QualityHandle::new(QualityLevel::Ultra), 48000.0);
        vm.sync_with_registry(registry);
        vm
    }

    fn alloc(
        vm: &mut VoiceManager,
        registry: &InstrumentRegistry,
        instrument: &str,
        frequency: f32,
    ) -> Result<VoiceHandle, AllocationError> {
        let (_, adsr) = patch_for_family(InstrumentFamily::Lead);
        vm.allocate(
            registry,
            AllocRequest {
                instrument,
                frequency,
                velocity: 0.8,
                duration: 1.0,
            },
            VoiceSource::procedural(Waveform::Sine),
            AdsrEnvelope::new(adsr),
            0,
        )
    }

    #[test]
    fn per_instrument_cap_is_never_exceeded() {
        let registry = registry(&[("piano", InstrumentFamily::Lead, 4, true)]);
        let mut vm = manager(&registry);
        for i in 0..5 {
            alloc(&mut vm, &registry, "piano", 220.0 + i as f32 * 110.0).unwrap();
            assert!(vm.instrument_voice_count("piano") <= 4);
        }
        assert_eq!(vm.instrument_voice_count("piano"), 4);
    }

    #[test]
    fn same_instrument_steal_evicts_oldest() {
        let registry = registry(&[("piano", InstrumentFamily::Lead, 2, true)]);
        let mut vm = manager(&registry);
        let first = alloc(&mut vm, &registry, "piano", 220.0).unwrap();
        let _second = alloc(&mut vm, &registry, "piano", 330.0).unwrap();
        let _third = alloc(&mut vm, &registry, "piano", 440.0).unwrap();

        // First (oldest) was stolen; releasing its stale handle is a no-op.
        let live_before = vm.active_voice_count();
        vm.release(&first);
        assert_eq!(vm.active_voice_count(), live_before);
        assert_eq!(vm.instrument_voice_count("piano"), 2);
    }

    #[test]
    fn global_ceiling_triggers_cross_instrument_steal_of_ambient() {
        let registry = registry(&[
            ("pad", InstrumentFamily::Ambient, 16, true),
            ("lead", InstrumentFamily::Lead, 16, true),
            ("piano", InstrumentFamily::Lead, 16, true),
        ]);
        // Low ceiling so the global cap binds before per-instrument caps.
        let handle = QualityHandle::new(QualityLevel::Low); // 16 voices
        let mut vm = VoiceManager::new(handle, 48000.0);
        vm.sync_with_registry(&registry);

        for i in 0..8 {
            alloc(&mut vm, &registry, "pad", 100.0 + i as f32).unwrap();
        }
        for i in 0..8 {
            alloc(&mut vm, &registry, "lead", 400.0 + i as f32).unwrap();
        }
        assert_eq!(vm.active_voice_count(), 16);

        // Piano has zero voices; global saturated: ambient pays first.
        alloc(&mut vm, &registry, "piano", 880.0).unwrap();
        assert_eq!(vm.active_voice_count(), 16);
        assert_eq!(vm.instrument_voice_count("pad"), 7);
        assert_eq!(vm.instrument_voice_count("lead"), 8);
        assert_eq!(vm.instrument_voice_count("piano"), 1);
    }

    #[test]
    fn global_saturation_steals_from_the_requesting_instrument_first() {
        let registry = registry(&[
            ("pad", InstrumentFamily::Ambient, 16, true),
            ("lead", InstrumentFamily::Lead, 16, true),
        ]);
        let handle = QualityHandle::new(QualityLevel::Low); // 16 voices
        let mut vm = VoiceManager::new(handle, 48000.0);
        vm.sync_with_registry(&registry);

        for i in 0..12 {
            alloc(&mut vm, &registry, "pad", 100.0 + i as f32).unwrap();
        }
        for i in 0..4 {
            alloc(&mut vm, &registry, "lead", 400.0 + i as f32).unwrap();
        }
        assert_eq!(vm.active_voice_count(), 16);

        // Lead is under its own cap but still holds voices, so it pays for
        // its own trigger; the ambient layer is left alone.
        alloc(&mut vm, &registry, "lead", 880.0).unwrap();
        assert_eq!(vm.active_voice_count(), 16);
        assert_eq!(vm.instrument_voice_count("lead"), 4);
        assert_eq!(vm.instrument_voice_count("pad"), 12);
    }

    #[test]
    fn custom_steal_order_changes_the_victim() {
        let instruments = [
            ("pad", InstrumentFamily::Ambient, 16, true),
            ("lead", InstrumentFamily::Lead, 16, true),
            ("piano", InstrumentFamily::Bass, 16, true),
        ]
        .iter()
        .map(|(key, family, max_voices, enabled)| {
            (
                key.to_string(),
                InstrumentConfig {
                    enabled: *enabled,
                    family: *family,
                    max_voices: *max_voices,
                    ..InstrumentConfig::default()
                },
            )
        })
        .collect();
        // Leads give up voices before ambient here.
        let registry = InstrumentRegistry::new(
            instruments,
            vec![
                InstrumentFamily::Lead,
                InstrumentFamily::Ambient,
                InstrumentFamily::Bass,
            ],
        );
        let mut vm = VoiceManager::new(QualityHandle::new(QualityLevel::Low), 48000.0);
        vm.sync_with_registry(&registry);

        for i in 0..8 {
            alloc(&mut vm, &registry, "pad", 100.0 + i as f32).unwrap();
        }
        for i in 0..8 {
            alloc(&mut vm, &registry, "lead", 400.0 + i as f32).unwrap();
        }
        alloc(&mut vm, &registry, "piano", 880.0).unwrap();
        assert_eq!(vm.instrument_voice_count("lead"), 7);
        assert_eq!(vm.instrument_voice_count("pad"), 8);
    }

    #[test]
    fn global_ceiling_never_exceeded_by_any_sequence() {
        let registry = registry(&[
            ("pad", InstrumentFamily::Ambient, 32, true),
            ("lead", InstrumentFamily::Lead, 32, true),
        ]);
        let handle = QualityHandle::new(QualityLevel::Low); // 16 voices
        let mut vm = VoiceManager::new(handle.clone(), 48000.0);
        vm.sync_with_registry(&registry);

        for i in 0..50 {
            let key = if i % 3 == 0 { "lead" } else { "pad" };
            let _ = alloc(&mut vm, &registry, key, 100.0 + i as f32);
            assert!(
                vm.active_voice_count() <= handle.profile().max_total_voices,
                "ceiling breached at iteration {i}"
            );
        }
    }

    #[test]
    fn disabled_instrument_is_refused() {
        let registry = registry(&[("piano", InstrumentFamily::Lead, 4, false)]);
        let mut vm = manager(&registry);
        assert_eq!(
            alloc(&mut vm, &registry, "piano", 440.0).unwrap_err(),
            AllocationError::InstrumentDisabled
        );
    }

    #[test]
    fn unknown_instrument_is_refused() {
        let registry = registry(&[("piano", InstrumentFamily::Lead, 4, true)]);
        let mut vm = manager(&registry);
        assert_eq!(
            alloc(&mut vm, &registry, "theremin", 440.0).unwrap_err(),
            AllocationError::InstrumentDisabled
        );
    }

    #[test]
    fn invalid_parameters_are_refused() {
        let registry = registry(&[("piano", InstrumentFamily::Lead, 4, true)]);
        let mut vm = manager(&registry);
        let (_, adsr) = patch_for_family(InstrumentFamily::Lead);

        for (frequency, velocity, duration) in [
            (f32::NAN, 0.5, 1.0),
            (440.0, 1.5, 1.0),
            (440.0, -0.1, 1.0),
            (440.0, 0.5, 0.0),
            (440.0, 0.5, -1.0),
            (440.0, f32::INFINITY, 1.0),
            (-440.0, 0.5, 1.0),
        ] {
            let result = vm.allocate(
                &registry,
                AllocRequest {
                    instrument: "piano",
                    frequency,
                    velocity,
                    duration,
                },
                VoiceSource::procedural(Waveform::Sine),
                AdsrEnvelope::new(adsr),
                0,
            );
            assert_eq!(result.unwrap_err(), AllocationError::InvalidParameters);
        }
        assert_eq!(vm.active_voice_count(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let registry = registry(&[("piano", InstrumentFamily::Lead, 4, true)]);
        let mut vm = manager(&registry);
        let handle = alloc(&mut vm, &registry, "piano", 440.0).unwrap();
        vm.release(&handle);
        let after_first = vm.active_voice_count();
        vm.release(&handle);
        assert_eq!(vm.active_voice_count(), after_first);
        assert_eq!(after_first, 0);
    }

    #[test]
    fn disabling_instrument_drops_in_flight_voices() {
        let mut entries = registry(&[("piano", InstrumentFamily::Lead, 4, true)]);
        let mut vm = manager(&entries);
        alloc(&mut vm, &entries, "piano", 440.0).unwrap();
        alloc(&mut vm, &entries, "piano", 550.0).unwrap();
        assert_eq!(vm.active_voice_count(), 2);

        entries.get_mut("piano").unwrap().enabled = false;
        vm.sync_with_registry(&entries);
        assert_eq!(vm.active_voice_count(), 0);
        assert_eq!(vm.instrument_voice_count("piano"), 0);
    }

    #[test]
    fn render_frees_expired_voices() {
        let registry = registry(&[("piano", InstrumentFamily::Lead, 4, true)]);
        let mut vm = manager(&registry);
        let (_, adsr) = patch_for_family(InstrumentFamily::Lead);
        vm.allocate(
            &registry,
            AllocRequest {
                instrument: "piano",
                frequency: 440.0,
                velocity: 0.8,
                duration: 0.01, // 480 frames at 48k
            },
            VoiceSource::procedural(Waveform::Sine),
            AdsrEnvelope::new(adsr),
            0,
        )
        .unwrap();
        assert_eq!(vm.active_voice_count(), 1);

        // Render well past duration + release.
        let mut buf = vec![0.0_f32; 48000];
        vm.render_instrument("piano", &mut buf, 0);
        assert_eq!(vm.active_voice_count(), 0);
        assert!(buf.iter().any(|s| *s != 0.0), "voice produced no audio");
    }
}
