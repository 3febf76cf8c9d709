//! Voice slots and per-instrument pools.
//!
//! A [`Voice`] is one sounding note, exclusively owned by its pool from
//! allocation to release. Pools are fixed-size slot arrays with a free
//! list, so the common allocation case is a pop, and handles carry a
//! generation counter so a stale handle (double release, release after
//! steal) is a no-op instead of killing the wrong voice.

use std::sync::Arc;

use crate::synth::{AdsrEnvelope, VoiceSource};

/// Handle to a live voice. Stale after release or steal.
#[derive(Debug, Clone)]
pub struct VoiceHandle {
    pub(crate) instrument: Arc<str>,
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

impl VoiceHandle {
    pub fn instrument(&self) -> &str {
        &self.instrument
    }
}

/// One sounding note.
pub struct Voice {
    /// Post-detuning frequency in Hz.
    pub frequency: f32,
    /// Velocity 0..1, already folded into `gain`.
    pub velocity: f32,
    /// Instrument gain * velocity.
    pub gain: f32,
    /// Engine frame the voice was triggered at.
    pub started_frame: u64,
    /// Frame the scheduled duration elapses at; release begins here.
    pub end_frame: u64,
    /// Monotonic allocation sequence, used for oldest-first stealing.
    pub seq: u64,
    pub source: VoiceSource,
    pub envelope: AdsrEnvelope,
}

struct Slot {
    voice: Option<Voice>,
    generation: u64,
}

/// Fixed-capacity pool for one instrument.
pub struct VoicePool {
    instrument: Arc<str>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
    /// Highest generation ever truncated away by a shrink. Regrown slots
    /// start here so a stale handle into a truncated slot stays stale.
    retired_generation: u64,
}

impl VoicePool {
    pub fn new(instrument: Arc<str>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Slot {
                voice: None,
                generation: 0,
            })
            .collect();
        // Free list popped from the back; reverse so slot 0 goes first.
        let free = (0..capacity).rev().collect();
        Self {
            instrument,
            slots,
            free,
            live: 0,
            retired_generation: 0,
        }
    }

    pub fn instrument(&self) -> &Arc<str> {
        &self.instrument
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Places a voice in a free slot. Panics if the pool is full; callers
    /// check `is_full` and steal first.
    pub fn insert(&mut self, voice: Voice) -> VoiceHandle {
        let slot = self.free.pop().expect("insert into full voice pool");
        let entry = &mut self.slots[slot];
        entry.generation += 1;
        entry.voice = Some(voice);
        self.live += 1;
        VoiceHandle {
            instrument: self.instrument.clone(),
            slot,
            generation: entry.generation,
        }
    }

    /// Releases by handle. Idempotent: a stale generation is a no-op, and
    /// so is a slot index the pool no longer has after a shrink.
    pub fn release(&mut self, handle: &VoiceHandle) -> bool {
        let Some(entry) = self.slots.get_mut(handle.slot) else {
            return false;
        };
        if entry.generation != handle.generation || entry.voice.is_none() {
            return false;
        }
        entry.voice = None;
        self.free.push(handle.slot);
        self.live -= 1;
        true
    }

    /// Frees a slot directly (steal or natural expiry).
    pub fn release_slot(&mut self, slot: usize) -> bool {
        let entry = &mut self.slots[slot];
        if entry.voice.is_none() {
            return false;
        }
        entry.voice = None;
        self.free.push(slot);
        self.live -= 1;
        true
    }

    /// Slot index of the oldest live voice (lowest allocation sequence).
    /// Scans one bounded pool, never the whole system.
    pub fn oldest_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.voice.as_ref().map(|v| (i, v.seq)))
            .min_by_key(|(_, seq)| *seq)
            .map(|(i, _)| i)
    }

    /// Oldest live voice's allocation sequence, if any.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.slots
            .iter()
            .filter_map(|s| s.voice.as_ref().map(|v| v.seq))
            .min()
    }

    pub fn voice(&self, slot: usize) -> Option<&Voice> {
        self.slots.get(slot).and_then(|s| s.voice.as_ref())
    }

    pub fn voice_mut(&mut self, slot: usize) -> Option<&mut Voice> {
        self.slots.get_mut(slot).and_then(|s| s.voice.as_mut())
    }

    /// Mutable iteration over live voices with their slot index.
    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = (usize, &mut Voice)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.voice.as_mut().map(|v| (i, v)))
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (usize, &Voice)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.voice.as_ref().map(|v| (i, v)))
    }

    /// Drops every live voice. Used by stop() and instrument disable.
    pub fn clear(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.voice.take().is_some() {
                self.free.push(i);
            }
        }
        self.live = 0;
    }

    /// Grows or shrinks capacity on a settings update. Shrinking drops the
    /// oldest voices first until the new cap is met.
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        while self.live > capacity {
            if let Some(slot) = self.oldest_slot() {
                self.release_slot(slot);
            } else {
                break;
            }
        }
        if capacity > self.slots.len() {
            for i in self.slots.len()..capacity {
                self.slots.push(Slot {
                    voice: None,
                    generation: self.retired_generation,
                });
                self.free.push(i);
            }
        } else if capacity < self.slots.len() {
            // Keep indices stable: take surplus empty slots out of the free
            // list, then truncate whatever empty tail remains. A live voice
            // above the new cap keeps its slot until it ends; the manager
            // enforces the cap by live count, not by slot count.
            self.free.retain(|slot| *slot < capacity);
            while self.slots.len() > capacity
                && self.slots.last().is_some_and(|s| s.voice.is_none())
            {
                if let Some(slot) = self.slots.pop() {
                    self.retired_generation = self.retired_generation.max(slot.generation);
                }
            }
        }
    }
}
