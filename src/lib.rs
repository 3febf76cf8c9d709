//! # Sonigraph - Polyphonic Knowledge-Graph Sonification Engine
//!
//! Sonigraph turns graph events (node visits, edge traversals, cluster
//! changes) into music in real time. A fixed orchestra of instruments is
//! driven through a polyphonic voice engine that stays responsive under
//! load by degrading quality instead of glitching.
//!
//! ## Core Features
//!
//! - **Pooled Voice Allocation**: per-instrument slot pools with O(1)
//!   allocation, oldest-first stealing, and generation-checked handles
//! - **Frequency Detuning**: simultaneous same-pitch triggers are nudged
//!   apart (±0.1%) to avoid phase-cancellation artifacts
//! - **Per-Instrument Effects**: chorus, filter, and reverb chains with
//!   parameter ramping, plus a master EQ/compressor/limiter bus
//! - **Adaptive Quality**: a monitor thread watches allocation latency and
//!   CPU load, stepping quality down fast and back up cautiously, with an
//!   emergency mode for overload spikes
//! - **Pre-Timed Sequences**: batches of events with per-event offsets,
//!   late-event dropping, and a synchronous stop
//!
//! ## Quick Start
//!
//! ```rust
//! use sonigraph::{AudioEngine, EngineConfig};
//!
//! let mut engine = AudioEngine::new(EngineConfig::default());
//! engine.trigger_immediate("piano", 440.0, 0.9, 1.0);
//!
//! // Offline rendering; real-time playback goes through OutputStream.
//! let buffer = engine.render_offline(0.5);
//! assert!(buffer.iter().any(|s| s.abs() > 0.0));
//! ```

pub mod config;
pub mod detune;
pub mod effects;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod monitor;
pub mod output;
pub mod quality;
pub mod synth;
pub mod voice;
pub mod voice_manager;

pub use config::{EngineConfig, PerformanceConfig, PerformanceMode, SettingsUpdate};
pub use engine::{AudioEngine, PerformanceMetrics, SequencedEvent};
pub use error::{AllocationError, EngineError};
pub use output::{MonitorLoop, OutputStream};
pub use quality::QualityLevel;
