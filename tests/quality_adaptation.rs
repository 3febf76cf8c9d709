//! Adaptation loop wired to a live engine: quality transitions published by
//! the controller must constrain allocation and rendering immediately.

use sonigraph::instrument::{InstrumentConfig, InstrumentFamily};
use sonigraph::monitor::{CracklingRisk, MetricsSummary};
use sonigraph::quality::{AdaptiveQualityController, ControllerTuning, QualityLevel};
use sonigraph::{AudioEngine, EngineConfig};

fn summary(avg_ms: f64, cpu: f64) -> MetricsSummary {
    MetricsSummary {
        avg_latency_ms: avg_ms,
        max_latency_ms: avg_ms,
        cpu_proxy: cpu,
        stability: 1.0,
        crackling_risk: CracklingRisk::Low,
        active_voices: 0,
    }
}

/// Engine with one big instrument so the global ceiling binds before any
/// per-instrument cap.
fn swarm_engine() -> AudioEngine {
    let mut config = EngineConfig::default();
    config.performance.enable_frequency_detuning = false;
    config.instruments.insert(
        "swarm".to_string(),
        InstrumentConfig {
            family: InstrumentFamily::Ambient,
            max_voices: 64,
            ..InstrumentConfig::default()
        },
    );
    AudioEngine::new(config)
}

#[test]
fn step_down_lowers_the_global_voice_ceiling() {
    let mut engine = swarm_engine();
    let mut controller =
        AdaptiveQualityController::new(engine.quality_handle(), ControllerTuning::default());

    // Sustained overload: Ultra -> High (ceiling 64 -> 48).
    assert!(controller.update(&summary(8.0, 0.85), 0.0));
    assert_eq!(engine.quality_handle().level(), QualityLevel::High);

    for i in 0..64 {
        engine.trigger_immediate("swarm", 100.0 + i as f32 * 7.0, 0.6, 30.0);
    }
    assert!(
        engine.active_voice_count() <= 48,
        "ceiling must bind at the degraded level, got {}",
        engine.active_voice_count()
    );
}

#[test]
fn emergency_mode_caps_and_culls_voices() {
    let mut engine = swarm_engine();
    let mut controller =
        AdaptiveQualityController::new(engine.quality_handle(), ControllerTuning::default());

    for i in 0..12 {
        engine.trigger_immediate("swarm", 100.0 + i as f32 * 9.0, 0.6, 30.0);
    }
    assert_eq!(engine.active_voice_count(), 12);

    // CPU spike past the emergency ceiling.
    assert!(controller.update(&summary(6.0, 0.95), 0.0));
    let handle = engine.quality_handle();
    assert!(handle.emergency());
    let profile = handle.profile();
    assert_eq!(profile.max_total_voices, 8);
    assert!(!profile.chorus_enabled);
    assert!(!profile.filter_enabled);

    // Rendering culls the excess via fast release; the shortened tails
    // finish well inside 100ms.
    engine.render_offline(0.1);
    assert!(
        engine.active_voice_count() <= 8,
        "expected emergency cull, got {}",
        engine.active_voice_count()
    );

    // New triggers steal rather than exceed the emergency cap.
    for i in 0..6 {
        engine.trigger_immediate("swarm", 400.0 + i as f32 * 11.0, 0.6, 30.0);
    }
    assert!(engine.active_voice_count() <= 8);
}

#[test]
fn recovery_leaves_emergency_then_steps_back_up() {
    let engine = swarm_engine();
    let mut controller =
        AdaptiveQualityController::new(engine.quality_handle(), ControllerTuning::default());
    let handle = engine.quality_handle();

    controller.update(&summary(6.0, 0.95), 0.0);
    assert!(handle.emergency());
    assert_eq!(handle.level(), QualityLevel::Low);

    // Healthy metrics every 100ms. Exit needs 3 sustained seconds, then
    // each step up needs 2 more.
    let mut now = 0.0;
    let mut exited_at = None;
    let mut ups = 0;
    while now < 12.0 {
        now += 0.1;
        let changed = controller.update(&summary(0.5, 0.30), now);
        if changed && exited_at.is_none() {
            exited_at = Some(now);
            assert!(!handle.emergency());
        } else if changed {
            ups += 1;
        }
    }

    let exited_at = exited_at.expect("emergency must clear under healthy metrics");
    assert!(exited_at >= 3.0, "exit needs sustained health, got {exited_at}");
    assert_eq!(handle.level(), QualityLevel::Ultra);
    assert_eq!(ups, 3, "Low -> Medium -> High -> Ultra");
}

#[test]
fn brief_spikes_do_not_oscillate_the_level() {
    let engine = swarm_engine();
    let mut controller =
        AdaptiveQualityController::new(engine.quality_handle(), ControllerTuning::default());

    let mut changes = 0;
    let mut now = 0.0;
    for i in 0..100 {
        now += 0.1;
        // Alternate one bad window with one good one.
        let s = if i % 2 == 0 {
            summary(6.0, 0.85)
        } else {
            summary(0.5, 0.30)
        };
        if controller.update(&s, now) {
            changes += 1;
        }
    }

    // Without hysteresis this flip-flops every window; with it the level
    // only walks down to the floor once.
    assert!(changes <= 3, "level changed {changes} times in 10s");
    assert_eq!(engine.quality_handle().level(), QualityLevel::Low);
}
