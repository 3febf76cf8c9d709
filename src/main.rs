//! Sonigraph CLI - demo playback, offline rendering, config scaffolding.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};

use sonigraph::config::PerformanceMode;
use sonigraph::{AudioEngine, EngineConfig, MonitorLoop, OutputStream, SequencedEvent};

#[derive(Parser)]
#[command(name = "sonigraph")]
#[command(about = "Polyphonic knowledge-graph sonification engine", long_about = None)]
struct Cli {
    /// Optional TOML config file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play the built-in demo sequence on the default audio device
    Demo {
        /// Playback length in seconds
        #[arg(short, long, default_value = "10.0")]
        duration: f64,
    },

    /// Render the built-in demo sequence to a WAV file
    Render {
        /// Output WAV file path
        output: String,

        /// Render length in seconds
        #[arg(short, long, default_value = "10.0")]
        duration: f64,
    },

    /// Print the default configuration as TOML
    Config {},
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Demo { duration } => {
            let adaptive = config.performance.mode == PerformanceMode::Adaptive
                && config.performance.enable_audio_optimizations;

            let engine = Arc::new(Mutex::new(AudioEngine::new(config)));
            let _stream = OutputStream::start(engine.clone())?;
            let _monitor = adaptive.then(|| MonitorLoop::start(engine.clone()));

            engine.lock().unwrap().play_sequence(demo_sequence(duration));
            std::thread::sleep(Duration::from_secs_f64(duration + 1.0));

            let mut engine = engine.lock().unwrap();
            let metrics = engine.performance_metrics();
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            engine.stop();
        }

        Commands::Render { output, duration } => {
            use hound::{SampleFormat, WavSpec, WavWriter};

            // A pinned quality level renders at its target rate.
            let mut config = config;
            config.sample_rate = config.offline_sample_rate();
            let sample_rate = config.sample_rate;
            let mut engine = AudioEngine::new(config);
            engine.play_sequence(demo_sequence(duration));
            let rendered = engine.render_offline(duration);

            let spec = WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            };
            let mut writer = WavWriter::create(&output, spec)?;
            for sample in rendered {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
            println!("wrote {:.1}s to {output}", duration);
        }

        Commands::Config {} => {
            print!("{}", toml::to_string_pretty(&EngineConfig::default())?);
        }
    }

    Ok(())
}

/// A walk through a small imaginary graph: piano node visits over a
/// pentatonic scale, string harmonies on edges, a pad drone per cluster,
/// bass anchors and percussion ticks for structure.
fn demo_sequence(duration: f64) -> Vec<SequencedEvent> {
    const PENTATONIC: [f32; 5] = [261.63, 293.66, 329.63, 392.00, 440.00];

    let mut events = Vec::new();
    events.push(SequencedEvent {
        instrument: "pad".to_string(),
        frequency: 130.81,
        velocity: 0.5,
        duration: duration as f32,
        timing: 0.0,
    });
    events.push(SequencedEvent {
        instrument: "bass".to_string(),
        frequency: 65.41,
        velocity: 0.8,
        duration: 1.5,
        timing: 0.0,
    });

    let steps = (duration / 0.25) as usize;
    for step in 0..steps {
        let t = step as f64 * 0.25;
        let accent = if step % 4 == 0 { 0.2 } else { 0.0 };
        events.push(SequencedEvent {
            instrument: "piano".to_string(),
            frequency: PENTATONIC[step % PENTATONIC.len()],
            velocity: 0.7 + accent,
            duration: 0.4,
            timing: t,
        });
        if step % 4 == 2 {
            events.push(SequencedEvent {
                instrument: "strings".to_string(),
                frequency: PENTATONIC[(step / 2) % PENTATONIC.len()] * 1.5,
                velocity: 0.6,
                duration: 0.8,
                timing: t,
            });
        }
        if step % 8 == 0 {
            events.push(SequencedEvent {
                instrument: "clicks".to_string(),
                frequency: 880.0,
                velocity: 0.5,
                duration: 0.1,
                timing: t,
            });
        }
        if step % 16 == 0 && step > 0 {
            events.push(SequencedEvent {
                instrument: "bass".to_string(),
                frequency: 65.41 * (1.0 + (step / 16) as f32 * 0.25),
                velocity: 0.8,
                duration: 1.5,
                timing: t,
            });
        }
    }
    events
}
