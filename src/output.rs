//! Real-time audio output using cpal, plus the background adaptation loop.
//! Works with JACK, ALSA, OpenSL ES, etc.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info};

use crate::engine::AudioEngine;
use crate::error::EngineError;
use crate::quality::{AdaptiveQualityController, ControllerTuning};

/// How often the adaptation loop samples the metrics window.
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the cpal stream feeding an [`AudioEngine`]. Dropping it stops
/// playback.
pub struct OutputStream {
    sample_rate: u32,
    _stream: cpal::Stream,
}

impl OutputStream {
    /// Opens the default output device and starts streaming. The engine's
    /// mono blocks are fanned out to however many channels the device has.
    pub fn start(engine: Arc<Mutex<AudioEngine>>) -> Result<Self, EngineError> {
        let host = cpal::default_host();
        info!("audio host: {:?}", host.id());

        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::AudioUnavailable("no output device found".to_string()))?;
        let name = device
            .name()
            .map_err(|e| EngineError::AudioUnavailable(e.to_string()))?;
        info!("audio device: {name}");

        let config = device
            .default_output_config()
            .map_err(|e| EngineError::AudioUnavailable(e.to_string()))?;
        info!("audio config: {config:?}");

        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => {
                Self::build_stream::<f32>(&device, &config.into(), engine, channels)
            }
            cpal::SampleFormat::I16 => {
                Self::build_stream::<i16>(&device, &config.into(), engine, channels)
            }
            cpal::SampleFormat::U16 => {
                Self::build_stream::<u16>(&device, &config.into(), engine, channels)
            }
            format => return Err(EngineError::UnsupportedFormat(format.to_string())),
        }?;

        stream
            .play()
            .map_err(|e| EngineError::AudioUnavailable(e.to_string()))?;
        info!("audio stream started at {sample_rate} Hz");

        Ok(Self {
            sample_rate,
            _stream: stream,
        })
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        engine: Arc<Mutex<AudioEngine>>,
        channels: usize,
    ) -> Result<cpal::Stream, EngineError>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let mut mono: Vec<f32> = Vec::new();
        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels.max(1);
                    mono.resize(frames, 0.0);
                    {
                        let mut engine = engine.lock().unwrap();
                        engine.render_block(&mut mono);
                    }
                    for (frame, value) in mono.iter().enumerate() {
                        for channel in 0..channels {
                            data[frame * channels + channel] = T::from_sample(*value);
                        }
                    }
                },
                |err| error!("audio stream error: {err}"),
                None,
            )
            .map_err(|e| EngineError::AudioUnavailable(e.to_string()))?;

        Ok(stream)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Background thread that feeds metrics summaries to the quality
/// controller. Runs off the audio thread so adaptation never blocks
/// rendering; published levels reach the render path through the shared
/// quality handle.
pub struct MonitorLoop {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MonitorLoop {
    pub fn start(engine: Arc<Mutex<AudioEngine>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let thread = thread::spawn(move || {
            let (handle, metrics) = {
                let engine = engine.lock().unwrap();
                (engine.quality_handle(), engine.metrics_cell())
            };
            let mut controller =
                AdaptiveQualityController::new(handle, ControllerTuning::default());
            let started = Instant::now();

            while !flag.load(Ordering::Relaxed) {
                thread::sleep(MONITOR_INTERVAL);
                // Lock-free read of the block-rate summary; the engine lock
                // stays with the audio callback.
                let summary = **metrics.load();
                if controller.update(&summary, started.elapsed().as_secs_f64()) {
                    info!(
                        level = ?controller.level(),
                        emergency = controller.in_emergency(),
                        cpu = summary.cpu_proxy,
                        avg_latency_ms = summary.avg_latency_ms,
                        "quality level changed"
                    );
                }
            }
        });

        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
