//! PCM playback through the system output device via cpal.

use crate::config::AudioConfig;
use crate::error::{HearthError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Output sink for mono i16 PCM. Blocking by contract; async callers
/// offload via `spawn_blocking`. The trait seam lets tests capture audio
/// instead of opening a device.
pub trait AudioSink: Send + Sync {
    /// Play samples at the given rate, blocking until drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the output device fails.
    fn play(&self, samples: &[i16], sample_rate: u32) -> Result<()>;
}

impl AudioSink for PcmPlayback {
    fn play(&self, samples: &[i16], sample_rate: u32) -> Result<()> {
        PcmPlayback::play(self, samples, sample_rate)
    }
}

/// Blocking playback of mono i16 PCM.
///
/// The router's receiver task plays agent audio through this on a worker
/// thread; the session loop closes it during teardown.
pub struct PcmPlayback {
    device: cpal::Device,
    stream_config: StreamConfig,
}

impl PcmPlayback {
    /// Create a playback instance for the configured output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| HearthError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| HearthError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| HearthError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: config.output_sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            stream_config,
        })
    }

    /// Play samples at the given rate, blocking until drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the output stream cannot be created or started.
    pub fn play(&self, samples: &[i16], sample_rate: u32) -> Result<()> {
        // Resample up front if the payload rate differs from the device rate.
        let samples: Vec<f32> = if sample_rate == self.stream_config.sample_rate {
            samples.iter().map(|&s| f32::from(s) / f32::from(i16::MAX)).collect()
        } else {
            let raw: Vec<f32> = samples
                .iter()
                .map(|&s| f32::from(s) / f32::from(i16::MAX))
                .collect();
            rate_convert(&raw, sample_rate, self.stream_config.sample_rate)
        };

        let buffer = Arc::new(Mutex::new(DrainBuffer {
            samples,
            position: 0,
            finished: false,
        }));
        let buffer_cb = Arc::clone(&buffer);

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut buf = match buffer_cb.lock() {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            *sample = buf.samples[buf.position];
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| HearthError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| HearthError::Audio(format!("failed to start output stream: {e}")))?;

        loop {
            std::thread::sleep(std::time::Duration::from_millis(10));
            let buf = buffer
                .lock()
                .map_err(|e| HearthError::Audio(format!("playback buffer lock poisoned: {e}")))?;
            if buf.finished {
                break;
            }
        }

        drop(stream);
        Ok(())
    }
}

/// Internal buffer for tracking drain progress.
struct DrainBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

/// Linear-interpolation rate conversion for playback payloads.
fn rate_convert(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}
