//! Capture worker body: microphone to stdout.
//!
//! Runs inside the `hearth-capture` child process. Reads from the default
//! (or named) input device via cpal, folds to mono, resamples to the
//! target rate, and writes fixed-size little-endian i16 frames to stdout.
//! The parent's watchdog detects a wedged or dead worker by read timeout.

use crate::config::AudioConfig;
use crate::error::{HearthError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::io::Write;
use tracing::{debug, error, info};

/// Run the capture loop, writing frames to `out` until it is closed or the
/// stream fails.
///
/// This function blocks for the lifetime of the worker process.
///
/// # Errors
///
/// Returns an error if no input device is available, the stream cannot be
/// built, or stdout is closed (parent gone).
pub fn run(config: &AudioConfig, out: &mut dyn Write) -> Result<()> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.input_device {
        host.input_devices()
            .map_err(|e| HearthError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| HearthError::Audio(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| HearthError::Audio("no default input device".into()))?
    };

    let default_config = device
        .default_input_config()
        .map_err(|e| HearthError::Audio(format!("no default input config: {e}")))?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "capture worker: native {}Hz/{}ch -> {}Hz mono, {} samples/frame",
        native_rate, native_channels, config.sample_rate, config.frame_samples
    );

    // The cpal callback must never block, so it hands samples to the
    // writer over a bounded channel and drops on overflow.
    let (tx, rx) = crossbeam_channel::bounded::<Vec<f32>>(32);
    let target_rate = config.sample_rate;

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    fold_to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let samples = if native_rate != target_rate {
                    resample(&mono, native_rate, target_rate)
                } else {
                    mono
                };
                if tx.try_send(samples).is_err() {
                    debug!("worker channel full, dropping samples");
                }
            },
            move |err| {
                error!("input stream error: {err}");
            },
            None,
        )
        .map_err(|e| HearthError::Audio(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| HearthError::Audio(format!("failed to start input stream: {e}")))?;

    // Accumulate into fixed frames and emit them in capture order.
    let mut pending: Vec<i16> = Vec::with_capacity(config.frame_samples * 2);
    let mut buf = vec![0u8; config.frame_samples * 2];
    loop {
        let samples = rx
            .recv()
            .map_err(|_| HearthError::Audio("capture stream stopped".into()))?;
        pending.extend(samples.iter().map(|&s| quantize(s)));

        while pending.len() >= config.frame_samples {
            let frame: Vec<i16> = pending.drain(..config.frame_samples).collect();
            encode_frame(&frame, &mut buf);
            out.write_all(&buf)?;
            out.flush()?;
        }
    }
}

/// Encode a frame as little-endian i16 into `buf` (sized to 2 bytes/sample).
pub fn encode_frame(frame: &[i16], buf: &mut [u8]) {
    for (chunk, &sample) in buf.chunks_exact_mut(2).zip(frame.iter()) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
}

/// Decode a little-endian i16 frame from raw bytes.
pub fn decode_frame(buf: &[u8]) -> Vec<i16> {
    buf.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Average interleaved channels down to mono.
fn fold_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler. Speech energy sits below 8 kHz, so no
/// anti-alias filter is needed for the 48 kHz -> 16 kHz path.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame: Vec<i16> = (0..512).map(|i| (i * 7 - 300) as i16).collect();
        let mut buf = vec![0u8; 1024];
        encode_frame(&frame, &mut buf);
        assert_eq!(decode_frame(&buf), frame);
    }

    #[test]
    fn fold_to_mono_averages_channels() {
        let stereo = [0.5, -0.5, 1.0, 0.0];
        let mono = fold_to_mono(&stereo, 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn resample_halves_length() {
        let input: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let out = resample(&input, 48_000, 16_000);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn quantize_clamps() {
        assert_eq!(quantize(2.0), i16::MAX);
        assert_eq!(quantize(-2.0), -i16::MAX);
        assert_eq!(quantize(0.0), 0);
    }
}
