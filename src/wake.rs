//! Wake word detection.
//!
//! A lightweight keyword classifier fed one capture frame at a time.
//! Incoming audio is reduced to MFCC features over a short rolling window
//! and scored against reference recordings of the keyword with dynamic
//! time warping. A positive match opens a session; the detector itself
//! carries no session state.

use crate::config::WakeConfig;
use crate::error::{HearthError, Result};
use crate::messages::AudioFrame;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Analysis window size in samples (25 ms at 16 kHz).
const ANALYSIS_FRAME: usize = 400;
/// Analysis hop in samples (10 ms at 16 kHz).
const ANALYSIS_HOP: usize = 160;
/// Mel filter count.
const MEL_FILTERS: usize = 26;
/// Cepstral coefficients kept per analysis frame.
const NUM_COEFFS: usize = 13;
/// Sample rate the detector operates at. Input is not resampled.
const SAMPLE_RATE: u32 = 16_000;

/// MFCC frames extracted from one reference recording of the keyword.
struct Template {
    coeffs: Vec<Vec<f32>>,
}

/// Keyword detector scoring live audio against stored templates.
pub struct WakeDetector {
    templates: Vec<Template>,
    features: FeatureExtractor,
    threshold: f32,
    /// Rolling sample window (~1 s) the classifier scores against.
    window: Vec<f32>,
    window_samples: usize,
}

impl WakeDetector {
    /// Create a detector and load keyword templates from the configured
    /// references directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable reference recording is found.
    pub fn new(config: &WakeConfig) -> Result<Self> {
        let features = FeatureExtractor::new();
        let templates = load_templates(&config.references_dir, &features)?;
        if templates.is_empty() {
            return Err(HearthError::Wake(format!(
                "no keyword references in {}",
                config.references_dir.display()
            )));
        }

        info!(
            "wake detector ready: {} templates, threshold {}",
            templates.len(),
            config.threshold
        );

        let window_samples = SAMPLE_RATE as usize;
        Ok(Self {
            templates,
            features,
            threshold: config.threshold,
            window: Vec::with_capacity(window_samples + ANALYSIS_FRAME),
            window_samples,
        })
    }

    /// Classify one capture frame. Returns `true` on a keyword match.
    pub fn process(&mut self, frame: &AudioFrame) -> bool {
        self.window.extend(
            frame
                .samples
                .iter()
                .map(|&s| f32::from(s) / f32::from(i16::MAX)),
        );
        if self.window.len() < self.window_samples {
            return false;
        }

        let start = self.window.len() - self.window_samples;
        let coeffs = self.features.extract(&self.window[start..]);

        // Overlap windows by half so a keyword straddling the boundary is
        // still seen whole.
        let drain = self.window_samples / 2;
        if self.window.len() > drain {
            self.window.drain(..drain);
        }

        if coeffs.is_empty() {
            return false;
        }

        let best = self
            .templates
            .iter()
            .map(|t| match_score(&coeffs, &t.coeffs))
            .fold(0.0f32, f32::max);
        best >= self.threshold
    }

    /// Discard buffered audio (after a detection or a session ends).
    pub fn reset(&mut self) {
        self.window.clear();
    }

    /// Number of loaded keyword templates.
    pub fn template_count(&self) -> usize {
        self.templates.len()
    }
}

/// Score one MFCC sequence against a template: DTW distance normalized by
/// path length, mapped into \[0, 1\] where 1 is identical.
fn match_score(input: &[Vec<f32>], template: &[Vec<f32>]) -> f32 {
    let dist = dtw_distance(input, template);
    if !dist.is_finite() {
        return 0.0;
    }
    let normalized = dist / (input.len() + template.len()) as f32;
    1.0 / (1.0 + normalized)
}

/// Standard DTW over MFCC vectors with Euclidean frame distance.
fn dtw_distance(input: &[Vec<f32>], template: &[Vec<f32>]) -> f32 {
    let n = input.len();
    let m = template.len();
    if n == 0 || m == 0 {
        return f32::INFINITY;
    }

    let idx = |i: usize, j: usize| i * (m + 1) + j;
    let mut cost = vec![f32::INFINITY; (n + 1) * (m + 1)];
    cost[idx(0, 0)] = 0.0;

    for i in 1..=n {
        for j in 1..=m {
            let d = frame_distance(&input[i - 1], &template[j - 1]);
            let prev = cost[idx(i - 1, j)]
                .min(cost[idx(i, j - 1)])
                .min(cost[idx(i - 1, j - 1)]);
            cost[idx(i, j)] = d + prev;
        }
    }

    cost[idx(n, m)]
}

fn frame_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

// ---------------------------------------------------------------------------
// MFCC front-end
// ---------------------------------------------------------------------------

/// Shared MFCC extraction state: FFT plan, Hann window, mel filterbank.
struct FeatureExtractor {
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    filterbank: Vec<Vec<f32>>,
}

impl FeatureExtractor {
    fn new() -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(ANALYSIS_FRAME);
        let hann = (0..ANALYSIS_FRAME)
            .map(|n| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * n as f32 / (ANALYSIS_FRAME - 1) as f32).cos())
            })
            .collect();
        let filterbank = mel_filterbank(MEL_FILTERS, ANALYSIS_FRAME, SAMPLE_RATE);
        Self {
            fft,
            hann,
            filterbank,
        }
    }

    /// Extract MFCC vectors, one per 10 ms hop.
    fn extract(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        if samples.len() < ANALYSIS_FRAME {
            return Vec::new();
        }

        let num_frames = (samples.len() - ANALYSIS_FRAME) / ANALYSIS_HOP + 1;
        let mut out = Vec::with_capacity(num_frames);
        let power_len = ANALYSIS_FRAME / 2 + 1;

        for i in 0..num_frames {
            let start = i * ANALYSIS_HOP;
            let slice = &samples[start..start + ANALYSIS_FRAME];

            let mut spectrum: Vec<Complex<f32>> = slice
                .iter()
                .zip(self.hann.iter())
                .map(|(&s, &w)| Complex::new(s * w, 0.0))
                .collect();
            self.fft.process(&mut spectrum);

            let power: Vec<f32> = spectrum[..power_len]
                .iter()
                .map(|c| (c.re * c.re + c.im * c.im) / ANALYSIS_FRAME as f32)
                .collect();

            let log_mel: Vec<f32> = self
                .filterbank
                .iter()
                .map(|filter| {
                    let energy: f32 =
                        filter.iter().zip(power.iter()).map(|(&f, &p)| f * p).sum();
                    energy.max(1e-10).ln()
                })
                .collect();

            out.push(dct_ii(&log_mel, NUM_COEFFS));
        }

        out
    }
}

/// Mel-spaced triangular filterbank over the power spectrum bins.
fn mel_filterbank(num_filters: usize, fft_size: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let power_len = fft_size / 2 + 1;
    let mel_lo = hz_to_mel(0.0);
    let mel_hi = hz_to_mel(sample_rate as f32 / 2.0);

    let points = num_filters + 2;
    let bins: Vec<usize> = (0..points)
        .map(|i| {
            let mel = mel_lo + (mel_hi - mel_lo) * i as f32 / (points - 1) as f32;
            let hz = mel_to_hz(mel);
            ((fft_size as f32 + 1.0) * hz / sample_rate as f32).floor() as usize
        })
        .collect();

    let mut bank = Vec::with_capacity(num_filters);
    for m in 0..num_filters {
        let (left, center, right) = (bins[m], bins[m + 1], bins[m + 2]);
        let mut filter = vec![0.0f32; power_len];
        for (i, val) in filter.iter_mut().enumerate() {
            if i > left && i <= center && center > left {
                *val = (i - left) as f32 / (center - left) as f32;
            } else if i > center && i < right && right > center {
                *val = (right - i) as f32 / (right - center) as f32;
            }
        }
        bank.push(filter);
    }
    bank
}

fn dct_ii(input: &[f32], num_coeffs: usize) -> Vec<f32> {
    let n = input.len();
    (0..num_coeffs)
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    v * (std::f32::consts::PI * k as f32 * (2 * i + 1) as f32 / (2 * n) as f32)
                        .cos()
                })
                .sum()
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

/// Load keyword templates from 16 kHz WAV references in `dir`.
fn load_templates(dir: &Path, features: &FeatureExtractor) -> Result<Vec<Template>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut templates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wav") {
            continue;
        }
        match load_reference_wav(&path) {
            Ok(samples) => {
                let coeffs = features.extract(&samples);
                if !coeffs.is_empty() {
                    info!("loaded keyword reference: {}", path.display());
                    templates.push(Template { coeffs });
                }
            }
            Err(e) => {
                info!("skipping reference {}: {e}", path.display());
            }
        }
    }
    Ok(templates)
}

fn load_reference_wav(path: &Path) -> Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| HearthError::Wake(format!("cannot open {}: {e}", path.display())))?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE {
        return Err(HearthError::Wake(format!(
            "reference must be {SAMPLE_RATE}Hz, got {}Hz: {}",
            spec.sample_rate,
            path.display()
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| HearthError::Wake(format!("read {}: {e}", path.display())))?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| HearthError::Wake(format!("read {}: {e}", path.display())))?,
    };

    if spec.channels > 1 {
        let ch = spec.channels as usize;
        Ok(samples
            .chunks(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect())
    } else {
        Ok(samples)
    }
}
