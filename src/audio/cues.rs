//! Short feedback cues (wake, confirm, continuation, cancel, alarm).
//!
//! Cue WAVs are decoded once at startup. A missing file degrades to
//! silence rather than an error: cues are feedback, not function.

use crate::audio::playback::AudioSink;
use crate::error::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// The feedback cues the session engine can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    /// Session opened by the wake word.
    Wake,
    /// A non-query local tool succeeded.
    Confirm,
    /// Session window reopened for a follow-up.
    Continuation,
    /// A user-initiated cancellation was honored.
    Cancel,
    /// A timer or alarm is due.
    Alarm,
}

impl Cue {
    fn file_name(self) -> &'static str {
        match self {
            Self::Wake => "wake.wav",
            Self::Confirm => "confirm.wav",
            Self::Continuation => "continuation.wav",
            Self::Cancel => "cancel.wav",
            Self::Alarm => "alarm.wav",
        }
    }
}

/// Decoded cue audio, shared with playback.
struct CueClip {
    samples: Vec<i16>,
    sample_rate: u32,
}

/// Plays feedback cues through the shared output device.
pub struct CuePlayer {
    clips: HashMap<Cue, CueClip>,
    playback: Arc<dyn AudioSink>,
}

impl CuePlayer {
    /// Load cue WAVs from `dir`. Missing or undecodable files are logged
    /// and skipped.
    pub fn load(dir: &Path, playback: Arc<dyn AudioSink>) -> Self {
        let mut clips = HashMap::new();
        for cue in [
            Cue::Wake,
            Cue::Confirm,
            Cue::Continuation,
            Cue::Cancel,
            Cue::Alarm,
        ] {
            let path = dir.join(cue.file_name());
            match load_wav(&path) {
                Ok(clip) => {
                    clips.insert(cue, clip);
                }
                Err(e) => {
                    warn!("cue {:?} unavailable ({}): {e}", cue, path.display());
                }
            }
        }
        Self { clips, playback }
    }

    /// Play a cue, blocking until it finishes. Unknown cues are silent.
    pub fn play(&self, cue: Cue) {
        let Some(clip) = self.clips.get(&cue) else {
            debug!("cue {cue:?} not loaded, skipping");
            return;
        };
        if let Err(e) = self.playback.play(&clip.samples, clip.sample_rate) {
            warn!("cue playback failed: {e}");
        }
    }

    /// Whether a cue was loaded (used by tests and diagnostics).
    pub fn has(&self, cue: Cue) -> bool {
        self.clips.contains_key(&cue)
    }
}

fn load_wav(path: &Path) -> Result<CueClip> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| crate::error::HearthError::Audio(format!("open wav: {e}")))?;
    let spec = reader.spec();
    let samples: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| crate::error::HearthError::Audio(format!("decode wav: {e}")))?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| crate::error::HearthError::Audio(format!("decode wav: {e}")))?,
    };

    // Fold multi-channel cues down to mono.
    let samples = if spec.channels > 1 {
        samples
            .chunks_exact(spec.channels as usize)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                (sum / i32::from(spec.channels)) as i16
            })
            .collect()
    } else {
        samples
    };

    Ok(CueClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}
