//! Turn segmentation: bounds one user utterance in the frame stream.
//!
//! The engine is a per-turn state machine:
//! waiting-for-speech → speaking → trailing-silence → finalized,
//! or → abandoned when speech never starts before the hard ceiling.
//!
//! Timing is derived from frame capture timestamps, not wall-clock reads,
//! so the machine is deterministic under test.

use crate::config::TurnConfig;
use crate::messages::{AudioFrame, Utterance};
use std::time::{Duration, Instant};

/// Observable phase of the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// No speech yet; the max-wait clock is running.
    WaitingForSpeech,
    /// The user is speaking.
    Speaking,
    /// Speech paused; the trailing-silence clock is running.
    TrailingSilence,
    /// The utterance was emitted.
    Finalized,
    /// Speech never started before the ceiling.
    Abandoned,
}

/// Event produced by a processed frame.
#[derive(Debug)]
pub enum TurnEvent {
    /// Debounce satisfied; an utterance is being recorded.
    SpeechStarted,
    /// Trailing silence elapsed; the bounded utterance.
    Finalized(Utterance),
    /// Max wait elapsed without speech.
    Abandoned,
}

/// Result of feeding one frame.
#[derive(Debug)]
pub struct TurnUpdate {
    /// Smoothed indicator intensity for visual feedback collaborators.
    pub indicator: f32,
    /// State transition, if one fired on this frame.
    pub event: Option<TurnEvent>,
}

/// Per-utterance segmentation engine.
pub struct TurnEngine {
    config: TurnConfig,
    sample_rate: u32,
    phase: TurnPhase,
    /// Capture time of the first frame of this turn.
    wait_start: Option<Instant>,
    /// Capture time of the first speech frame.
    speech_start: Option<Instant>,
    /// Capture time the current silence run began.
    silence_since: Option<Instant>,
    consecutive_speech: u32,
    buffer: Vec<i16>,
    indicator: f32,
}

impl TurnEngine {
    /// Create an engine ready for one turn.
    pub fn new(config: &TurnConfig, sample_rate: u32) -> Self {
        let indicator = config.indicator_idle;
        Self {
            config: config.clone(),
            sample_rate,
            phase: TurnPhase::WaitingForSpeech,
            wait_start: None,
            speech_start: None,
            silence_since: None,
            consecutive_speech: 0,
            buffer: Vec::new(),
            indicator,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Rearm for the next turn.
    pub fn reset(&mut self) {
        self.phase = TurnPhase::WaitingForSpeech;
        self.wait_start = None;
        self.speech_start = None;
        self.silence_since = None;
        self.consecutive_speech = 0;
        self.buffer.clear();
        self.indicator = self.config.indicator_idle;
    }

    /// Feed one frame through the state machine.
    pub fn process(&mut self, frame: &AudioFrame) -> TurnUpdate {
        let prob = speech_probability(frame);
        let is_speech = prob > self.config.speech_threshold;
        let indicator = self.step_indicator(is_speech);

        if matches!(self.phase, TurnPhase::Finalized | TurnPhase::Abandoned) {
            return TurnUpdate {
                indicator,
                event: None,
            };
        }

        let now = frame.captured_at;
        self.wait_start.get_or_insert(now);
        self.buffer.extend_from_slice(&frame.samples);

        let mut event = None;

        if is_speech {
            self.consecutive_speech += 1;
            if self.consecutive_speech >= self.config.start_debounce_frames {
                // Debounced speech clears any trailing-silence run.
                self.silence_since = None;
                if self.phase == TurnPhase::WaitingForSpeech {
                    self.speech_start = Some(now);
                    event = Some(TurnEvent::SpeechStarted);
                }
                self.phase = TurnPhase::Speaking;
            }
        } else {
            self.consecutive_speech = 0;
            match self.phase {
                TurnPhase::Speaking | TurnPhase::TrailingSilence => {
                    let since = *self.silence_since.get_or_insert(now);
                    self.phase = TurnPhase::TrailingSilence;
                    if now.duration_since(since)
                        >= Duration::from_millis(self.config.trailing_silence_ms)
                    {
                        self.phase = TurnPhase::Finalized;
                        event = Some(TurnEvent::Finalized(self.take_utterance()));
                    }
                }
                TurnPhase::WaitingForSpeech => {
                    let started = self.wait_start.unwrap_or(now);
                    if now.duration_since(started)
                        >= Duration::from_millis(self.config.max_wait_ms)
                    {
                        self.phase = TurnPhase::Abandoned;
                        self.buffer.clear();
                        event = Some(TurnEvent::Abandoned);
                    }
                }
                TurnPhase::Finalized | TurnPhase::Abandoned => {}
            }
        }

        TurnUpdate { indicator, event }
    }

    /// Step the indicator toward its target so visual feedback tracks
    /// speech without flickering on per-frame jitter.
    fn step_indicator(&mut self, is_speech: bool) -> f32 {
        let target = if is_speech {
            self.config.indicator_speaking
        } else {
            self.config.indicator_idle
        };
        let step = self.config.indicator_step;
        if self.indicator < target {
            self.indicator = (self.indicator + step).min(target);
        } else if self.indicator > target {
            self.indicator = (self.indicator - step).max(target);
        }
        self.indicator
    }

    fn take_utterance(&mut self) -> Utterance {
        Utterance {
            samples: std::mem::take(&mut self.buffer),
            sample_rate: self.sample_rate,
            started_at: self.speech_start.unwrap_or_else(Instant::now),
        }
    }
}

/// Per-frame speech probability from normalized RMS.
///
/// Conversational speech at arm's length lands around 0.01–0.1 RMS, so a
/// 10x gain maps it onto \[0.1, 1.0\] against the default 0.10 threshold.
fn speech_probability(frame: &AudioFrame) -> f32 {
    (frame.rms() * 10.0).clamp(0.0, 1.0)
}
