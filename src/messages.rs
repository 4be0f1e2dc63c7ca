//! Data types shared between the session engine's components.

use std::time::Instant;

/// A fixed-length chunk of mono 16-bit PCM from the capture worker.
///
/// Frames are ephemeral: produced once by the worker, consumed exactly once
/// by whichever component currently owns the queue.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples at the configured capture rate.
    pub samples: Vec<i16>,
    /// Timestamp when the supervisor received this frame.
    pub captured_at: Instant,
}

impl AudioFrame {
    /// RMS level of the frame, normalized to \[0, 1\].
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = f64::from(s) / f64::from(i16::MAX);
                v * v
            })
            .sum();
        (sum_sq / self.samples.len() as f64).sqrt() as f32
    }
}

/// One continuous span of user speech bounded by the turn engine.
///
/// Transient: assembled while recording, handed out on finalization.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Concatenated frame samples in capture order.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the first speech frame was captured.
    pub started_at: Instant,
}

impl Utterance {
    /// Utterance duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// A structured tool invocation from the fast agent.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Correlation id; replies are matched by this, not by arrival order.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Raw arguments as received. Normalized at the dispatch boundary.
    pub arguments: serde_json::Value,
}

/// Scheduling hint attached to a tool reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// The agent should speak the result immediately, interrupting any
    /// in-progress output.
    Interrupt,
    /// The agent may fold the result into its current turn.
    WhenIdle,
}

/// The response to a [`ToolCall`], correlated by id.
#[derive(Debug, Clone)]
pub struct ToolReply {
    /// Id of the call this reply answers.
    pub call_id: String,
    /// Tool name, echoed back.
    pub name: String,
    /// Result text. Failures are descriptive text, never absent.
    pub result: String,
    /// Scheduling hint for the agent.
    pub scheduling: Scheduling,
}

/// Whether the session should stay open after a turn completes.
///
/// Emitted as structured data by the reasoning seam; no component above
/// that boundary ever parses text markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionDisposition {
    /// Close the session when the current turn completes.
    #[default]
    Close,
    /// Keep the window open for a follow-up.
    KeepOpen,
}

/// What opened (or asked to open) a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTrigger {
    /// The wake word was detected while idle.
    Wake,
    /// Text arrived through the mailbox channel.
    Text(String),
    /// The autonomous wakeup timer elapsed with a prepared prompt.
    Autonomous(String),
}

impl SessionTrigger {
    /// Background triggers run without a live audio session and suppress
    /// audible confirmation cues.
    pub fn is_silent(&self) -> bool {
        !matches!(self, Self::Wake)
    }
}
