//! Configuration types for the session engine.
//!
//! Every tunable threshold the engine uses lives here with its default.
//! None of the defaults are load-bearing constants baked into call sites;
//! the test suite exercises them through the config structs.

use crate::error::{HearthError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the assistant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Wake word detection settings.
    pub wake: WakeConfig,
    /// Turn segmentation (VAD) settings.
    pub turn: TurnConfig,
    /// Hybrid router settings.
    pub router: RouterConfig,
    /// Tool dispatch settings (local + mesh).
    pub dispatch: DispatchConfig,
    /// Top-level session loop settings.
    pub session: SessionConfig,
    /// Device hub collaborator settings.
    pub hub: HubConfig,
    /// Slow-brain reasoner settings.
    pub reasoner: ReasonerConfig,
}

impl AssistantConfig {
    /// Parse a TOML config file, falling back to defaults when it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| HearthError::Config(format!("{}: {e}", path.display())))
    }
}

/// Audio I/O configuration.
///
/// The frame geometry is fixed by the wake detector's required length:
/// 512 samples of 16 kHz mono 16-bit PCM (32 ms per frame).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Samples per capture frame.
    pub frame_samples: usize,
    /// Playback sample rate in Hz (the fast agent emits 24 kHz PCM).
    pub output_sample_rate: u32,
    /// Capacity of the watchdog-guarded frame queue, in frames.
    ///
    /// Overflowing frames are dropped, bounding memory regardless of how
    /// long the consumer stalls.
    pub queue_frames: usize,
    /// Input device name (None = system default). Passed to the worker.
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Per-frame read timeout for the capture watchdog, in ms.
    pub read_timeout_ms: u64,
    /// Consecutive read timeouts before the worker is restarted.
    pub timeouts_before_restart: u32,
    /// Settle delay after a worker respawn, in ms.
    pub restart_settle_ms: u64,
    /// Worker restarts tolerated inside `restart_window_secs` before the
    /// supervisor escalates to a full service restart.
    pub restart_budget: u32,
    /// Sliding window for the restart budget, in seconds.
    pub restart_window_secs: u64,
    /// Path of the capture worker executable. Empty = sibling of the
    /// current executable named `hearth-capture`.
    pub worker_path: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 512,
            output_sample_rate: 24_000,
            queue_frames: 64,
            input_device: None,
            output_device: None,
            read_timeout_ms: 500,
            timeouts_before_restart: 5,
            restart_settle_ms: 1_000,
            restart_budget: 3,
            restart_window_secs: 60,
            worker_path: None,
        }
    }
}

/// Wake word detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Directory holding 16 kHz mono reference recordings of the keyword.
    pub references_dir: PathBuf,
    /// Detection score threshold in \[0, 1\]. Higher = fewer false accepts.
    pub threshold: f32,
    /// Cooldown after a detection, in ms, during which further matches are
    /// ignored by the session loop.
    pub cooldown_ms: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            references_dir: PathBuf::from("wake-references"),
            threshold: 0.55,
            cooldown_ms: 2_000,
        }
    }
}

/// Turn segmentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Per-frame speech probability above which a frame counts as speech.
    pub speech_threshold: f32,
    /// Consecutive speech frames required before a turn starts
    /// (debounce against transient noise).
    pub start_debounce_frames: u32,
    /// Trailing silence that finalizes an utterance, in ms.
    pub trailing_silence_ms: u64,
    /// Hard ceiling on waiting for speech to start, in ms. Reaching it
    /// abandons the turn.
    pub max_wait_ms: u64,
    /// Indicator intensity while the user is speaking.
    pub indicator_speaking: f32,
    /// Indicator intensity while the line is silent.
    pub indicator_idle: f32,
    /// Per-frame step the smoothed indicator moves toward its target.
    pub indicator_step: f32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.10,
            start_debounce_frames: 2,
            trailing_silence_ms: 1_500,
            max_wait_ms: 8_000,
            indicator_speaking: 0.85,
            indicator_idle: 0.40,
            indicator_step: 0.15,
        }
    }
}

/// Hybrid router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// WebSocket endpoint of the fast-brain streaming agent.
    pub live_url: String,
    /// Forwarder poll interval, in ms.
    pub forward_poll_ms: u64,
    /// Echo-suppression cooldown after output audio ends, in ms. Mic
    /// frames inside this window are dropped.
    pub echo_cooldown_ms: u64,
    /// Idle threshold, in ms: with no outbound audio, inbound event, or
    /// live backend task for this long, the watchdog closes the session.
    pub idle_timeout_ms: u64,
    /// Idle watchdog poll interval, in ms.
    pub idle_poll_ms: u64,
    /// Tool name that delegates a request to the slow brain.
    pub delegate_tool: String,
    /// Number of recent transcript entries folded into the system
    /// instruction.
    pub transcript_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            live_url: "ws://127.0.0.1:8765/live".to_owned(),
            forward_poll_ms: 10,
            echo_cooldown_ms: 600,
            idle_timeout_ms: 7_000,
            idle_poll_ms: 500,
            delegate_tool: "delegate_to_backend".to_owned(),
            transcript_window: 12,
        }
    }
}

/// One remote tool service in the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Short service name used in logs and error text.
    pub name: String,
    /// WebSocket URL of the service.
    pub url: String,
}

/// Tool dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Remote tool services, each with its own supervised connection.
    pub services: Vec<ServiceEndpoint>,
    /// Reconnect backoff after a service connection fails, in seconds.
    pub reconnect_backoff_secs: u64,
    /// Attempts for one remote call before giving up with a text error.
    pub call_attempts: u32,
    /// Per-call timeout, in seconds.
    pub call_timeout_secs: u64,
    /// Wait for a missing connection before the next attempt, in seconds.
    pub offline_wait_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            reconnect_backoff_secs: 5,
            call_attempts: 3,
            call_timeout_secs: 60,
            offline_wait_secs: 3,
        }
    }
}

/// Session state machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session window opened on a trigger, in seconds.
    pub window_secs: u64,
    /// Mailbox poll interval while idle, in ms.
    pub mailbox_poll_ms: u64,
    /// Hour of day (local) after which the once-daily consolidation job
    /// may run while idle.
    pub consolidation_hour: u32,
    /// Directory with the feedback cue WAV files.
    pub cues_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_secs: 8,
            mailbox_poll_ms: 500,
            consolidation_hour: 3,
            cues_dir: PathBuf::from("cues"),
        }
    }
}

/// Device hub collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Base URL of the hub REST API.
    pub base_url: String,
    /// Bearer token for the hub API.
    pub token: String,
    /// Entity id of the media-player volume sensor used for ducking.
    pub volume_entity: String,
    /// Entity id of the mailbox text field.
    pub mailbox_entity: String,
    /// Request timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: "http://hub.local:8123".to_owned(),
            token: String::new(),
            volume_entity: "sensor.media_volume".to_owned(),
            mailbox_entity: "input_text.assistant_mailbox".to_owned(),
            timeout_secs: 5,
        }
    }
}

/// Slow-brain reasoner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasonerConfig {
    /// Chat-completions endpoint of the deep-reasoning provider.
    pub api_url: String,
    /// Model name to request.
    pub model: String,
    /// API key (empty for local servers).
    pub api_key: String,
    /// Request timeout, in seconds. Deep reasoning can be slow.
    pub timeout_secs: u64,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:11434/v1/chat/completions".to_owned(),
            model: "deep-reasoner".to_owned(),
            api_key: String::new(),
            timeout_secs: 120,
        }
    }
}
