//! Top-level session state machine.
//!
//! The control loop runs on its own thread and cycles through
//! idle-listening, active-session, and autonomous-wakeup-check. Frames
//! flow from the watchdog-guarded queue into the wake detector while
//! idle; a trigger ducks media, opens a session, and hands the queue to
//! the router. Cancellation is a flag checked at every suspension point.

pub mod timers;

use crate::audio::cues::{Cue, CuePlayer};
use crate::config::AssistantConfig;
use crate::error::{HearthError, Result};
use crate::hub::{Mailbox, VolumeDuck};
use crate::memory::MemoryProvider;
use crate::messages::{AudioFrame, SessionDisposition, SessionTrigger};
use crate::router::live::LiveConnector;
use crate::router::state::SessionController;
use crate::router::{HybridRouter, SessionEnd};
use crate::wake::WakeDetector;
use chrono::{Datelike, Timelike};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use timers::{TimerBoard, TimerKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spoken-output collaborator for turns that run without a live session.
pub trait VoiceOutput: Send + Sync {
    /// Speak the text. Blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis or playback fails; callers log it.
    fn speak(&self, text: &str) -> Result<()>;
}

/// Silent stand-in when no TTS collaborator is wired.
#[derive(Debug, Default)]
pub struct NoopVoice;

impl VoiceOutput for NoopVoice {
    fn speak(&self, text: &str) -> Result<()> {
        debug!("voice output (noop): {text}");
        Ok(())
    }
}

/// Control-loop state, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Scanning frames for the wake word.
    IdleListening,
    /// A session is running.
    ActiveSession,
    /// Checking timers, wakeups, and the mailbox.
    AutonomousWakeupCheck,
}

/// Collaborators the session loop runs against.
pub struct SessionDeps {
    /// Shared session flags.
    pub controller: Arc<SessionController>,
    /// The per-session router.
    pub router: Arc<HybridRouter>,
    /// Builds live connections.
    pub connector: Arc<dyn LiveConnector>,
    /// Mailbox text channel.
    pub mailbox: Arc<dyn Mailbox>,
    /// Volume ducking helper.
    pub duck: Arc<VolumeDuck>,
    /// Feedback cues (None in headless tests).
    pub cues: Option<Arc<CuePlayer>>,
    /// Memory collaborator.
    pub memory: Arc<dyn MemoryProvider>,
    /// Slow brain for silent background turns.
    pub reasoner: Arc<dyn crate::agent::ReasoningAgent>,
    /// Spoken output for silent turns.
    pub voice: Arc<dyn VoiceOutput>,
    /// Timer/wakeup board.
    pub timers: Arc<TimerBoard>,
}

/// The outer control loop.
pub struct SessionLoop {
    config: AssistantConfig,
    wake: WakeDetector,
    frames: Receiver<AudioFrame>,
    deps: SessionDeps,
    runtime: tokio::runtime::Handle,
    shutdown: CancellationToken,
    last_wake: Option<Instant>,
    last_mailbox_poll: Instant,
    last_consolidation: Option<chrono::NaiveDate>,
}

impl SessionLoop {
    /// Build the loop. `runtime` hosts the router's event loop and
    /// background jobs while this loop occupies its own thread.
    pub fn new(
        config: AssistantConfig,
        wake: WakeDetector,
        frames: Receiver<AudioFrame>,
        deps: SessionDeps,
        runtime: tokio::runtime::Handle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            wake,
            frames,
            deps,
            runtime,
            shutdown,
            last_wake: None,
            last_mailbox_poll: Instant::now(),
            last_consolidation: None,
        }
    }

    /// Run until shutdown or an irrecoverable capture failure.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame queue closes underneath the loop
    /// (capture escalation) — the binary exits nonzero on it.
    pub fn run(mut self) -> Result<()> {
        info!("session loop started");
        loop {
            if self.shutdown.is_cancelled() {
                info!("session loop shutting down");
                return Ok(());
            }

            // Idle-time cancellation stops a ringing alarm.
            if self.deps.controller.take_cancel() {
                if self.deps.controller.alarm_ringing() {
                    self.deps.controller.stop_alarm();
                    self.deps.timers.cancel_alarms();
                }
                self.play_cue(Cue::Cancel);
            }

            if let Some(trigger) = self.autonomous_check() {
                self.run_turn(trigger);
                continue;
            }

            match self.frames.recv_timeout(Duration::from_millis(50)) {
                Ok(frame) => {
                    if self.wake.process(&frame) && self.wake_cooldown_elapsed() {
                        self.last_wake = Some(Instant::now());
                        self.wake.reset();

                        if self.deps.controller.alarm_ringing() {
                            // Wake word while ringing stops the alarm
                            // instead of opening a session.
                            info!("wake word stops the ringing alarm");
                            self.deps.controller.stop_alarm();
                            self.deps.timers.cancel_alarms();
                            self.play_cue(Cue::Cancel);
                            continue;
                        }

                        self.run_turn(SessionTrigger::Wake);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(HearthError::Session(
                        "audio frame queue closed (capture escalated)".into(),
                    ));
                }
            }

            self.maybe_consolidate();
        }
    }

    /// Timer, wakeup, and mailbox checks between frames.
    fn autonomous_check(&mut self) -> Option<SessionTrigger> {
        let mut trigger = None;

        for due in self.deps.timers.take_due() {
            match due.kind {
                TimerKind::Alarm => {
                    info!("alarm due, ringing");
                    self.deps.controller.alarm_started();
                    self.play_cue(Cue::Alarm);
                }
                TimerKind::Wakeup(prompt) => {
                    debug!("autonomous wakeup due");
                    trigger.get_or_insert(SessionTrigger::Autonomous(prompt));
                }
            }
        }
        if trigger.is_some() {
            return trigger;
        }

        let poll_every = Duration::from_millis(self.config.session.mailbox_poll_ms);
        if self.last_mailbox_poll.elapsed() >= poll_every {
            self.last_mailbox_poll = Instant::now();
            match self.deps.mailbox.take_text() {
                Ok(Some(text)) => {
                    info!("mailbox trigger: {text:?}");
                    return Some(SessionTrigger::Text(text));
                }
                Ok(None) => {}
                Err(e) => debug!("mailbox poll failed: {e}"),
            }
        }

        None
    }

    /// One active session, from duck to restore.
    fn run_turn(&mut self, trigger: SessionTrigger) {
        if !self.deps.controller.begin_processing() {
            warn!("trigger ignored, a turn is already in flight");
            return;
        }
        info!("state: {:?} -> {:?}", LoopState::IdleListening, LoopState::ActiveSession);
        self.deps.duck.duck();

        match trigger {
            SessionTrigger::Wake => {
                self.play_cue(Cue::Wake);
                self.run_live_session();
            }
            SessionTrigger::Text(text) | SessionTrigger::Autonomous(text) => {
                self.run_silent_turn(&text);
            }
        }

        // Teardown is idempotent with the router's own.
        self.deps.duck.restore();
        self.deps.controller.end_processing();
        self.deps.controller.close_window();
        info!("state: {:?} -> {:?}", LoopState::ActiveSession, LoopState::IdleListening);
    }

    /// Run the streaming router session on the shared runtime.
    fn run_live_session(&mut self) {
        let window = Duration::from_secs(self.config.session.window_secs);
        self.deps.controller.open_window(window);

        let router = Arc::clone(&self.deps.router);
        let connector = Arc::clone(&self.deps.connector);
        let outcome = self
            .runtime
            .block_on(router.run_session(&self.frames, connector.as_ref()));

        match outcome {
            Ok(SessionEnd::Cancelled) => {
                self.deps.timers.cancel_alarms();
                self.play_cue(Cue::Cancel);
            }
            Ok(end) => debug!("live session ended: {end:?}"),
            Err(e) => {
                // Connection loss is not fatal: log, fall back to idle.
                warn!("live session failed: {e}");
            }
        }
    }

    /// Background turn without a live connection: the slow brain answers
    /// directly and the reply is spoken through the TTS collaborator.
    fn run_silent_turn(&mut self, text: &str) {
        let context = self
            .deps
            .memory
            .hybrid_context(text)
            .unwrap_or_default();
        let prompt = format!("{context}\n\nUSER:\n{text}\n\n(Antworte dem User.)");

        let reply = match self.deps.reasoner.respond(&prompt) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("silent turn failed: {e}");
                return;
            }
        };
        if let Err(e) = self.deps.memory.save_interaction(text, &reply.text) {
            warn!("interaction not persisted: {e}");
        }

        // Cancellation between reasoning and speech.
        if self.deps.controller.take_cancel() {
            self.play_cue(Cue::Cancel);
            return;
        }

        if !reply.silent && !reply.text.is_empty() {
            if let Err(e) = self.deps.voice.speak(&reply.text) {
                warn!("voice output failed: {e}");
            }
        }

        if reply.disposition == SessionDisposition::KeepOpen {
            // The agent asked for a follow-up: reopen the window and hand
            // the mic to the live router.
            self.play_cue(Cue::Continuation);
            self.run_live_session();
        }
    }

    /// Once-daily consolidation while idle, off the critical path.
    fn maybe_consolidate(&mut self) {
        let now = chrono::Local::now();
        if now.hour() < self.config.session.consolidation_hour {
            return;
        }
        let today = now.date_naive();
        if self.last_consolidation == Some(today) {
            return;
        }
        if self.deps.controller.session_active() || self.deps.controller.is_processing() {
            return;
        }
        self.last_consolidation = Some(today);
        info!("starting daily consolidation (day {})", today.day());

        let memory = Arc::clone(&self.deps.memory);
        self.runtime.spawn_blocking(move || {
            if let Err(e) = memory.consolidate() {
                warn!("consolidation failed: {e}");
            }
        });
    }

    fn wake_cooldown_elapsed(&self) -> bool {
        let cooldown = Duration::from_millis(self.config.wake.cooldown_ms);
        self.last_wake.is_none_or(|t| t.elapsed() >= cooldown)
    }

    fn play_cue(&self, cue: Cue) {
        if let Some(cues) = &self.deps.cues {
            cues.play(cue);
        }
    }
}
