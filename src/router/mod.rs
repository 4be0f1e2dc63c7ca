//! Hybrid dual-brain router.
//!
//! One streaming fast-agent connection per session. Three cooperative
//! tasks race on the event loop — outbound forwarder, inbound receiver,
//! idle watchdog — and the first to finish ends the session; the select
//! drops its siblings, and teardown runs unconditionally. Delegate tool
//! calls preempt into an out-of-band slow-brain task (at most one).

pub mod backend;
pub mod live;
pub mod prompt;
pub mod state;

use crate::agent::ReasoningAgent;
use crate::audio::cues::{Cue, CuePlayer};
use crate::audio::playback::AudioSink;
use crate::config::AssistantConfig;
use crate::dispatch::ToolDispatcher;
use crate::error::Result;
use crate::history::TranscriptLog;
use crate::hub::{DeviceHub, DeviceState, VolumeDuck};
use crate::memory::MemoryProvider;
use crate::messages::{AudioFrame, ToolCall};
use crate::turn::{TurnEngine, TurnEvent};
use backend::{BackendContext, BackendSlot};
use crossbeam_channel::Receiver;
use live::{LiveConnector, LiveSender, LiveSession, ServerEvent};
use state::SessionController;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a live session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The agent completed a turn with the close flag set.
    AgentClosed,
    /// The idle watchdog hit its threshold.
    IdleTimeout,
    /// The user cancelled (button press).
    Cancelled,
    /// The streaming connection dropped.
    ConnectionLost,
}

/// Visual feedback collaborator; effect rendering is external.
pub trait IndicatorSink: Send + Sync {
    /// Push a smoothed intensity level in \[0, 1\].
    fn set_level(&self, level: f32);
}

/// Collaborators the router runs against.
pub struct RouterDeps {
    /// Shared session flags.
    pub controller: Arc<SessionController>,
    /// Local + mesh tool dispatch.
    pub dispatcher: Arc<ToolDispatcher>,
    /// Memory collaborator.
    pub memory: Arc<dyn MemoryProvider>,
    /// Slow-brain reasoner.
    pub reasoner: Arc<dyn ReasoningAgent>,
    /// Shared transcript log.
    pub history: Arc<TranscriptLog>,
    /// Output device for agent audio.
    pub output: Arc<dyn AudioSink>,
    /// Feedback cues (None in headless tests).
    pub cues: Option<Arc<CuePlayer>>,
    /// Device hub for the snapshot refresh.
    pub hub: Arc<dyn DeviceHub>,
    /// Volume ducking helper; restored in teardown.
    pub duck: Arc<VolumeDuck>,
    /// Visual indicator collaborator.
    pub indicator: Option<Arc<dyn IndicatorSink>>,
}

/// Per-session orchestrator for the dual-brain conversation.
pub struct HybridRouter {
    config: crate::config::RouterConfig,
    turn_config: crate::config::TurnConfig,
    sample_rate: u32,
    session_window: Duration,
    deps: RouterDeps,
    /// Last good device snapshot; reused when the hub refresh fails.
    snapshot: Mutex<Vec<DeviceState>>,
}

impl HybridRouter {
    /// Build a router from the assistant config.
    pub fn new(config: &AssistantConfig, deps: RouterDeps) -> Self {
        Self {
            config: config.router.clone(),
            turn_config: config.turn.clone(),
            sample_rate: config.audio.sample_rate,
            session_window: Duration::from_secs(config.session.window_secs),
            deps,
            snapshot: Mutex::new(Vec::new()),
        }
    }

    /// Run one live session until a completion condition wins the race.
    ///
    /// # Errors
    ///
    /// Returns an error only when the connection cannot be established;
    /// everything after that degrades into a [`SessionEnd`] reason.
    pub async fn run_session(
        &self,
        frames: &Receiver<AudioFrame>,
        connector: &dyn LiveConnector,
    ) -> Result<SessionEnd> {
        let controller = &self.deps.controller;
        controller.reset_session_flags();

        let instruction = self.build_instruction().await;
        let mut session = connector.connect(&instruction).await?;
        let sender = session.sender();
        let backend = BackendSlot::new();
        info!("live session established");

        let end = {
            let forwarder = self.forward_audio(frames, &sender);
            let receiver = self.receive_events(&mut session, &sender, &backend);
            let watchdog = self.idle_watchdog(&backend);
            tokio::select! {
                end = forwarder => end,
                end = receiver => end,
                end = watchdog => end,
            }
        };

        // Teardown runs whichever task won the race.
        backend.cancel_active();
        session.close().await;
        self.deps.duck.restore();
        controller.end_processing();
        info!("live session ended: {end:?}");
        Ok(end)
    }

    /// Refresh collaborator context off the event loop and assemble the
    /// system instruction.
    async fn build_instruction(&self) -> String {
        let hub = Arc::clone(&self.deps.hub);
        match tokio::task::spawn_blocking(move || hub.get_all_states()).await {
            Ok(Ok(states)) => {
                *self.lock_snapshot() = states;
            }
            Ok(Err(e)) => debug!("device snapshot refresh failed, reusing stale: {e}"),
            Err(e) => warn!("snapshot refresh task failed: {e}"),
        }

        let memory = Arc::clone(&self.deps.memory);
        let facts = tokio::task::spawn_blocking(move || {
            memory.core_facts().unwrap_or_default()
        })
        .await
        .unwrap_or_default();

        let devices = crate::hub::snapshot_lines(&self.lock_snapshot());
        let recent = self.deps.history.recent(self.config.transcript_window);
        prompt::assemble(&facts, &devices, &recent)
    }

    /// Outbound forwarder: drains the frame queue and streams it, except
    /// while echo suppression or a pending close is active. Honors
    /// cancellation on every iteration. Runs the turn engine in-line for
    /// utterance bookkeeping and indicator feedback.
    async fn forward_audio(
        &self,
        frames: &Receiver<AudioFrame>,
        sender: &Arc<dyn LiveSender>,
    ) -> SessionEnd {
        let poll = Duration::from_millis(self.config.forward_poll_ms);
        let cooldown = Duration::from_millis(self.config.echo_cooldown_ms);
        let controller = &self.deps.controller;
        let mut turn = TurnEngine::new(&self.turn_config, self.sample_rate);
        let mut last_level = f32::MIN;

        loop {
            tokio::time::sleep(poll).await;

            if controller.take_cancel() {
                info!("cancellation honored in forwarder");
                controller.stop_alarm();
                return SessionEnd::Cancelled;
            }

            let mut drained: Vec<AudioFrame> = Vec::new();
            while let Ok(frame) = frames.try_recv() {
                drained.push(frame);
            }

            // Mute while output audio plays, during the post-playback
            // cooldown, and once a close is pending. Frames are consumed
            // and dropped so no stale audio bursts out afterward.
            if controller.close_after_turn() || controller.echo_suppressed(cooldown) {
                continue;
            }
            if drained.is_empty() {
                continue;
            }

            for frame in &drained {
                let update = turn.process(frame);
                if let Some(sink) = &self.deps.indicator
                    && (update.indicator - last_level).abs() > 0.01
                {
                    sink.set_level(update.indicator);
                    last_level = update.indicator;
                }
                match update.event {
                    Some(TurnEvent::SpeechStarted) => {
                        debug!("user speech started");
                    }
                    Some(TurnEvent::Finalized(utterance)) => {
                        debug!(
                            "utterance finalized ({:.1}s), extending session window",
                            utterance.duration_secs()
                        );
                        controller.open_window(self.session_window);
                        turn.reset();
                    }
                    Some(TurnEvent::Abandoned) => {
                        debug!("turn abandoned, no speech before ceiling");
                        turn.reset();
                    }
                    None => {}
                }
            }

            let mut pcm =
                Vec::with_capacity(drained.iter().map(|f| f.samples.len()).sum::<usize>());
            for frame in &drained {
                pcm.extend_from_slice(&frame.samples);
            }
            if sender.send_audio(&pcm, self.sample_rate).await.is_err() {
                warn!("audio send failed, connection gone");
                return SessionEnd::ConnectionLost;
            }
            controller.touch_activity();
        }
    }

    /// Inbound receiver: plays output audio, accumulates transcripts,
    /// dispatches tool calls, and honors the interruption signal.
    async fn receive_events(
        &self,
        session: &mut Box<dyn LiveSession>,
        sender: &Arc<dyn LiveSender>,
        backend: &BackendSlot,
    ) -> SessionEnd {
        let controller = &self.deps.controller;
        loop {
            let event = match session.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    info!("server closed the live session");
                    return SessionEnd::ConnectionLost;
                }
                Err(e) => {
                    warn!("live receive failed: {e}");
                    return SessionEnd::ConnectionLost;
                }
            };
            controller.touch_activity();

            match event {
                ServerEvent::Audio { pcm, sample_rate } => {
                    controller.playback_started();
                    let output = Arc::clone(&self.deps.output);
                    let played =
                        tokio::task::spawn_blocking(move || output.play(&pcm, sample_rate)).await;
                    controller.playback_ended();
                    match played {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("output playback failed: {e}"),
                        Err(e) => warn!("playback task failed: {e}"),
                    }
                }
                ServerEvent::Transcript { role, text } => {
                    self.deps.history.append_fragment(role, &text);
                }
                ServerEvent::ToolCall(call) => {
                    if call.name == self.config.delegate_tool {
                        self.handle_delegate(call, sender, backend);
                    } else if let Some(end) = self.handle_local(call, sender, backend).await {
                        return end;
                    }
                }
                ServerEvent::Interrupted => {
                    debug!("user barged in, cancelling backend task");
                    backend.cancel_active();
                }
                ServerEvent::TurnComplete => {
                    if controller.close_after_turn() {
                        info!("turn complete with close flag set");
                        return SessionEnd::AgentClosed;
                    }
                }
            }
        }
    }

    /// Spawn the slow brain for a delegate call. A live predecessor is
    /// cancelled by the slot.
    fn handle_delegate(&self, call: ToolCall, sender: &Arc<dyn LiveSender>, backend: &BackendSlot) {
        let user_intent = call
            .arguments
            .get("user_intent")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        info!("delegating to slow brain: {user_intent:?}");

        // The backend's disposition decides the close now.
        self.deps.controller.clear_close_after_turn();

        let ctx = BackendContext {
            memory: Arc::clone(&self.deps.memory),
            reasoner: Arc::clone(&self.deps.reasoner),
            controller: Arc::clone(&self.deps.controller),
            sender: Arc::clone(sender),
            delegate_tool: self.config.delegate_tool.clone(),
        };
        backend.replace(backend::spawn(ctx, user_intent, call.id));
    }

    /// Execute a local/mesh tool and answer immediately. Returns a
    /// session end only if the reply cannot be delivered.
    async fn handle_local(
        &self,
        call: ToolCall,
        sender: &Arc<dyn LiveSender>,
        backend: &BackendSlot,
    ) -> Option<SessionEnd> {
        let outcome = self.deps.dispatcher.dispatch(&call, false).await;
        if sender.send_tool_reply(&outcome.reply).await.is_err() {
            warn!("tool reply not delivered, connection gone");
            return Some(SessionEnd::ConnectionLost);
        }

        if outcome.confirm_cue
            && let Some(cues) = &self.deps.cues
        {
            let cues = Arc::clone(cues);
            let _ = tokio::task::spawn_blocking(move || cues.play(Cue::Confirm)).await;
        }

        if backend.is_live() {
            debug!("backend task active, keeping session open after local tool");
        } else {
            self.deps.controller.request_close_after_turn();
        }
        None
    }

    /// Idle watchdog: closes the connection when nothing meaningful has
    /// happened for the configured threshold. A live backend task counts
    /// as activity.
    async fn idle_watchdog(&self, backend: &BackendSlot) -> SessionEnd {
        let threshold = Duration::from_millis(self.config.idle_timeout_ms);
        let poll = Duration::from_millis(self.config.idle_poll_ms);
        let controller = &self.deps.controller;

        loop {
            tokio::time::sleep(poll).await;
            if backend.is_live() {
                controller.touch_activity();
                continue;
            }
            let idle = controller.idle_for();
            if idle >= threshold {
                info!("session idle for {idle:?}, closing");
                return SessionEnd::IdleTimeout;
            }
        }
    }

    fn lock_snapshot(&self) -> std::sync::MutexGuard<'_, Vec<DeviceState>> {
        match self.snapshot.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
