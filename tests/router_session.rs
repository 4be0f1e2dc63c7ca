//! End-to-end router sessions against a scripted fast agent.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use crossbeam_channel::Sender;
use hearth::agent::{AgentReply, ReasoningAgent};
use hearth::audio::playback::AudioSink;
use hearth::config::AssistantConfig;
use hearth::dispatch::{DeviceExecuteTool, Registry, ToolDispatcher};
use hearth::error::Result;
use hearth::history::TranscriptLog;
use hearth::hub::{DeviceHub, DeviceState, VolumeDuck};
use hearth::memory::MemoryProvider;
use hearth::messages::{AudioFrame, SessionDisposition, ToolCall, ToolReply};
use hearth::router::live::{
    LiveConnector, LiveSender, LiveSession, ServerEvent, SpeakerRole,
};
use hearth::router::state::SessionController;
use hearth::router::{HybridRouter, RouterDeps, SessionEnd};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

enum Step {
    Event(ServerEvent),
    WaitMs(u64),
}

#[derive(Default)]
struct RecordingSender {
    replies: Mutex<Vec<ToolReply>>,
    audio_sends: Mutex<Vec<(Instant, usize)>>,
}

impl RecordingSender {
    fn replies(&self) -> Vec<ToolReply> {
        self.replies.lock().unwrap().clone()
    }

    fn audio_sends(&self) -> Vec<(Instant, usize)> {
        self.audio_sends.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveSender for RecordingSender {
    async fn send_audio(&self, pcm: &[i16], _sample_rate: u32) -> Result<()> {
        self.audio_sends
            .lock()
            .unwrap()
            .push((Instant::now(), pcm.len()));
        Ok(())
    }

    async fn send_tool_reply(&self, reply: &ToolReply) -> Result<()> {
        self.replies.lock().unwrap().push(reply.clone());
        Ok(())
    }
}

struct ScriptedSession {
    steps: Mutex<VecDeque<Step>>,
    sender: Arc<RecordingSender>,
}

#[async_trait]
impl LiveSession for ScriptedSession {
    fn sender(&self) -> Arc<dyn LiveSender> {
        Arc::clone(&self.sender) as Arc<dyn LiveSender>
    }

    async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Event(event)) => return Ok(Some(event)),
                Some(Step::WaitMs(ms)) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                // Script exhausted: stay connected, let the other tasks
                // decide how the session ends.
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn close(&mut self) {}
}

struct ScriptedConnector {
    session: Mutex<Option<Box<dyn LiveSession>>>,
}

impl ScriptedConnector {
    fn new(steps: Vec<Step>, sender: Arc<RecordingSender>) -> Self {
        Self {
            session: Mutex::new(Some(Box::new(ScriptedSession {
                steps: Mutex::new(steps.into_iter().collect()),
                sender,
            }))),
        }
    }
}

#[async_trait]
impl LiveConnector for ScriptedConnector {
    async fn connect(&self, _system_instruction: &str) -> Result<Box<dyn LiveSession>> {
        Ok(self.session.lock().unwrap().take().expect("one session"))
    }
}

struct FakeHub {
    executed: Mutex<Vec<(String, String)>>,
}

impl FakeHub {
    fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
        }
    }
}

impl DeviceHub for FakeHub {
    fn get_all_states(&self) -> Result<Vec<DeviceState>> {
        Ok(vec![])
    }

    fn execute(&self, entity_id: &str, action: &str, _args: &serde_json::Value) -> String {
        self.executed
            .lock()
            .unwrap()
            .push((entity_id.to_owned(), action.to_owned()));
        "Ok.".to_owned()
    }

    fn media_volume(&self) -> Result<f32> {
        Ok(0.6)
    }

    fn set_media_volume(&self, _level: f32) -> String {
        "Ok.".to_owned()
    }
}

struct FakeReasoner {
    delay_ms: u64,
    reply: AgentReply,
    prompts: Mutex<Vec<String>>,
}

impl ReasoningAgent for FakeReasoner {
    fn respond(&self, prompt: &str) -> Result<AgentReply> {
        self.prompts.lock().unwrap().push(prompt.to_owned());
        std::thread::sleep(Duration::from_millis(self.delay_ms));
        Ok(self.reply.clone())
    }
}

#[derive(Default)]
struct RecordingMemory {
    saved: Mutex<Vec<(String, String)>>,
}

impl MemoryProvider for RecordingMemory {
    fn hybrid_context(&self, _query: &str) -> Result<String> {
        Ok("FAKTEN: Nutzer mag es warm.".to_owned())
    }

    fn core_facts(&self) -> Result<String> {
        Ok(String::new())
    }

    fn save_interaction(&self, user_text: &str, assistant_text: &str) -> Result<()> {
        self.saved
            .lock()
            .unwrap()
            .push((user_text.to_owned(), assistant_text.to_owned()));
        Ok(())
    }

    fn consolidate(&self) -> Result<()> {
        Ok(())
    }
}

/// Output sink that records the playback window.
#[derive(Default)]
struct RecordingSink {
    windows: Mutex<Vec<(Instant, Instant)>>,
    play_ms: u64,
}

impl RecordingSink {
    fn with_duration(play_ms: u64) -> Self {
        Self {
            windows: Mutex::new(Vec::new()),
            play_ms,
        }
    }
}

impl AudioSink for RecordingSink {
    fn play(&self, _samples: &[i16], _sample_rate: u32) -> Result<()> {
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(self.play_ms));
        self.windows.lock().unwrap().push((start, Instant::now()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    router: Arc<HybridRouter>,
    controller: Arc<SessionController>,
    sender: Arc<RecordingSender>,
    connector: ScriptedConnector,
    memory: Arc<RecordingMemory>,
    reasoner: Arc<FakeReasoner>,
    sink: Arc<RecordingSink>,
    hub: Arc<FakeHub>,
    history: Arc<TranscriptLog>,
    frames_tx: Sender<AudioFrame>,
    frames_rx: crossbeam_channel::Receiver<AudioFrame>,
}

fn test_config() -> AssistantConfig {
    let mut config = AssistantConfig::default();
    config.router.idle_timeout_ms = 600;
    config.router.idle_poll_ms = 50;
    config.router.echo_cooldown_ms = 200;
    config.router.forward_poll_ms = 5;
    config
}

fn harness_with(config: AssistantConfig, steps: Vec<Step>, reasoner: FakeReasoner) -> Harness {
    harness_with_sink(config, steps, reasoner, RecordingSink::with_duration(0))
}

fn harness_with_sink(
    config: AssistantConfig,
    steps: Vec<Step>,
    reasoner: FakeReasoner,
    sink: RecordingSink,
) -> Harness {
    let controller = Arc::new(SessionController::new());
    let sender = Arc::new(RecordingSender::default());
    let connector = ScriptedConnector::new(steps, Arc::clone(&sender));
    let hub = Arc::new(FakeHub::new());
    let memory = Arc::new(RecordingMemory::default());
    let reasoner = Arc::new(reasoner);
    let sink = Arc::new(sink);
    let history = Arc::new(TranscriptLog::new(32));
    let (frames_tx, frames_rx) = crossbeam_channel::bounded(256);

    let mut registry = Registry::new();
    registry.register(Arc::new(DeviceExecuteTool::new(
        Arc::clone(&hub) as Arc<dyn DeviceHub>
    )));
    let dispatcher = Arc::new(ToolDispatcher::new(registry, None));

    let router = Arc::new(HybridRouter::new(
        &config,
        RouterDeps {
            controller: Arc::clone(&controller),
            dispatcher,
            memory: Arc::clone(&memory) as Arc<dyn MemoryProvider>,
            reasoner: Arc::clone(&reasoner) as Arc<dyn ReasoningAgent>,
            history: Arc::clone(&history),
            output: Arc::clone(&sink) as Arc<dyn AudioSink>,
            cues: None,
            hub: Arc::clone(&hub) as Arc<dyn DeviceHub>,
            duck: Arc::new(VolumeDuck::new(Arc::clone(&hub) as Arc<dyn DeviceHub>)),
            indicator: None,
        },
    ));

    Harness {
        router,
        controller,
        sender,
        connector,
        memory,
        reasoner,
        sink,
        hub,
        history,
        frames_tx,
        frames_rx,
    }
}

fn quiet_reasoner() -> FakeReasoner {
    FakeReasoner {
        delay_ms: 0,
        reply: AgentReply {
            text: "unbenutzt".into(),
            disposition: SessionDisposition::Close,
            silent: false,
        },
        prompts: Mutex::new(Vec::new()),
    }
}

fn frame(amplitude: i16) -> AudioFrame {
    AudioFrame {
        samples: vec![amplitude; 512],
        captured_at: Instant::now(),
    }
}

// ---------------------------------------------------------------------------
// Scenario A: local device tool call
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn local_tool_call_replies_and_closes_after_turn() {
    let steps = vec![
        Step::Event(ServerEvent::Transcript {
            role: SpeakerRole::User,
            text: "Licht an".into(),
        }),
        Step::Event(ServerEvent::ToolCall(ToolCall {
            id: "c1".into(),
            name: "device_execute".into(),
            arguments: json!({ "entity_id": "light.stehlampe", "action": "light.turn_on" }),
        })),
        Step::WaitMs(50),
        Step::Event(ServerEvent::TurnComplete),
    ];
    let h = harness_with(test_config(), steps, quiet_reasoner());

    let end = h
        .router
        .run_session(&h.frames_rx, &h.connector)
        .await
        .unwrap();

    assert_eq!(end, SessionEnd::AgentClosed);
    let replies = h.sender.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].call_id, "c1");
    assert_eq!(replies[0].result, "Ok.");
    assert_eq!(
        h.hub.executed.lock().unwrap().as_slice(),
        &[("light.stehlampe".to_owned(), "light.turn_on".to_owned())]
    );
    // No delegation happened.
    assert!(h.reasoner.prompts.lock().unwrap().is_empty());
    // Transcript reached the shared history.
    assert_eq!(h.history.recent(8)[0].text, "Licht an");
    // Teardown cleared the processing flag.
    assert!(!h.controller.is_processing());
}

// ---------------------------------------------------------------------------
// Scenario B: delegate to the slow brain
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn delegate_call_runs_backend_and_speaks_result() {
    let steps = vec![
        Step::Event(ServerEvent::ToolCall(ToolCall {
            id: "d1".into(),
            name: "delegate_to_backend".into(),
            arguments: json!({ "user_intent": "Plane meinen Abend" }),
        })),
        Step::WaitMs(400),
        Step::Event(ServerEvent::TurnComplete),
    ];
    let reasoner = FakeReasoner {
        delay_ms: 50,
        reply: AgentReply {
            text: "Dein Abend ist geplant.".into(),
            disposition: SessionDisposition::Close,
            silent: false,
        },
        prompts: Mutex::new(Vec::new()),
    };
    let h = harness_with(test_config(), steps, reasoner);

    let end = h
        .router
        .run_session(&h.frames_rx, &h.connector)
        .await
        .unwrap();

    assert_eq!(end, SessionEnd::AgentClosed);
    let replies = h.sender.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].call_id, "d1");
    assert_eq!(replies[0].name, "delegate_to_backend");
    assert_eq!(replies[0].result, "Dein Abend ist geplant.");

    // The backend primed its prompt from hybrid memory and the verbatim
    // transcript, and persisted the interaction.
    let prompts = h.reasoner.prompts.lock().unwrap();
    assert!(prompts[0].contains("Nutzer mag es warm"));
    assert!(prompts[0].contains("Plane meinen Abend"));
    let saved = h.memory.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, "Plane meinen Abend");
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_open_disposition_does_not_close_the_session() {
    let steps = vec![
        Step::Event(ServerEvent::ToolCall(ToolCall {
            id: "d1".into(),
            name: "delegate_to_backend".into(),
            arguments: json!({ "user_intent": "Noch etwas" }),
        })),
        Step::WaitMs(200),
        // Turn completes but the backend asked to keep the window open.
        Step::Event(ServerEvent::TurnComplete),
    ];
    let reasoner = FakeReasoner {
        delay_ms: 10,
        reply: AgentReply {
            text: "Gern, was noch?".into(),
            disposition: SessionDisposition::KeepOpen,
            silent: false,
        },
        prompts: Mutex::new(Vec::new()),
    };
    let h = harness_with(test_config(), steps, reasoner);

    // The session must NOT end at that TurnComplete; it ends later via
    // the idle watchdog.
    let end = h
        .router
        .run_session(&h.frames_rx, &h.connector)
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::IdleTimeout);
    assert_eq!(h.sender.replies()[0].result, "Gern, was noch?");
}

// ---------------------------------------------------------------------------
// Barge-in
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn interruption_cancels_the_backend_task() {
    let steps = vec![
        Step::Event(ServerEvent::ToolCall(ToolCall {
            id: "d1".into(),
            name: "delegate_to_backend".into(),
            arguments: json!({ "user_intent": "Lange Recherche" }),
        })),
        Step::WaitMs(50),
        Step::Event(ServerEvent::Interrupted),
    ];
    let reasoner = FakeReasoner {
        delay_ms: 2_000,
        reply: AgentReply {
            text: "kommt nie an".into(),
            disposition: SessionDisposition::Close,
            silent: false,
        },
        prompts: Mutex::new(Vec::new()),
    };
    let h = harness_with(test_config(), steps, reasoner);

    let end = h
        .router
        .run_session(&h.frames_rx, &h.connector)
        .await
        .unwrap();

    // Nothing closed the session explicitly; idle timeout ends it.
    assert_eq!(end, SessionEnd::IdleTimeout);
    assert!(
        h.sender.replies().is_empty(),
        "cancelled backend must not reply"
    );
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn cancel_flag_ends_the_session_from_the_forwarder() {
    let h = harness_with(test_config(), Vec::new(), quiet_reasoner());
    h.controller.request_cancel();

    let end = h
        .router
        .run_session(&h.frames_rx, &h.connector)
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::Cancelled);
    assert!(!h.controller.cancel_pending(), "flag was consumed");
}

// ---------------------------------------------------------------------------
// Scenario C: echo suppression
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn frames_are_suppressed_during_playback_and_cooldown() {
    let mut config = test_config();
    config.router.echo_cooldown_ms = 200;
    config.router.idle_timeout_ms = 5_000;

    let steps = vec![Step::WaitMs(100), Step::Event(ServerEvent::Audio {
        pcm: vec![0; 2_400],
        sample_rate: 24_000,
    })];
    // Playback takes 300ms of wall time.
    let h = harness_with_sink(
        config,
        steps,
        quiet_reasoner(),
        RecordingSink::with_duration(300),
    );

    // Feed loud frames the whole time from a side thread.
    let tx = h.frames_tx.clone();
    let feeder = std::thread::spawn(move || {
        for _ in 0..120 {
            let _ = tx.try_send(frame(4_000));
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    // End the session via cancel after ~1.2s.
    let cancel_controller = Arc::clone(&h.controller);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        cancel_controller.request_cancel();
    });

    let end = h
        .router
        .run_session(&h.frames_rx, &h.connector)
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::Cancelled);
    feeder.join().unwrap();

    let windows = h.sink.windows.lock().unwrap().clone();
    assert_eq!(windows.len(), 1, "one playback happened");
    let (play_start, play_end) = windows[0];
    let resume_at = play_end + Duration::from_millis(200);

    let sends = h.sender.audio_sends();
    assert!(!sends.is_empty(), "forwarding happened around playback");
    // Small grace at the leading edge: a batch already past its
    // suppression check may land a moment into the window.
    let grace = Duration::from_millis(20);
    for (at, _) in &sends {
        let inside_suppression = *at >= play_start + grace && *at < resume_at;
        assert!(
            !inside_suppression,
            "no frames may be forwarded during playback or cooldown"
        );
    }
    assert!(
        sends.iter().any(|(at, _)| *at >= resume_at),
        "forwarding resumes after the cooldown"
    );
}

// ---------------------------------------------------------------------------
// Idle watchdog
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn idle_watchdog_closes_a_quiet_session() {
    let started = Instant::now();
    let h = harness_with(test_config(), Vec::new(), quiet_reasoner());

    let end = h
        .router
        .run_session(&h.frames_rx, &h.connector)
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::IdleTimeout);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(550),
        "watchdog fired too early: {elapsed:?}"
    );
}
