//! `hearth`: the assistant service binary.
//!
//! Wires the capture supervisor, wake detector, router, dispatcher, and
//! session loop together and runs until shutdown. Exits nonzero when the
//! capture watchdog escalates so the service manager restarts us.

use anyhow::{Context, Result};
use hearth::agent::HttpReasoner;
use hearth::audio::cues::CuePlayer;
use hearth::audio::playback::PcmPlayback;
use hearth::audio::supervisor::{CaptureSupervisor, ProcessLauncher};
use hearth::config::AssistantConfig;
use hearth::dispatch::mesh::{ServiceMesh, WsServiceConnector};
use hearth::dispatch::{
    DeviceExecuteTool, DeviceStateTool, EndConversationTool, Registry, ToolDispatcher,
};
use hearth::history::TranscriptLog;
use hearth::hub::{DeviceHub, HttpDeviceHub, Mailbox, VolumeDuck};
use hearth::memory::NoopMemory;
use hearth::router::live::WsLiveConnector;
use hearth::router::state::SessionController;
use hearth::router::{HybridRouter, RouterDeps};
use hearth::session::timers::{TimerBoard, TimerTool};
use hearth::session::{NoopVoice, SessionDeps, SessionLoop};
use hearth::wake::WakeDetector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|d| d.join("hearth/hearth.toml")))
        .unwrap_or_else(|| PathBuf::from("hearth.toml"))
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = dirs::data_dir()
        .map(|d| d.join("hearth/logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let appender = tracing_appender::rolling::daily(log_dir, "hearth.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=info".into()),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

fn main() -> Result<()> {
    let _log_guard = init_logging();

    let config = AssistantConfig::load_or_default(&config_path())
        .context("configuration could not be loaded")?;

    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc_handler(move || shutdown.cancel());
    }

    // Capture: isolated worker process behind the watchdog.
    let launcher = ProcessLauncher::new(config.audio.clone());
    let (supervisor, frames) =
        CaptureSupervisor::start(config.audio.clone(), Box::new(launcher));

    // Shared state and collaborators.
    let controller = Arc::new(SessionController::new());
    let playback = Arc::new(PcmPlayback::new(&config.audio).context("output device")?);
    let cues = Arc::new(CuePlayer::load(
        &config.session.cues_dir,
        Arc::clone(&playback) as Arc<dyn hearth::audio::AudioSink>,
    ));
    let hub = Arc::new(HttpDeviceHub::new(&config.hub).context("hub client")?);
    let duck = Arc::new(VolumeDuck::new(Arc::clone(&hub) as Arc<dyn DeviceHub>));
    let memory = Arc::new(NoopMemory);
    let reasoner = Arc::new(HttpReasoner::new(config.reasoner.clone()).context("reasoner")?);
    let history = Arc::new(TranscriptLog::new(64));
    let timers = Arc::new(TimerBoard::new());

    // Tool dispatch: local registry plus the remote service mesh.
    let mut registry = Registry::new();
    registry.register(Arc::new(EndConversationTool::new(Arc::clone(&controller))));
    registry.register(Arc::new(DeviceStateTool::new(
        Arc::clone(&hub) as Arc<dyn DeviceHub>
    )));
    registry.register(Arc::new(DeviceExecuteTool::new(
        Arc::clone(&hub) as Arc<dyn DeviceHub>
    )));
    registry.register(Arc::new(TimerTool::new(
        Arc::clone(&timers),
        Arc::clone(&controller),
    )));

    let mesh = if config.dispatch.services.is_empty() {
        None
    } else {
        let _guard = runtime.enter();
        Some(ServiceMesh::start(
            config.dispatch.clone(),
            Arc::new(WsServiceConnector),
        ))
    };
    let dispatcher = Arc::new(ToolDispatcher::new(registry, mesh.clone()));

    let router = Arc::new(HybridRouter::new(
        &config,
        RouterDeps {
            controller: Arc::clone(&controller),
            dispatcher,
            memory: Arc::clone(&memory) as Arc<dyn hearth::memory::MemoryProvider>,
            reasoner: Arc::clone(&reasoner) as Arc<dyn hearth::agent::ReasoningAgent>,
            history,
            output: Arc::clone(&playback) as Arc<dyn hearth::audio::AudioSink>,
            cues: Some(Arc::clone(&cues)),
            hub: Arc::clone(&hub) as Arc<dyn DeviceHub>,
            duck: Arc::clone(&duck),
            indicator: None,
        },
    ));

    let wake = WakeDetector::new(&config.wake).context("wake detector")?;
    let connector = Arc::new(WsLiveConnector::new(config.router.live_url.clone()));

    let session_loop = SessionLoop::new(
        config,
        wake,
        frames,
        SessionDeps {
            controller,
            router,
            connector,
            mailbox: Arc::clone(&hub) as Arc<dyn Mailbox>,
            duck,
            cues: Some(cues),
            memory,
            reasoner,
            voice: Arc::new(NoopVoice),
            timers,
        },
        runtime.handle().clone(),
        shutdown.clone(),
    );

    info!("hearth online");
    let loop_result = session_loop.run();

    // A closed frame queue means the watchdog escalated; surface its
    // error as the exit status so the service manager restarts us.
    supervisor.stop();
    if let Err(e) = supervisor.join() {
        error!("capture supervisor failed: {e}");
        if let Some(m) = &mesh {
            m.shutdown();
        }
        return Err(e.into());
    }
    if let Some(m) = &mesh {
        m.shutdown();
    }

    loop_result.map_err(Into::into)
}

/// Minimal SIGINT/SIGTERM hook without an extra dependency.
fn ctrlc_handler(f: impl Fn() + Send + Sync + 'static) {
    // tokio's signal driver needs a runtime; a plain thread suffices for
    // a process-lifetime handler.
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(_) => return,
        };
        runtime.block_on(async {
            let _ = tokio::signal::ctrl_c().await;
            f();
        });
    });
}
