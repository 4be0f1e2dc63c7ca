//! Capture watchdog: owns the worker process and the frame queue.
//!
//! The supervisor requests frames from the worker link with a timeout and
//! forwards them into a bounded queue. Repeated timeouts mean the worker
//! (or its device driver) is wedged: the worker is terminated and
//! respawned after a settle delay. Too many restarts inside the budget
//! window escalate to [`HearthError::CaptureFailed`], which the binary
//! turns into a full service restart. The supervisor has no other side
//! effects.

use crate::config::AudioConfig;
use crate::error::{HearthError, Result};
use crate::messages::AudioFrame;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Why a frame request returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWaitError {
    /// No frame arrived within the timeout.
    TimedOut,
    /// The worker exited or its pipe closed.
    Closed,
}

/// A live connection to one capture worker.
pub trait WorkerLink: Send {
    /// Block up to `timeout` for the next frame.
    fn recv_frame(&mut self, timeout: Duration) -> std::result::Result<AudioFrame, FrameWaitError>;

    /// Terminate the worker. Idempotent.
    fn terminate(&mut self);
}

/// Spawns capture workers. The trait seam exists so tests can script
/// worker behavior without real processes.
pub trait WorkerLauncher: Send {
    /// Start a new worker and return its link.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker cannot be started.
    fn launch(&mut self) -> Result<Box<dyn WorkerLink>>;
}

/// Watchdog-guarded capture: spawns the supervisor thread and hands out
/// the frame queue receiver.
pub struct CaptureSupervisor {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<Result<()>>>,
}

impl CaptureSupervisor {
    /// Start the supervisor with the given launcher.
    ///
    /// Returns the supervisor handle and the bounded frame queue. The
    /// queue closes when the supervisor stops or escalates.
    pub fn start(
        config: AudioConfig,
        launcher: Box<dyn WorkerLauncher>,
    ) -> (Self, Receiver<AudioFrame>) {
        let (tx, rx) = crossbeam_channel::bounded(config.queue_frames);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("capture-supervisor".into())
            .spawn(move || supervise(config, launcher, tx, stop_flag))
            .ok();
        if thread.is_none() {
            error!("failed to spawn capture supervisor thread");
        }
        (
            Self {
                stop,
                thread,
            },
            rx,
        )
    }

    /// Request the supervisor to stop and terminate the worker.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the supervisor thread to finish.
    ///
    /// # Errors
    ///
    /// Returns [`HearthError::CaptureFailed`] if the restart budget was
    /// exhausted.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(t) => t
                .join()
                .map_err(|_| HearthError::Audio("supervisor thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

fn supervise(
    config: AudioConfig,
    mut launcher: Box<dyn WorkerLauncher>,
    tx: Sender<AudioFrame>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let read_timeout = Duration::from_millis(config.read_timeout_ms);
    let settle = Duration::from_millis(config.restart_settle_ms);
    let window = Duration::from_secs(config.restart_window_secs);

    let mut restarts: Vec<Instant> = Vec::new();
    let mut link = launcher.launch()?;
    let mut consecutive_timeouts: u32 = 0;

    loop {
        if stop.load(Ordering::Relaxed) {
            link.terminate();
            info!("capture supervisor stopped");
            return Ok(());
        }

        match link.recv_frame(read_timeout) {
            Ok(frame) => {
                consecutive_timeouts = 0;
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!("frame queue full, dropping frame");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        link.terminate();
                        info!("frame queue consumer gone, supervisor exiting");
                        return Ok(());
                    }
                }
            }
            Err(FrameWaitError::TimedOut) => {
                consecutive_timeouts += 1;
                if consecutive_timeouts < config.timeouts_before_restart {
                    continue;
                }
                warn!(
                    "worker unresponsive ({consecutive_timeouts} consecutive read timeouts)"
                );
                link = restart_worker(
                    &mut launcher,
                    link,
                    &mut restarts,
                    &config,
                    window,
                    settle,
                )?;
                consecutive_timeouts = 0;
            }
            Err(FrameWaitError::Closed) => {
                warn!("worker pipe closed");
                link = restart_worker(
                    &mut launcher,
                    link,
                    &mut restarts,
                    &config,
                    window,
                    settle,
                )?;
                consecutive_timeouts = 0;
            }
        }
    }
}

/// Terminate the current worker and launch a replacement, enforcing the
/// restart budget.
fn restart_worker(
    launcher: &mut Box<dyn WorkerLauncher>,
    mut link: Box<dyn WorkerLink>,
    restarts: &mut Vec<Instant>,
    config: &AudioConfig,
    window: Duration,
    settle: Duration,
) -> Result<Box<dyn WorkerLink>> {
    link.terminate();

    let now = Instant::now();
    restarts.retain(|t| now.duration_since(*t) < window);
    if restarts.len() as u32 >= config.restart_budget {
        error!(
            "restart budget exhausted ({} restarts in {:?}), escalating",
            restarts.len(),
            window
        );
        return Err(HearthError::CaptureFailed {
            restarts: restarts.len() as u32,
        });
    }
    restarts.push(now);

    std::thread::sleep(settle);
    info!("respawning capture worker (restart {} in window)", restarts.len());
    launcher.launch()
}

// ---------------------------------------------------------------------------
// Process-backed implementation
// ---------------------------------------------------------------------------

/// Launches the real `hearth-capture` child process.
pub struct ProcessLauncher {
    config: AudioConfig,
}

impl ProcessLauncher {
    /// Create a launcher for the configured worker executable.
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    fn worker_path(&self) -> Result<std::path::PathBuf> {
        if let Some(ref path) = self.config.worker_path {
            return Ok(path.clone());
        }
        let mut path = std::env::current_exe()?;
        path.set_file_name("hearth-capture");
        Ok(path)
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self) -> Result<Box<dyn WorkerLink>> {
        let path = self.worker_path()?;
        let mut cmd = Command::new(&path);
        cmd.arg("--sample-rate")
            .arg(self.config.sample_rate.to_string())
            .arg("--frame-samples")
            .arg(self.config.frame_samples.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(ref device) = self.config.input_device {
            cmd.arg("--device").arg(device);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HearthError::Audio(format!("cannot spawn {}: {e}", path.display())))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HearthError::Audio("worker stdout not captured".into()))?;

        // A blocking reader thread decodes the pipe into frames; the link
        // side applies the timeout via recv_timeout.
        let frame_bytes = self.config.frame_samples * 2;
        let (tx, rx) = crossbeam_channel::bounded::<AudioFrame>(8);
        std::thread::Builder::new()
            .name("capture-reader".into())
            .spawn(move || read_pipe(stdout, frame_bytes, tx))
            .map_err(|e| HearthError::Audio(format!("cannot spawn reader thread: {e}")))?;

        info!("capture worker spawned: {}", path.display());
        Ok(Box::new(ProcessLink { child, frames: rx }))
    }
}

fn read_pipe(mut stdout: impl Read, frame_bytes: usize, tx: Sender<AudioFrame>) {
    let mut buf = vec![0u8; frame_bytes];
    loop {
        if let Err(e) = stdout.read_exact(&mut buf) {
            debug!("worker pipe read ended: {e}");
            return;
        }
        let frame = AudioFrame {
            samples: super::worker::decode_frame(&buf),
            captured_at: Instant::now(),
        };
        if tx.send(frame).is_err() {
            return;
        }
    }
}

struct ProcessLink {
    child: Child,
    frames: Receiver<AudioFrame>,
}

impl WorkerLink for ProcessLink {
    fn recv_frame(&mut self, timeout: Duration) -> std::result::Result<AudioFrame, FrameWaitError> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(FrameWaitError::TimedOut),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(FrameWaitError::Closed),
        }
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("worker kill: {e}");
        }
        let _ = self.child.wait();
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Mutex;

    fn test_config() -> AudioConfig {
        AudioConfig {
            read_timeout_ms: 5,
            timeouts_before_restart: 5,
            restart_settle_ms: 1,
            restart_budget: 3,
            restart_window_secs: 60,
            queue_frames: 16,
            ..AudioConfig::default()
        }
    }

    fn frame() -> AudioFrame {
        AudioFrame {
            samples: vec![100; 512],
            captured_at: Instant::now(),
        }
    }

    /// Scripted worker: yields `healthy` frames, then times out forever.
    struct ScriptedLink {
        healthy: u32,
    }

    impl WorkerLink for ScriptedLink {
        fn recv_frame(
            &mut self,
            _timeout: Duration,
        ) -> std::result::Result<AudioFrame, FrameWaitError> {
            if self.healthy > 0 {
                self.healthy -= 1;
                Ok(frame())
            } else {
                Err(FrameWaitError::TimedOut)
            }
        }

        fn terminate(&mut self) {}
    }

    struct ScriptedLauncher {
        /// Frames each successive worker produces before wedging.
        /// Empty = launch fails.
        scripts: Vec<u32>,
        launches: Arc<Mutex<u32>>,
    }

    impl WorkerLauncher for ScriptedLauncher {
        fn launch(&mut self) -> Result<Box<dyn WorkerLink>> {
            *self.launches.lock().unwrap() += 1;
            if self.scripts.is_empty() {
                return Err(HearthError::Audio("no device".into()));
            }
            let healthy = self.scripts.remove(0);
            Ok(Box::new(ScriptedLink { healthy }))
        }
    }

    #[test]
    fn five_timeouts_trigger_exactly_one_restart() {
        let launches = Arc::new(Mutex::new(0));
        let launcher = ScriptedLauncher {
            // First worker: 3 frames then wedged. Second: effectively
            // endless so no further restart can fire during the test.
            scripts: vec![3, u32::MAX],
            launches: Arc::clone(&launches),
        };
        let (sup, rx) = CaptureSupervisor::start(test_config(), Box::new(launcher));

        // Frames must resume after the restart.
        let mut received = 0;
        while received < 20 {
            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(_) => received += 1,
                Err(e) => panic!("frame production did not resume: {e}"),
            }
        }

        sup.stop();
        sup.join().expect("clean stop");
        assert_eq!(*launches.lock().unwrap(), 2, "exactly one restart");
    }

    #[test]
    fn exhausted_budget_escalates() {
        let launches = Arc::new(Mutex::new(0));
        let launcher = ScriptedLauncher {
            // Every worker wedges immediately; budget is 3 restarts.
            scripts: vec![0, 0, 0, 0, 0],
            launches: Arc::clone(&launches),
        };
        let (sup, rx) = CaptureSupervisor::start(test_config(), Box::new(launcher));

        let err = sup.join().expect_err("supervisor must escalate");
        match err {
            HearthError::CaptureFailed { restarts } => assert_eq!(restarts, 3),
            other => panic!("expected CaptureFailed, got {other}"),
        }
        // The queue closes on escalation.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn healthy_frames_reset_timeout_counter() {
        // One frame every 4 timeouts: never reaches the restart threshold.
        struct Interleaved {
            step: u32,
        }
        impl WorkerLink for Interleaved {
            fn recv_frame(
                &mut self,
                _timeout: Duration,
            ) -> std::result::Result<AudioFrame, FrameWaitError> {
                self.step += 1;
                if self.step % 5 == 0 {
                    Ok(frame())
                } else {
                    Err(FrameWaitError::TimedOut)
                }
            }
            fn terminate(&mut self) {}
        }
        struct OneShot {
            launches: Arc<Mutex<u32>>,
        }
        impl WorkerLauncher for OneShot {
            fn launch(&mut self) -> Result<Box<dyn WorkerLink>> {
                *self.launches.lock().unwrap() += 1;
                Ok(Box::new(Interleaved { step: 0 }))
            }
        }

        let launches = Arc::new(Mutex::new(0));
        let (sup, rx) = CaptureSupervisor::start(
            test_config(),
            Box::new(OneShot {
                launches: Arc::clone(&launches),
            }),
        );

        for _ in 0..5 {
            rx.recv_timeout(Duration::from_secs(2)).expect("frame");
        }
        sup.stop();
        sup.join().expect("clean stop");
        assert_eq!(*launches.lock().unwrap(), 1, "no restart");
    }

    #[test]
    fn supervisor_exits_when_consumer_drops_queue() {
        let launches = Arc::new(Mutex::new(0));
        let launcher = ScriptedLauncher {
            scripts: vec![u32::MAX],
            launches: Arc::clone(&launches),
        };
        let (sup, rx) = CaptureSupervisor::start(test_config(), Box::new(launcher));
        drop(rx);
        sup.join().expect("exits cleanly when queue is dropped");
    }
}
