//! Single-owner session/runtime state.
//!
//! [`SessionController`] replaces module-level globals with one object of
//! atomic accessors, passed by reference to collaborators. All resets are
//! idempotent; the open-until deadline is monotonic non-decreasing except
//! on explicit close or cancel.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared session and router runtime flags.
#[derive(Debug)]
pub struct SessionController {
    /// Deadline until which the session window stays open.
    open_until: Mutex<Option<Instant>>,
    /// User requested an immediate abort (button press).
    cancel_requested: AtomicBool,
    /// A turn is currently being processed.
    processing: AtomicBool,
    /// The router should end the live session when the turn completes.
    close_after_turn: AtomicBool,
    /// Output audio is playing right now.
    playing: AtomicBool,
    /// A timer/alarm is currently ringing.
    alarm_ringing: AtomicBool,
    /// When output audio last ended (echo-suppression cooldown anchor).
    last_audio_end: Mutex<Option<Instant>>,
    /// Last meaningful router activity (idle watchdog anchor).
    last_activity: Mutex<Instant>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    /// Create a controller with everything closed and idle.
    pub fn new() -> Self {
        Self {
            open_until: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            close_after_turn: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            alarm_ringing: AtomicBool::new(false),
            last_audio_end: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    // -- session window ----------------------------------------------------

    /// Open (or extend) the session window by `window`.
    ///
    /// The deadline never moves backward: opening a shorter window while a
    /// longer one is active keeps the longer one.
    pub fn open_window(&self, window: Duration) {
        let deadline = Instant::now() + window;
        let mut guard = self.lock_open_until();
        match *guard {
            Some(current) if current >= deadline => {}
            _ => *guard = Some(deadline),
        }
    }

    /// Whether the session window is currently open.
    pub fn session_active(&self) -> bool {
        self.lock_open_until()
            .map(|deadline| Instant::now() < deadline)
            .unwrap_or(false)
    }

    /// Close the session window immediately.
    pub fn close_window(&self) {
        *self.lock_open_until() = None;
    }

    fn lock_open_until(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.open_until.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // -- cancellation ------------------------------------------------------

    /// Request an immediate cooperative abort of the current turn.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending cancellation request, if any.
    pub fn take_cancel(&self) -> bool {
        self.cancel_requested.swap(false, Ordering::SeqCst)
    }

    /// Whether a cancellation is pending (without consuming it).
    pub fn cancel_pending(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    // -- turn/processing flags ---------------------------------------------

    /// Mark the start of turn processing. Returns `false` if a turn was
    /// already in flight.
    pub fn begin_processing(&self) -> bool {
        !self.processing.swap(true, Ordering::SeqCst)
    }

    /// Clear the processing flag. Idempotent.
    pub fn end_processing(&self) {
        self.processing.store(false, Ordering::SeqCst);
    }

    /// Whether a turn is being processed.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Ask the router to end the session once the current turn completes.
    pub fn request_close_after_turn(&self) {
        self.close_after_turn.store(true, Ordering::SeqCst);
    }

    /// Withdraw a close request (a backend task took over the turn).
    pub fn clear_close_after_turn(&self) {
        self.close_after_turn.store(false, Ordering::SeqCst);
    }

    /// Whether the session should close when the turn completes.
    pub fn close_after_turn(&self) -> bool {
        self.close_after_turn.load(Ordering::SeqCst)
    }

    // -- playback / echo suppression ---------------------------------------

    /// Mark output audio as started.
    pub fn playback_started(&self) {
        self.playing.store(true, Ordering::SeqCst);
        self.touch_activity();
    }

    /// Mark output audio as ended; anchors the echo cooldown.
    pub fn playback_ended(&self) {
        self.playing.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.last_audio_end.lock() {
            *guard = Some(Instant::now());
        }
        self.touch_activity();
    }

    /// Whether output audio is playing right now.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Whether mic forwarding must be suppressed: output audio playing or
    /// inside the post-playback cooldown.
    pub fn echo_suppressed(&self, cooldown: Duration) -> bool {
        if self.is_playing() {
            return true;
        }
        self.last_audio_end
            .lock()
            .ok()
            .and_then(|g| *g)
            .is_some_and(|ended| ended.elapsed() < cooldown)
    }

    // -- idle tracking -----------------------------------------------------

    /// Record meaningful router activity.
    pub fn touch_activity(&self) {
        if let Ok(mut guard) = self.last_activity.lock() {
            *guard = Instant::now();
        }
    }

    /// Time since the last meaningful activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|g| g.elapsed())
            .unwrap_or_default()
    }

    // -- alarm -------------------------------------------------------------

    /// Raise the alarm-ringing flag.
    pub fn alarm_started(&self) {
        self.alarm_ringing.store(true, Ordering::SeqCst);
    }

    /// Clear the alarm-ringing flag. Idempotent.
    pub fn stop_alarm(&self) {
        self.alarm_ringing.store(false, Ordering::SeqCst);
    }

    /// Whether an alarm is ringing.
    pub fn alarm_ringing(&self) -> bool {
        self.alarm_ringing.load(Ordering::SeqCst)
    }

    // -- per-session reset -------------------------------------------------

    /// Reset the per-session flags before a new live session starts.
    /// The open-until window and cancellation request are left alone.
    pub fn reset_session_flags(&self) {
        self.close_after_turn.store(false, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.last_audio_end.lock() {
            *guard = None;
        }
        self.touch_activity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_opens_and_expires() {
        let ctl = SessionController::new();
        assert!(!ctl.session_active());
        ctl.open_window(Duration::from_millis(30));
        assert!(ctl.session_active());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!ctl.session_active());
    }

    #[test]
    fn deadline_never_shrinks_on_reopen() {
        let ctl = SessionController::new();
        ctl.open_window(Duration::from_secs(60));
        ctl.open_window(Duration::from_millis(1));
        // The 60s window must survive the shorter reopen.
        assert!(ctl.session_active());
        std::thread::sleep(Duration::from_millis(10));
        assert!(ctl.session_active());
    }

    #[test]
    fn close_window_is_immediate() {
        let ctl = SessionController::new();
        ctl.open_window(Duration::from_secs(60));
        ctl.close_window();
        assert!(!ctl.session_active());
    }

    #[test]
    fn take_cancel_consumes_the_request() {
        let ctl = SessionController::new();
        assert!(!ctl.take_cancel());
        ctl.request_cancel();
        assert!(ctl.cancel_pending());
        assert!(ctl.take_cancel());
        assert!(!ctl.take_cancel());
    }

    #[test]
    fn begin_processing_rejects_reentry() {
        let ctl = SessionController::new();
        assert!(ctl.begin_processing());
        assert!(!ctl.begin_processing());
        ctl.end_processing();
        assert!(ctl.begin_processing());
    }

    #[test]
    fn echo_suppression_covers_playback_and_cooldown() {
        let ctl = SessionController::new();
        let cooldown = Duration::from_millis(40);
        assert!(!ctl.echo_suppressed(cooldown));

        ctl.playback_started();
        assert!(ctl.echo_suppressed(cooldown));

        ctl.playback_ended();
        assert!(ctl.echo_suppressed(cooldown), "cooldown still active");
        std::thread::sleep(Duration::from_millis(60));
        assert!(!ctl.echo_suppressed(cooldown), "cooldown elapsed");
    }

    #[test]
    fn reset_session_flags_is_idempotent() {
        let ctl = SessionController::new();
        ctl.request_close_after_turn();
        ctl.playback_started();
        ctl.reset_session_flags();
        ctl.reset_session_flags();
        assert!(!ctl.close_after_turn());
        assert!(!ctl.is_playing());
        assert!(!ctl.echo_suppressed(Duration::from_secs(1)));
    }
}
