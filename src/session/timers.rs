//! Timers, alarms, and autonomous wakeups.
//!
//! One board holds both kinds of deadline: alarms ring through the cue
//! player until stopped; wakeups open a silent background turn with a
//! prepared prompt. The session loop polls the board between frames.

use crate::dispatch::registry::{LocalTool, ToolArgs};
use crate::error::{HearthError, Result};
use crate::router::state::SessionController;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// What a due entry triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Ring until the user stops it.
    Alarm,
    /// Run a silent background turn with this prompt.
    Wakeup(String),
}

/// One pending deadline.
#[derive(Debug, Clone)]
pub struct PendingTimer {
    /// When it fires.
    pub due_at: Instant,
    /// What happens then.
    pub kind: TimerKind,
}

/// Shared board of pending deadlines.
#[derive(Default)]
pub struct TimerBoard {
    entries: Mutex<Vec<PendingTimer>>,
}

impl TimerBoard {
    /// Empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an entry `delay` from now.
    pub fn schedule(&self, delay: Duration, kind: TimerKind) {
        self.lock().push(PendingTimer {
            due_at: Instant::now() + delay,
            kind,
        });
    }

    /// Remove and return everything that is due.
    pub fn take_due(&self) -> Vec<PendingTimer> {
        let now = Instant::now();
        let mut guard = self.lock();
        let mut due = Vec::new();
        guard.retain(|t| {
            if t.due_at <= now {
                due.push(t.clone());
                false
            } else {
                true
            }
        });
        due
    }

    /// Drop all pending alarms (wakeups stay scheduled).
    pub fn cancel_alarms(&self) -> usize {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|t| !matches!(t.kind, TimerKind::Alarm));
        before - guard.len()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingTimer>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Local tool: set a timer/alarm or stop a ringing one.
pub struct TimerTool {
    board: Arc<TimerBoard>,
    controller: Arc<SessionController>,
}

impl TimerTool {
    /// Tool over the shared board and controller.
    pub fn new(board: Arc<TimerBoard>, controller: Arc<SessionController>) -> Self {
        Self { board, controller }
    }
}

impl LocalTool for TimerTool {
    fn name(&self) -> &str {
        "manage_timer_alarm"
    }

    fn description(&self) -> &str {
        "Setzt einen Timer/Wecker oder stoppt klingelnde Wecker."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["set_timer", "stop_alarm"] },
                "seconds": { "type": "integer", "description": "Dauer bis zum Alarm" }
            },
            "required": ["action"]
        })
    }

    fn invoke(&self, args: &ToolArgs) -> Result<String> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| HearthError::Dispatch("missing argument 'action'".into()))?;
        match action {
            "set_timer" => {
                let seconds = args
                    .get("seconds")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| HearthError::Dispatch("missing argument 'seconds'".into()))?;
                self.board
                    .schedule(Duration::from_secs(seconds), TimerKind::Alarm);
                info!("timer set for {seconds}s");
                Ok(format!("Timer auf {seconds} Sekunden gestellt."))
            }
            "stop_alarm" => {
                let cancelled = self.board.cancel_alarms();
                self.controller.stop_alarm();
                if cancelled > 0 {
                    Ok("Timer gelöscht.".to_owned())
                } else {
                    Ok("Wecker gestoppt.".to_owned())
                }
            }
            other => Ok(format!("Unbekannte Aktion '{other}'.")),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn due_entries_are_taken_once() {
        let board = TimerBoard::new();
        board.schedule(Duration::ZERO, TimerKind::Alarm);
        board.schedule(Duration::from_secs(600), TimerKind::Alarm);

        std::thread::sleep(Duration::from_millis(5));
        let due = board.take_due();
        assert_eq!(due.len(), 1);
        assert!(matches!(due[0].kind, TimerKind::Alarm));
        assert!(board.take_due().is_empty(), "taken entries don't re-fire");
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn cancel_alarms_keeps_wakeups() {
        let board = TimerBoard::new();
        board.schedule(Duration::from_secs(60), TimerKind::Alarm);
        board.schedule(
            Duration::from_secs(60),
            TimerKind::Wakeup("check heating".into()),
        );
        assert_eq!(board.cancel_alarms(), 1);
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn timer_tool_sets_and_stops() {
        let board = Arc::new(TimerBoard::new());
        let controller = Arc::new(SessionController::new());
        let tool = TimerTool::new(Arc::clone(&board), Arc::clone(&controller));

        let args: ToolArgs = json!({ "action": "set_timer", "seconds": 90 })
            .as_object()
            .unwrap()
            .clone();
        let result = tool.invoke(&args).unwrap();
        assert!(result.contains("90"));
        assert_eq!(board.len(), 1);

        controller.alarm_started();
        let args: ToolArgs = json!({ "action": "stop_alarm" })
            .as_object()
            .unwrap()
            .clone();
        tool.invoke(&args).unwrap();
        assert!(!controller.alarm_ringing());
        assert!(board.is_empty());
    }
}
