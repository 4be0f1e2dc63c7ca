//! Shared interaction history.
//!
//! The one shared resource guarded by an explicit lock: read-modify-write
//! sequences on the transcript go through the mutex, everything else in
//! the engine uses idempotent atomic flags.

use crate::router::live::SpeakerRole;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Who spoke.
    pub role: SpeakerRole,
    /// What was said.
    pub text: String,
}

/// Bounded interaction log shared between the router, the backend task,
/// and prompt assembly.
#[derive(Debug)]
pub struct TranscriptLog {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
}

impl TranscriptLog {
    /// Create a log retaining at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest beyond capacity.
    pub fn push(&self, role: SpeakerRole, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        let mut guard = self.lock();
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(HistoryEntry { role, text });
    }

    /// Merge a streamed fragment into the newest entry of the same role,
    /// or start a new entry.
    pub fn append_fragment(&self, role: SpeakerRole, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        let mut guard = self.lock();
        match guard.back_mut() {
            Some(last) if last.role == role => last.text.push_str(fragment),
            _ => {
                if guard.len() == self.capacity {
                    guard.pop_front();
                }
                guard.push_back(HistoryEntry {
                    role,
                    text: fragment.to_owned(),
                });
            }
        }
    }

    /// The most recent `window` entries, oldest first.
    pub fn recent(&self, window: usize) -> Vec<HistoryEntry> {
        let guard = self.lock();
        guard
            .iter()
            .skip(guard.len().saturating_sub(window))
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<HistoryEntry>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
