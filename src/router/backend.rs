//! Slow-brain delegation.
//!
//! A delegate tool call spawns a [`BackendTask`]: hybrid memory context is
//! gathered and the reasoner runs on a worker thread while the router's
//! event loop stays live. [`BackendSlot`] enforces the invariant that at
//! most one task is in flight — starting a second cancels the first.

use crate::agent::ReasoningAgent;
use crate::error::Result;
use crate::memory::MemoryProvider;
use crate::messages::{Scheduling, SessionDisposition, ToolReply};
use crate::router::live::LiveSender;
use crate::router::state::SessionController;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spoken fallback when reasoning fails; the turn still completes.
const FAILURE_TEXT: &str = "Entschuldigung, das hat gerade nicht geklappt.";

/// Everything a backend task needs, cloned per spawn.
#[derive(Clone)]
pub struct BackendContext {
    /// Memory collaborator for context priming and persistence.
    pub memory: Arc<dyn MemoryProvider>,
    /// The deep-reasoning agent.
    pub reasoner: Arc<dyn ReasoningAgent>,
    /// Shared session flags.
    pub controller: Arc<SessionController>,
    /// Outbound half of the live session for the tool reply.
    pub sender: Arc<dyn LiveSender>,
    /// Name the delegate tool was called as (echoed in the reply).
    pub delegate_tool: String,
}

/// Handle for one in-flight slow-brain invocation.
pub struct BackendTask {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl BackendTask {
    /// Whether the task is still running.
    pub fn is_live(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cooperatively cancel the task. The reply is never sent after this.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Spawn the reasoning task for one delegate call.
pub fn spawn(ctx: BackendContext, user_intent: String, call_id: String) -> BackendTask {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        let outcome = tokio::select! {
            () = task_cancel.cancelled() => {
                info!("backend task cancelled before completion");
                return;
            }
            outcome = run_reasoning(&ctx, user_intent) => outcome,
        };

        let (text, disposition) = match outcome {
            Ok(reply) => {
                let text = if reply.text.is_empty() {
                    "Erledigt.".to_owned()
                } else {
                    reply.text
                };
                (text, reply.disposition)
            }
            Err(e) => {
                warn!("backend reasoning failed: {e}");
                (FAILURE_TEXT.to_owned(), SessionDisposition::Close)
            }
        };

        if disposition == SessionDisposition::Close {
            ctx.controller.request_close_after_turn();
        }

        let reply = ToolReply {
            call_id,
            name: ctx.delegate_tool.clone(),
            result: text,
            scheduling: Scheduling::Interrupt,
        };
        if let Err(e) = ctx.sender.send_tool_reply(&reply).await {
            warn!("backend reply not delivered: {e}");
        } else {
            info!("slow brain handed result back to fast brain");
        }
        ctx.controller.touch_activity();
    });

    BackendTask { cancel, task }
}

/// Gather hybrid context, run the reasoner on a worker thread, persist.
async fn run_reasoning(
    ctx: &BackendContext,
    user_intent: String,
) -> Result<crate::agent::AgentReply> {
    let memory = Arc::clone(&ctx.memory);
    let reasoner = Arc::clone(&ctx.reasoner);

    tokio::task::spawn_blocking(move || {
        let context = memory.hybrid_context(&user_intent).unwrap_or_default();
        let prompt = format!(
            "{context}\n\nUSER AUDIO TRANSCRIPT:\n{user_intent}\n\n(Antworte dem User.)"
        );
        let reply = reasoner.respond(&prompt)?;
        if let Err(e) = memory.save_interaction(&user_intent, &reply.text) {
            warn!("interaction not persisted: {e}");
        }
        Ok(reply)
    })
    .await
    .map_err(|e| crate::error::HearthError::Backend(format!("worker thread: {e}")))?
}

/// Holder enforcing the at-most-one-backend invariant.
#[derive(Default)]
pub struct BackendSlot {
    current: Mutex<Option<BackendTask>>,
}

impl BackendSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new task, cancelling any live predecessor.
    pub fn replace(&self, task: BackendTask) {
        let mut guard = self.lock();
        if let Some(previous) = guard.take()
            && previous.is_live()
        {
            info!("cancelling stale backend task before starting a new one");
            previous.cancel();
        }
        *guard = Some(task);
    }

    /// Cancel the live task, if any (barge-in, teardown).
    pub fn cancel_active(&self) {
        let mut guard = self.lock();
        if let Some(task) = guard.take() {
            task.cancel();
        }
    }

    /// Whether a task is currently running.
    pub fn is_live(&self) -> bool {
        self.lock().as_ref().is_some_and(BackendTask::is_live)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<BackendTask>> {
        match self.current.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::agent::AgentReply;
    use crate::memory::NoopMemory;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct SlowReasoner {
        delay_ms: u64,
        calls: Arc<AtomicU32>,
    }

    impl ReasoningAgent for SlowReasoner {
        fn respond(&self, _prompt: &str) -> Result<AgentReply> {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentReply {
                text: "Antwort.".into(),
                disposition: SessionDisposition::Close,
                silent: false,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        replies: Mutex<Vec<ToolReply>>,
    }

    #[async_trait::async_trait]
    impl LiveSender for RecordingSender {
        async fn send_audio(&self, _pcm: &[i16], _sample_rate: u32) -> Result<()> {
            Ok(())
        }
        async fn send_tool_reply(&self, reply: &ToolReply) -> Result<()> {
            self.replies.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    fn context(
        reasoner: Arc<dyn ReasoningAgent>,
        sender: Arc<RecordingSender>,
    ) -> BackendContext {
        BackendContext {
            memory: Arc::new(NoopMemory),
            reasoner,
            controller: Arc::new(SessionController::new()),
            sender,
            delegate_tool: "delegate_to_backend".into(),
        }
    }

    #[tokio::test]
    async fn completed_task_replies_and_requests_close() {
        let calls = Arc::new(AtomicU32::new(0));
        let sender = Arc::new(RecordingSender::default());
        let ctx = context(
            Arc::new(SlowReasoner {
                delay_ms: 0,
                calls: Arc::clone(&calls),
            }),
            Arc::clone(&sender),
        );
        let controller = Arc::clone(&ctx.controller);

        let task = spawn(ctx, "Wie wird das Wetter?".into(), "call-1".into());
        for _ in 0..100 {
            if !task.is_live() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let replies = sender.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].call_id, "call-1");
        assert_eq!(replies[0].result, "Antwort.");
        assert!(controller.close_after_turn());
    }

    #[tokio::test]
    async fn replacing_a_live_task_cancels_it() {
        let calls = Arc::new(AtomicU32::new(0));
        let sender = Arc::new(RecordingSender::default());
        let slot = BackendSlot::new();

        let slow = context(
            Arc::new(SlowReasoner {
                delay_ms: 5_000,
                calls: Arc::clone(&calls),
            }),
            Arc::clone(&sender),
        );
        slot.replace(spawn(slow, "erste".into(), "c1".into()));
        assert!(slot.is_live());

        let fast = context(
            Arc::new(SlowReasoner {
                delay_ms: 0,
                calls: Arc::clone(&calls),
            }),
            Arc::clone(&sender),
        );
        slot.replace(spawn(fast, "zweite".into(), "c2".into()));

        // Only the second task's reply can arrive.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let replies = sender.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].call_id, "c2");
    }

    #[tokio::test]
    async fn cancel_active_suppresses_the_reply() {
        let calls = Arc::new(AtomicU32::new(0));
        let sender = Arc::new(RecordingSender::default());
        let slot = BackendSlot::new();
        let ctx = context(
            Arc::new(SlowReasoner {
                delay_ms: 2_000,
                calls,
            }),
            Arc::clone(&sender),
        );
        slot.replace(spawn(ctx, "lange Aufgabe".into(), "c1".into()));
        slot.cancel_active();
        assert!(!slot.is_live());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sender.replies.lock().unwrap().is_empty());
    }
}
