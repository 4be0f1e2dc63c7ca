//! Hearth: voice-driven smart home assistant session engine.
//!
//! The crate hosts the real-time conversational machinery between a
//! microphone/speaker endpoint, a smart-home hub, and two cooperating
//! agents:
//!
//! - **Audio capture** runs in an isolated worker process behind a
//!   watchdog-guarded frame queue ([`audio`])
//! - **Wake detection** opens sessions ([`wake`]), the **turn engine**
//!   bounds utterances ([`turn`])
//! - The **hybrid router** owns one streaming fast-brain connection per
//!   session and delegates complex requests to the slow brain
//!   ([`router`])
//! - The **tool dispatcher** bridges local handlers and a remote
//!   tool-service mesh ([`dispatch`])
//! - The **session loop** cycles idle-listening, active-session, and
//!   autonomous wakeups ([`session`])
//!
//! Speech-to-text, text-to-speech, memory storage, and the smart-home
//! domain model are external collaborators behind trait seams.

pub mod agent;
pub mod audio;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod hub;
pub mod memory;
pub mod messages;
pub mod router;
pub mod session;
pub mod turn;
pub mod wake;

pub use config::AssistantConfig;
pub use error::{HearthError, Result};
pub use messages::{AudioFrame, SessionTrigger, ToolCall, ToolReply, Utterance};
pub use router::state::SessionController;
pub use router::{HybridRouter, RouterDeps, SessionEnd};
pub use session::{SessionDeps, SessionLoop};
