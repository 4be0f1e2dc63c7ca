//! Slow-brain reasoning seam.
//!
//! The deep-reasoning agent is an external collaborator: the engine hands
//! it a primed prompt on a worker thread and gets back a structured
//! [`AgentReply`] — cleaned text plus an explicit session disposition.
//! Components above this boundary never see text markers.

use crate::config::ReasonerConfig;
use crate::error::{HearthError, Result};
use crate::messages::SessionDisposition;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Structured result of one slow-brain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    /// Cleaned response text, ready to speak.
    pub text: String,
    /// Whether the session stays open for a follow-up.
    pub disposition: SessionDisposition,
    /// The reply should not be spoken aloud (background work).
    pub silent: bool,
}

/// Deep multi-step reasoning collaborator. Blocking by contract: callers
/// run it via `spawn_blocking` so the event loop stays responsive.
pub trait ReasoningAgent: Send + Sync {
    /// Produce a reply for the primed prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable or rejects the
    /// request. Callers convert this into a short spoken fallback.
    fn respond(&self, prompt: &str) -> Result<AgentReply>;
}

/// Session markers the upstream model embeds in its output channel.
///
/// The channel carries plain text only, so the markers are parsed out
/// right here at the provider boundary and converted into the structured
/// reply. Known limitation: if the channel ever grows structured
/// metadata, this parsing goes away without touching anything above it.
const MARKER_KEEP: &str = "<SESSION:KEEP>";
const MARKER_CLOSE: &str = "<SESSION:CLOSE>";
const MARKER_SILENT: &str = "<SILENT>";

/// Normalize raw model output into a structured reply.
pub fn normalize_reply(raw: &str) -> AgentReply {
    let disposition = if raw.contains(MARKER_KEEP) {
        SessionDisposition::KeepOpen
    } else {
        SessionDisposition::Close
    };
    let silent = raw.contains(MARKER_SILENT);

    let mut text = raw
        .replace(MARKER_KEEP, "")
        .replace(MARKER_CLOSE, "")
        .replace(MARKER_SILENT, "")
        .trim()
        .to_owned();
    if text.is_empty() && !silent {
        text = "Erledigt.".to_owned();
    }

    AgentReply {
        text,
        disposition,
        silent,
    }
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Calls an OpenAI-compatible chat-completions endpoint.
pub struct HttpReasoner {
    config: ReasonerConfig,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl HttpReasoner {
    /// Create a provider client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ReasonerConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HearthError::Backend(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }
}

impl ReasoningAgent for HttpReasoner {
    fn respond(&self, prompt: &str) -> Result<AgentReply> {
        let body = json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut request = self.client.post(&self.config.api_url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .map_err(|e| HearthError::Backend(format!("provider request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HearthError::Backend(format!(
                "provider returned {status}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| HearthError::Backend(format!("provider response: {e}")))?;
        let raw = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or_default();

        debug!("reasoner replied with {} chars", raw.len());
        Ok(normalize_reply(raw))
    }
}
