//! Streaming fast-agent protocol.
//!
//! [`LiveSession`]/[`LiveSender`] are the seam the router talks through;
//! the WebSocket implementation speaks a serde-tagged JSON protocol with
//! base64 PCM payloads. Tests script the seam directly.

use crate::error::{HearthError, Result};
use crate::messages::{Scheduling, ToolCall, ToolReply};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Who produced a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    /// The user's speech as heard by the agent.
    User,
    /// The agent's own output.
    Assistant,
}

/// One event received from the fast agent.
#[derive(Debug)]
pub enum ServerEvent {
    /// Output audio to play immediately.
    Audio {
        /// Mono i16 PCM.
        pcm: Vec<i16>,
        /// Sample rate of the payload.
        sample_rate: u32,
    },
    /// A transcript fragment for the interaction history.
    Transcript {
        /// Speaker attribution.
        role: SpeakerRole,
        /// Fragment text.
        text: String,
    },
    /// The user barged in; in-flight work must be cancelled.
    Interrupted,
    /// The agent finished its current turn.
    TurnComplete,
    /// The agent requests a tool invocation.
    ToolCall(ToolCall),
}

/// Outbound half of a live session. Shared between the forwarder and the
/// receiver (which sends tool replies).
#[async_trait]
pub trait LiveSender: Send + Sync {
    /// Stream raw PCM to the agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone.
    async fn send_audio(&self, pcm: &[i16], sample_rate: u32) -> Result<()>;

    /// Answer a tool call.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone.
    async fn send_tool_reply(&self, reply: &ToolReply) -> Result<()>;
}

/// One streaming connection to the fast agent.
#[async_trait]
pub trait LiveSession: Send {
    /// Handle for the outbound direction.
    fn sender(&self) -> Arc<dyn LiveSender>;

    /// Await the next server event. `None` means the server closed.
    ///
    /// # Errors
    ///
    /// Returns an error on a broken connection.
    async fn next_event(&mut self) -> Result<Option<ServerEvent>>;

    /// Close the connection. Best effort.
    async fn close(&mut self);
}

/// Builds live sessions; one per session window.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Open a connection primed with the assembled system instruction.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent endpoint is unreachable.
    async fn connect(&self, system_instruction: &str) -> Result<Box<dyn LiveSession>>;
}

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireClientMessage<'a> {
    Setup {
        system_instruction: &'a str,
    },
    Audio {
        data: String,
        mime: String,
    },
    ToolReply {
        id: &'a str,
        name: &'a str,
        result: &'a str,
        scheduling: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireServerMessage {
    Audio {
        data: String,
        #[serde(default = "default_output_rate")]
        sample_rate: u32,
    },
    Transcript {
        role: SpeakerRole,
        text: String,
    },
    Interrupted,
    TurnComplete,
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
}

fn default_output_rate() -> u32 {
    24_000
}

fn scheduling_tag(s: Scheduling) -> &'static str {
    match s {
        Scheduling::Interrupt => "interrupt",
        Scheduling::WhenIdle => "when_idle",
    }
}

fn encode_pcm(pcm: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for &s in pcm {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    BASE64.encode(bytes)
}

fn decode_pcm(data: &str) -> Result<Vec<i16>> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| HearthError::Live(format!("bad audio payload: {e}")))?;
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the fast agent over WebSocket.
pub struct WsLiveConnector {
    url: String,
}

impl WsLiveConnector {
    /// Create a connector for the given `ws://` endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl LiveConnector for WsLiveConnector {
    async fn connect(&self, system_instruction: &str) -> Result<Box<dyn LiveSession>> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| HearthError::Live(format!("bad live url {}: {e}", self.url)))?;
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| HearthError::Live(format!("connect {}: {e}", self.url)))?;
        let (write, read) = stream.split();
        let sender = Arc::new(WsLiveSender {
            write: tokio::sync::Mutex::new(write),
        });

        sender
            .send(&WireClientMessage::Setup { system_instruction })
            .await?;
        debug!("live session established: {}", self.url);

        Ok(Box::new(WsLiveSession { read, sender }))
    }
}

struct WsLiveSender {
    write: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
}

impl WsLiveSender {
    async fn send(&self, msg: &WireClientMessage<'_>) -> Result<()> {
        let text = serde_json::to_string(msg)
            .map_err(|e| HearthError::Live(format!("encode: {e}")))?;
        self.write
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| HearthError::Live(format!("send: {e}")))
    }
}

#[async_trait]
impl LiveSender for WsLiveSender {
    async fn send_audio(&self, pcm: &[i16], sample_rate: u32) -> Result<()> {
        self.send(&WireClientMessage::Audio {
            data: encode_pcm(pcm),
            mime: format!("audio/pcm;rate={sample_rate}"),
        })
        .await
    }

    async fn send_tool_reply(&self, reply: &ToolReply) -> Result<()> {
        self.send(&WireClientMessage::ToolReply {
            id: &reply.call_id,
            name: &reply.name,
            result: &reply.result,
            scheduling: scheduling_tag(reply.scheduling),
        })
        .await
    }
}

struct WsLiveSession {
    read: SplitStream<WsStream>,
    sender: Arc<WsLiveSender>,
}

#[async_trait]
impl LiveSession for WsLiveSession {
    fn sender(&self) -> Arc<dyn LiveSender> {
        Arc::clone(&self.sender) as Arc<dyn LiveSender>
    }

    async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            let Some(msg) = self.read.next().await else {
                return Ok(None);
            };
            let msg = msg.map_err(|e| HearthError::Live(format!("receive: {e}")))?;
            match msg {
                Message::Text(text) => {
                    let wire: WireServerMessage = serde_json::from_str(&text)
                        .map_err(|e| HearthError::Live(format!("bad server message: {e}")))?;
                    return Ok(Some(map_server_message(wire)?));
                }
                Message::Close(_) => return Ok(None),
                // Control frames are answered by the library.
                other => {
                    debug!("ignoring non-text frame: {other:?}");
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.sender.write.lock().await.send(Message::Close(None)).await {
            warn!("live close: {e}");
        }
    }
}

fn map_server_message(wire: WireServerMessage) -> Result<ServerEvent> {
    Ok(match wire {
        WireServerMessage::Audio { data, sample_rate } => ServerEvent::Audio {
            pcm: decode_pcm(&data)?,
            sample_rate,
        },
        WireServerMessage::Transcript { role, text } => ServerEvent::Transcript { role, text },
        WireServerMessage::Interrupted => ServerEvent::Interrupted,
        WireServerMessage::TurnComplete => ServerEvent::TurnComplete,
        WireServerMessage::ToolCall {
            id,
            name,
            arguments,
        } => ServerEvent::ToolCall(ToolCall {
            id,
            name,
            arguments,
        }),
    })
}
