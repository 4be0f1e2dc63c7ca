//! Remote tool-service mesh.
//!
//! Each configured service gets one supervised connection task with an
//! explicit state machine: connecting → connected → failed-backoff →
//! connecting. A remote call never raises past the mesh boundary: it
//! retries within a fixed budget and degrades to a descriptive text
//! result.

use crate::config::{DispatchConfig, ServiceEndpoint};
use crate::error::{HearthError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before retrying after a call timeout.
const TIMEOUT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// A tool advertised by a remote service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteToolSpec {
    /// Tool name.
    pub name: String,
    /// Description for the agent's tool listing.
    #[serde(default)]
    pub description: String,
    /// Parameter JSON Schema.
    #[serde(default)]
    pub schema: serde_json::Value,
}

/// How a remote call failed, driving the retry ladder.
#[derive(Debug)]
pub enum CallError {
    /// The service did not answer in time.
    Timeout,
    /// The connection itself broke; the service task must reconnect.
    Connection(String),
    /// The tool ran and reported an error. Not retried.
    Failed(String),
}

/// One established connection to a service.
#[async_trait]
pub trait ServiceChannel: Send + Sync {
    /// Fetch the service's tool listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be retrieved.
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>>;

    /// Invoke a tool.
    ///
    /// # Errors
    ///
    /// Returns a classified [`CallError`].
    async fn call_tool(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> std::result::Result<String, CallError>;

    /// Resolves when the underlying connection dies.
    async fn closed(&self);
}

/// Opens connections to services. The trait seam lets tests script
/// availability without sockets.
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    /// Connect to one service endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unreachable.
    async fn connect(&self, endpoint: &ServiceEndpoint) -> Result<Arc<dyn ServiceChannel>>;
}

/// Connection state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Dialing the endpoint.
    Connecting,
    /// A channel is live.
    Connected,
    /// Last attempt failed; waiting out the backoff.
    FailedBackoff,
}

struct ServiceRuntime {
    endpoint: ServiceEndpoint,
    status: Mutex<ServiceStatus>,
    channel: Mutex<Option<Arc<dyn ServiceChannel>>>,
    /// Poked by the call path to force an immediate reconnect.
    reconnect: Notify,
}

impl ServiceRuntime {
    fn set_status(&self, status: ServiceStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    fn current_channel(&self) -> Option<Arc<dyn ServiceChannel>> {
        self.channel.lock().ok().and_then(|g| g.clone())
    }
}

/// Supervised set of remote tool services.
pub struct ServiceMesh {
    config: DispatchConfig,
    services: HashMap<String, Arc<ServiceRuntime>>,
    /// Tool name → owning service name.
    tool_index: Mutex<HashMap<String, String>>,
    cancel: CancellationToken,
}

impl ServiceMesh {
    /// Start one supervised connection task per configured service.
    pub fn start(config: DispatchConfig, connector: Arc<dyn ServiceConnector>) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let mut services = HashMap::new();
        for endpoint in &config.services {
            services.insert(
                endpoint.name.clone(),
                Arc::new(ServiceRuntime {
                    endpoint: endpoint.clone(),
                    status: Mutex::new(ServiceStatus::Connecting),
                    channel: Mutex::new(None),
                    reconnect: Notify::new(),
                }),
            );
        }

        let mesh = Arc::new(Self {
            config,
            services,
            tool_index: Mutex::new(HashMap::new()),
            cancel,
        });

        for runtime in mesh.services.values() {
            tokio::spawn(service_task(
                Arc::clone(&mesh),
                Arc::clone(runtime),
                Arc::clone(&connector),
            ));
        }

        mesh
    }

    /// Stop all service tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether a tool name resolves to some service.
    pub fn knows(&self, tool: &str) -> bool {
        self.tool_index
            .lock()
            .map(|idx| idx.contains_key(tool))
            .unwrap_or(false)
    }

    /// Status of a service (for diagnostics and tests).
    pub fn status(&self, service: &str) -> Option<ServiceStatus> {
        self.services
            .get(service)
            .and_then(|r| r.status.lock().ok().map(|g| *g))
    }

    /// Invoke a remote tool. Always returns text; exhausted retries and
    /// unknown tools come back as descriptive errors, never panics.
    pub async fn call(&self, tool: &str, arguments: &serde_json::Value) -> String {
        let service_name = {
            let idx = match self.tool_index.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            idx.get(tool).cloned()
        };
        let Some(service_name) = service_name else {
            return format!("Tool '{tool}' ist nicht verfügbar.");
        };
        let Some(runtime) = self.services.get(&service_name) else {
            return format!("Dienst '{service_name}' ist nicht konfiguriert.");
        };

        let attempts = self.config.call_attempts.max(1);
        let call_timeout = Duration::from_secs(self.config.call_timeout_secs);
        let offline_wait = Duration::from_secs(self.config.offline_wait_secs);

        for attempt in 1..=attempts {
            let Some(channel) = runtime.current_channel() else {
                if attempt < attempts {
                    debug!(
                        "{service_name} offline, waiting for reconnect ({attempt}/{attempts})"
                    );
                    tokio::time::sleep(offline_wait).await;
                    continue;
                }
                return format!(
                    "Fehler: Dienst '{service_name}' ist offline (Reconnect läuft)."
                );
            };

            match tokio::time::timeout(call_timeout, channel.call_tool(tool, arguments)).await {
                Ok(Ok(text)) => return text,
                Ok(Err(CallError::Failed(msg))) => {
                    // The tool itself failed; retrying won't change that.
                    return format!("Tool Fehler: {msg}");
                }
                Ok(Err(CallError::Connection(msg))) => {
                    warn!("{service_name} connection unstable, forcing reconnect: {msg}");
                    runtime.reconnect.notify_one();
                    if attempt < attempts {
                        tokio::time::sleep(offline_wait).await;
                        continue;
                    }
                    return format!("Fehler: Verbindung zu '{service_name}' verloren.");
                }
                Ok(Err(CallError::Timeout)) | Err(_) => {
                    debug!("{tool} timed out ({attempt}/{attempts})");
                    if attempt < attempts {
                        tokio::time::sleep(TIMEOUT_RETRY_DELAY).await;
                        continue;
                    }
                    return format!("Fehler: '{tool}' hat das Zeitlimit überschritten.");
                }
            }
        }

        format!("Fehler: Maximale Anzahl an Versuchen für '{tool}' erreicht.")
    }

    fn index_tools(&self, service: &str, tools: &[RemoteToolSpec]) {
        let mut idx = match self.tool_index.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for tool in tools {
            idx.insert(tool.name.clone(), service.to_owned());
        }
    }
}

/// Per-service supervision loop: connect, serve until failure, back off,
/// repeat. A forced reconnect skips the backoff.
async fn service_task(
    mesh: Arc<ServiceMesh>,
    runtime: Arc<ServiceRuntime>,
    connector: Arc<dyn ServiceConnector>,
) {
    let backoff = Duration::from_secs(mesh.config.reconnect_backoff_secs);
    let name = runtime.endpoint.name.clone();

    loop {
        if mesh.cancel.is_cancelled() {
            break;
        }
        runtime.set_status(ServiceStatus::Connecting);

        match connector.connect(&runtime.endpoint).await {
            Ok(channel) => {
                match channel.list_tools().await {
                    Ok(tools) => {
                        info!("{name} online ({} tools)", tools.len());
                        mesh.index_tools(&name, &tools);
                    }
                    Err(e) => {
                        warn!("{name}: tool listing failed: {e}");
                    }
                }
                if let Ok(mut guard) = runtime.channel.lock() {
                    *guard = Some(Arc::clone(&channel));
                }
                runtime.set_status(ServiceStatus::Connected);

                let forced = tokio::select! {
                    () = mesh.cancel.cancelled() => break,
                    () = channel.closed() => false,
                    () = runtime.reconnect.notified() => true,
                };

                if let Ok(mut guard) = runtime.channel.lock() {
                    *guard = None;
                }
                runtime.set_status(ServiceStatus::FailedBackoff);
                if forced {
                    debug!("{name}: immediate reconnect requested");
                    continue;
                }
                warn!("{name} disconnected, reconnect in {backoff:?}");
            }
            Err(e) => {
                runtime.set_status(ServiceStatus::FailedBackoff);
                warn!("{name} connect failed: {e}, retry in {backoff:?}");
            }
        }

        tokio::select! {
            () = mesh.cancel.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
    }

    if let Ok(mut guard) = runtime.channel.lock() {
        *guard = None;
    }
    debug!("{name} service task stopped");
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireRequest<'a> {
    ListTools {
        id: String,
    },
    CallTool {
        id: String,
        name: &'a str,
        arguments: &'a serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireResponse {
    Tools {
        id: String,
        tools: Vec<RemoteToolSpec>,
    },
    Result {
        id: String,
        content: String,
    },
    Error {
        id: String,
        message: String,
    },
}

enum PendingReply {
    Tools(Vec<RemoteToolSpec>),
    Content(String),
    ToolError(String),
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<PendingReply>>>;

/// Connects to tool services over WebSocket with id-correlated replies.
pub struct WsServiceConnector;

#[async_trait]
impl ServiceConnector for WsServiceConnector {
    async fn connect(&self, endpoint: &ServiceEndpoint) -> Result<Arc<dyn ServiceChannel>> {
        let (stream, _response) = tokio_tungstenite::connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| HearthError::Mesh(format!("connect {}: {e}", endpoint.url)))?;
        let (write, mut read) = stream.split();

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        // Read pump: routes responses to their pending call by id.
        {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    let msg = match msg {
                        Ok(m) => m,
                        Err(_) => break,
                    };
                    let Message::Text(text) = msg else { continue };
                    let Ok(response) = serde_json::from_str::<WireResponse>(&text) else {
                        debug!("unparseable service message: {text}");
                        continue;
                    };
                    let (id, reply) = match response {
                        WireResponse::Tools { id, tools } => (id, PendingReply::Tools(tools)),
                        WireResponse::Result { id, content } => {
                            (id, PendingReply::Content(content))
                        }
                        WireResponse::Error { id, message } => {
                            (id, PendingReply::ToolError(message))
                        }
                    };
                    let waiter = pending.lock().ok().and_then(|mut g| g.remove(&id));
                    if let Some(tx) = waiter {
                        let _ = tx.send(reply);
                    }
                }
                // Connection gone: wake every pending caller.
                closed.cancel();
                if let Ok(mut guard) = pending.lock() {
                    guard.clear();
                }
            });
        }

        Ok(Arc::new(WsServiceChannel {
            write: tokio::sync::Mutex::new(write),
            pending,
            closed,
        }))
    }
}

struct WsServiceChannel {
    write: tokio::sync::Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
    pending: Arc<PendingMap>,
    closed: CancellationToken,
}

impl WsServiceChannel {
    async fn roundtrip(
        &self,
        id: String,
        request: &WireRequest<'_>,
    ) -> std::result::Result<PendingReply, CallError> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut guard) = self.pending.lock() {
            guard.insert(id.clone(), tx);
        }

        let text = serde_json::to_string(request)
            .map_err(|e| CallError::Failed(format!("encode: {e}")))?;
        if let Err(e) = self.write.lock().await.send(Message::Text(text)).await {
            if let Ok(mut guard) = self.pending.lock() {
                guard.remove(&id);
            }
            return Err(CallError::Connection(format!("send: {e}")));
        }

        tokio::select! {
            () = self.closed.cancelled() => Err(CallError::Connection("connection closed".into())),
            reply = rx => reply.map_err(|_| CallError::Connection("reply dropped".into())),
        }
    }
}

#[async_trait]
impl ServiceChannel for WsServiceChannel {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>> {
        let id = uuid::Uuid::new_v4().to_string();
        let reply = self
            .roundtrip(id.clone(), &WireRequest::ListTools { id })
            .await
            .map_err(|e| HearthError::Mesh(format!("list_tools: {e:?}")))?;
        match reply {
            PendingReply::Tools(tools) => Ok(tools),
            PendingReply::Content(_) | PendingReply::ToolError(_) => {
                Err(HearthError::Mesh("unexpected list_tools reply".into()))
            }
        }
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> std::result::Result<String, CallError> {
        let id = uuid::Uuid::new_v4().to_string();
        let reply = self
            .roundtrip(
                id.clone(),
                &WireRequest::CallTool {
                    id,
                    name,
                    arguments,
                },
            )
            .await?;
        match reply {
            PendingReply::Content(text) => Ok(text),
            PendingReply::ToolError(message) => Err(CallError::Failed(message)),
            PendingReply::Tools(_) => Err(CallError::Failed("unexpected tools reply".into())),
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
