//! Tool dispatch: structured calls to local handlers or the service mesh.
//!
//! Arguments are normalized into one canonical key-value mapping at this
//! boundary; anything that fails normalization is rejected before any
//! handler runs. Every outcome is text — exceptions stop here.

pub mod mesh;
pub mod registry;

use crate::messages::{Scheduling, ToolCall, ToolReply};
use mesh::ServiceMesh;
use registry::{LocalRegistry, ToolArgs};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub use mesh::{
    CallError, RemoteToolSpec, ServiceChannel, ServiceConnector, ServiceStatus, WsServiceConnector,
};
pub use registry::{
    DeviceExecuteTool, DeviceStateTool, EndConversationTool, LocalRegistry as Registry, LocalTool,
};

/// Outcome of one dispatched call.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// The reply to hand back to the agent.
    pub reply: ToolReply,
    /// A successful non-query local call wants the confirmation cue
    /// (already suppressed for silent turns).
    pub confirm_cue: bool,
}

/// Resolves tool calls by name to local handlers or remote services.
pub struct ToolDispatcher {
    local: LocalRegistry,
    mesh: Option<Arc<ServiceMesh>>,
}

impl ToolDispatcher {
    /// Dispatcher over a local registry and an optional mesh.
    pub fn new(local: LocalRegistry, mesh: Option<Arc<ServiceMesh>>) -> Self {
        Self { local, mesh }
    }

    /// Execute one call. Never errors: failures come back as result text.
    ///
    /// `silent_turn` suppresses the confirmation cue for background work.
    pub async fn dispatch(&self, call: &ToolCall, silent_turn: bool) -> DispatchOutcome {
        debug!("tool call: {} ({})", call.name, call.id);

        let args = match normalize_arguments(&call.arguments) {
            Ok(args) => args,
            Err(reason) => {
                warn!("rejecting malformed arguments for {}: {reason}", call.name);
                return DispatchOutcome {
                    reply: reply(call, format!("Fehler: ungültige Argumente ({reason})")),
                    confirm_cue: false,
                };
            }
        };

        if let Some(tool) = self.local.get(&call.name) {
            // Local handlers are blocking by contract.
            let tool_for_exec = Arc::clone(&tool);
            let result = tokio::task::spawn_blocking(move || tool_for_exec.invoke(&args)).await;
            return match result {
                Ok(Ok(text)) => DispatchOutcome {
                    confirm_cue: !tool.is_query() && !silent_turn,
                    reply: reply(call, text),
                },
                Ok(Err(e)) => DispatchOutcome {
                    reply: reply(call, format!("Fehler bei {}: {e}", call.name)),
                    confirm_cue: false,
                },
                Err(join_err) => DispatchOutcome {
                    reply: reply(call, format!("Fehler bei {}: {join_err}", call.name)),
                    confirm_cue: false,
                },
            };
        }

        if let Some(mesh) = &self.mesh
            && mesh.knows(&call.name)
        {
            let text = mesh.call(&call.name, &call.arguments).await;
            return DispatchOutcome {
                reply: reply(call, text),
                confirm_cue: false,
            };
        }

        warn!("unknown tool: {}", call.name);
        DispatchOutcome {
            reply: reply(call, "Funktion unbekannt.".to_owned()),
            confirm_cue: false,
        }
    }
}

fn reply(call: &ToolCall, result: String) -> ToolReply {
    ToolReply {
        call_id: call.id.clone(),
        name: call.name.clone(),
        result,
        scheduling: Scheduling::Interrupt,
    }
}

/// Normalize raw tool arguments into one canonical key-value mapping.
///
/// Accepts a JSON object (internal keys starting with `_` are stripped)
/// or null/absent arguments (empty mapping). Everything else is rejected.
pub fn normalize_arguments(raw: &Value) -> std::result::Result<ToolArgs, String> {
    match raw {
        Value::Null => Ok(ToolArgs::new()),
        Value::Object(map) => Ok(map
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()),
        other => Err(format!("expected object, got {}", type_name(other))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
