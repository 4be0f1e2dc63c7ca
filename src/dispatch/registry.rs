//! Local tool handlers.
//!
//! Local tools are synchronous by contract — the dispatcher offloads them
//! to the blocking pool. Anything they return is text; errors are caught
//! at the dispatch boundary and converted.

use crate::error::Result;
use crate::hub::DeviceHub;
use crate::router::state::SessionController;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Canonical key-value arguments after boundary normalization.
pub type ToolArgs = Map<String, Value>;

/// One locally executed tool.
pub trait LocalTool: Send + Sync {
    /// Tool name as the agent calls it.
    fn name(&self) -> &str;

    /// Human-readable description for the agent's tool listing.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments.
    fn schema(&self) -> Value;

    /// Read-only query tools skip the confirmation cue.
    fn is_query(&self) -> bool {
        false
    }

    /// Execute with normalized arguments. Blocking.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid arguments or a failed action; the
    /// dispatcher converts it to text.
    fn invoke(&self, args: &ToolArgs) -> Result<String>;
}

/// Name-indexed set of local tools.
#[derive(Default)]
pub struct LocalRegistry {
    tools: HashMap<String, Arc<dyn LocalTool>>,
}

impl LocalRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous one with the same name.
    pub fn register(&mut self, tool: Arc<dyn LocalTool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LocalTool>> {
        self.tools.get(name).cloned()
    }

    /// Whether a tool is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names (for logs and diagnostics).
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in tools
// ---------------------------------------------------------------------------

fn arg_str<'a>(args: &'a ToolArgs, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| crate::error::HearthError::Dispatch(format!("missing argument '{key}'")))
}

/// Ends the session once the current turn completes.
pub struct EndConversationTool {
    controller: Arc<SessionController>,
}

impl EndConversationTool {
    /// Tool acting on the shared controller.
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }
}

impl LocalTool for EndConversationTool {
    fn name(&self) -> &str {
        "end_conversation"
    }

    fn description(&self) -> &str {
        "Beendet das Gespräch, wenn der Nutzer fertig ist."
    }

    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn is_query(&self) -> bool {
        true
    }

    fn invoke(&self, _args: &ToolArgs) -> Result<String> {
        self.controller.request_close_after_turn();
        Ok("Ok.".to_owned())
    }
}

/// Reads the current state of one entity from the hub snapshot.
pub struct DeviceStateTool {
    hub: Arc<dyn DeviceHub>,
}

impl DeviceStateTool {
    /// Tool backed by the hub collaborator.
    pub fn new(hub: Arc<dyn DeviceHub>) -> Self {
        Self { hub }
    }
}

impl LocalTool for DeviceStateTool {
    fn name(&self) -> &str {
        "device_state"
    }

    fn description(&self) -> &str {
        "Prüft den aktuellen Status eines Geräts (per entity_id)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entity_id": { "type": "string", "description": "ID des Geräts" }
            },
            "required": ["entity_id"]
        })
    }

    fn is_query(&self) -> bool {
        true
    }

    fn invoke(&self, args: &ToolArgs) -> Result<String> {
        let entity_id = arg_str(args, "entity_id")?;
        let states = self.hub.get_all_states()?;
        match states.iter().find(|d| d.id == entity_id) {
            Some(device) => Ok(format!("{} ist {}.", device.name(), device.state)),
            None => Ok(format!("Gerät '{entity_id}' nicht gefunden.")),
        }
    }
}

/// Executes a generic `domain.service` action against an entity.
pub struct DeviceExecuteTool {
    hub: Arc<dyn DeviceHub>,
}

impl DeviceExecuteTool {
    /// Tool backed by the hub collaborator.
    pub fn new(hub: Arc<dyn DeviceHub>) -> Self {
        Self { hub }
    }
}

impl LocalTool for DeviceExecuteTool {
    fn name(&self) -> &str {
        "device_execute"
    }

    fn description(&self) -> &str {
        "Führt eine Aktion auf einem Gerät aus. MUSS mit entity_id aufgerufen werden."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entity_id": { "type": "string", "description": "ID des Geräts" },
                "action": {
                    "type": "string",
                    "description": "Aktion als domain.service, z.B. light.turn_on"
                },
                "data": { "type": "object", "description": "Zusätzliche Parameter" }
            },
            "required": ["entity_id", "action"]
        })
    }

    fn invoke(&self, args: &ToolArgs) -> Result<String> {
        let entity_id = arg_str(args, "entity_id")?;
        let action = arg_str(args, "action")?;
        let data = args.get("data").cloned().unwrap_or(Value::Null);
        Ok(self.hub.execute(entity_id, action, &data))
    }
}
