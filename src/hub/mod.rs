//! Device/world-state hub collaborator.
//!
//! The smart-home domain model lives behind this seam. The engine only
//! needs a state snapshot for prompt assembly, a generic execute call,
//! media volume for ducking, and the polled mailbox text field. Command
//! failures come back as text — the turn completes gracefully either way.

use crate::error::{HearthError, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// One entity in the hub's world-state snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceState {
    /// Stable entity id (e.g. `light.living_room`).
    #[serde(rename = "entity_id")]
    pub id: String,
    /// Current state value.
    pub state: String,
    /// Free-form attributes; `friendly_name` is used for prompt lines.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl DeviceState {
    /// Human-readable name, falling back to the entity id.
    pub fn name(&self) -> &str {
        self.attributes
            .get("friendly_name")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.id)
    }
}

/// World-state and device command collaborator.
pub trait DeviceHub: Send + Sync {
    /// Snapshot of all entity states.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is unreachable; callers reuse the last
    /// good snapshot.
    fn get_all_states(&self) -> Result<Vec<DeviceState>>;

    /// Execute `action` (formatted `domain.service`) against an entity.
    /// Always returns text; failures are descriptive, never panics or
    /// errors.
    fn execute(&self, entity_id: &str, action: &str, args: &serde_json::Value) -> String;

    /// Current media-player volume in \[0, 1\].
    ///
    /// # Errors
    ///
    /// Returns an error if the volume sensor cannot be read.
    fn media_volume(&self) -> Result<f32>;

    /// Set the media-player volume. Text result, never an error.
    fn set_media_volume(&self, level: f32) -> String;
}

/// Polled external text field with read-and-clear semantics.
pub trait Mailbox: Send + Sync {
    /// Take any pending text. The field is cleared in the same exchange
    /// so a poll during processing cannot double-trigger.
    ///
    /// # Errors
    ///
    /// Returns an error if the field cannot be read.
    fn take_text(&self) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

/// REST client for a Home-Assistant-style hub API.
pub struct HttpDeviceHub {
    base_url: String,
    token: String,
    volume_entity: String,
    mailbox_entity: String,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct EntityStateBody {
    state: String,
}

impl HttpDeviceHub {
    /// Create a hub client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &crate::config::HubConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HearthError::Hub(format!("http client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            token: config.token.clone(),
            volume_entity: config.volume_entity.clone(),
            mailbox_entity: config.mailbox_entity.clone(),
            client,
        })
    }

    fn get(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    fn entity_state(&self, entity_id: &str) -> Result<String> {
        let response = self
            .get(&format!("/api/states/{entity_id}"))
            .send()
            .map_err(|e| HearthError::Hub(format!("read {entity_id}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HearthError::Hub(format!(
                "read {entity_id}: hub returned {status}"
            )));
        }
        let body: EntityStateBody = response
            .json()
            .map_err(|e| HearthError::Hub(format!("read {entity_id}: {e}")))?;
        Ok(body.state)
    }

    fn call_service(&self, action: &str, body: serde_json::Value) -> Result<()> {
        let Some((domain, service)) = action.split_once('.') else {
            return Err(HearthError::Hub(format!(
                "action '{action}' is not domain.service"
            )));
        };
        let response = self
            .post(&format!("/api/services/{domain}/{service}"))
            .json(&body)
            .send()
            .map_err(|e| HearthError::Hub(format!("call {action}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HearthError::Hub(format!(
                "call {action}: hub returned {status}"
            )));
        }
        Ok(())
    }
}

impl DeviceHub for HttpDeviceHub {
    fn get_all_states(&self) -> Result<Vec<DeviceState>> {
        let response = self
            .get("/api/states")
            .send()
            .map_err(|e| HearthError::Hub(format!("states: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HearthError::Hub(format!("states: hub returned {status}")));
        }
        response
            .json()
            .map_err(|e| HearthError::Hub(format!("states: {e}")))
    }

    fn execute(&self, entity_id: &str, action: &str, args: &serde_json::Value) -> String {
        let mut body = json!({ "entity_id": entity_id });
        if let (Some(dst), Some(src)) = (body.as_object_mut(), args.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        match self.call_service(action, body) {
            Ok(()) => "Ok.".to_owned(),
            Err(e) => {
                warn!("hub execute failed: {e}");
                format!("Fehler: {e}")
            }
        }
    }

    fn media_volume(&self) -> Result<f32> {
        let raw = self.entity_state(&self.volume_entity)?;
        raw.trim()
            .parse::<f32>()
            .map_err(|e| HearthError::Hub(format!("volume '{raw}': {e}")))
    }

    fn set_media_volume(&self, level: f32) -> String {
        let body = json!({
            "entity_id": self.volume_entity.replace("sensor.", "media_player."),
            "volume_level": level.clamp(0.0, 1.0),
        });
        match self.call_service("media_player.volume_set", body) {
            Ok(()) => format!("Lautstärke auf {:.0}% gesetzt.", level * 100.0),
            Err(e) => {
                warn!("volume set failed: {e}");
                format!("Fehler: {e}")
            }
        }
    }
}

impl Mailbox for HttpDeviceHub {
    fn take_text(&self) -> Result<Option<String>> {
        let text = self.entity_state(&self.mailbox_entity)?;
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "unknown" {
            return Ok(None);
        }

        // Clear before returning so a second poll cannot replay the text.
        self.call_service(
            "input_text.set_value",
            json!({ "entity_id": self.mailbox_entity, "value": "" }),
        )?;
        debug!("mailbox text taken ({} chars)", trimmed.len());
        Ok(Some(trimmed.to_owned()))
    }
}

/// Remembers the media volume across a turn: ducked to half on a trigger,
/// restored afterward. Restore is idempotent — teardown may call it even
/// if nothing was ducked.
pub struct VolumeDuck {
    hub: std::sync::Arc<dyn DeviceHub>,
    remembered: std::sync::Mutex<Option<f32>>,
}

impl VolumeDuck {
    /// Ducking helper over the hub collaborator.
    pub fn new(hub: std::sync::Arc<dyn DeviceHub>) -> Self {
        Self {
            hub,
            remembered: std::sync::Mutex::new(None),
        }
    }

    /// Duck playing media to half volume, remembering the current level.
    /// A failed volume read leaves playback untouched.
    pub fn duck(&self) {
        let level = match self.hub.media_volume() {
            Ok(level) => level,
            Err(e) => {
                debug!("volume sensor unavailable, not ducking: {e}");
                return;
            }
        };
        if let Ok(mut guard) = self.remembered.lock() {
            // A second trigger before restore keeps the original level.
            if guard.is_none() {
                *guard = Some(level);
                self.hub.set_media_volume(level / 2.0);
            }
        }
    }

    /// Restore the remembered level, if any.
    pub fn restore(&self) {
        let level = self.remembered.lock().ok().and_then(|mut g| g.take());
        if let Some(level) = level {
            self.hub.set_media_volume(level);
        }
    }
}

/// Format a device snapshot into prompt lines.
pub fn snapshot_lines(states: &[DeviceState]) -> String {
    let mut lines = String::new();
    for device in states {
        lines.push_str(&format!(
            "- {} [ID: {}] ({})\n",
            device.name(),
            device.id,
            device.state
        ));
    }
    if lines.is_empty() {
        lines.push_str("Keine Geräte gefunden.\n");
    }
    lines
}
