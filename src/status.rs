//! Cumulative printer telemetry.
//!
//! The backend pushes partial patches; [`StatusStore`] deep-merges them into
//! a single tree and reports the before/after snapshot the classifier needs.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::config::constants::MAX_MERGE_DEPTH;
use crate::moonraker::PrinterRpc;

/// Temperature sensor reporting the host CPU.
pub const HOST_SENSOR: &str = "temperature_sensor raspberry";

/// Temperature sensor reporting the printer MCU.
pub const MCU_SENSOR: &str = "temperature_sensor MCU";

/// Objects read in full after every (re)connect.
pub fn baseline_objects() -> Value {
    json!({
        "print_stats": null,
        "idle_timeout": null,
        "display_status": null,
        "extruder": null,
        "virtual_sdcard": ["progress"],
    })
}

/// Objects whose changes the backend should push.
pub fn subscribed_objects() -> Value {
    json!({
        "print_stats": null,
        "display_status": null,
        "extruder": null,
        "toolhead": null,
        "temperature_host raspberry": null,
        HOST_SENSOR: null,
        MCU_SENSOR: null,
        "system_stats": null,
        "idle_timeout": null,
        "heater_bed": null,
        "heater_fan": null,
        "virtual_sdcard": ["progress"],
        "query_endstops": null,
        "exclude_object": null,
    })
}

/// `print_stats.state` as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Other(String),
}

impl PrintState {
    /// Classify a raw state string. Both `pause` and `paused` mean paused.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "standby" => Self::Standby,
            "printing" => Self::Printing,
            "pause" | "paused" => Self::Paused,
            other => Self::Other(other.to_string()),
        }
    }
}

/// The part of the status the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: Option<PrintState>,
    pub message: Option<String>,
}

/// Tree of telemetry objects, keyed by object name (`print_stats`,
/// `extruder`, ...) and then by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrinterStatus(Map<String, Value>);

impl PrinterStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `patch` into this status. Non-object patches are ignored.
    pub fn merge(&mut self, patch: &Value) {
        if let Value::Object(patch) = patch {
            merge_map(&mut self.0, patch, 0);
        }
    }

    /// Raw value of `object.field`, e.g. `("print_stats", "state")`.
    pub fn get(&self, object: &str, field: &str) -> Option<&Value> {
        self.0.get(object)?.get(field)
    }

    /// `object.field` as a string; `None` if absent or not a string.
    pub fn str_field(&self, object: &str, field: &str) -> Option<&str> {
        self.get(object, field)?.as_str()
    }

    /// `object.field` as a number; integers are widened.
    pub fn f64_field(&self, object: &str, field: &str) -> Option<f64> {
        self.get(object, field)?.as_f64()
    }

    /// Parsed `print_stats.state`, if the backend reported one.
    pub fn print_state(&self) -> Option<PrintState> {
        self.str_field("print_stats", "state").map(PrintState::parse)
    }

    pub fn is_printing(&self) -> bool {
        self.print_state() == Some(PrintState::Printing)
    }

    /// File being printed. An empty filename counts as none.
    pub fn filename(&self) -> Option<&str> {
        self.str_field("print_stats", "filename")
            .filter(|name| !name.is_empty())
    }

    /// Last `M117` display message.
    pub fn display_message(&self) -> Option<&str> {
        self.str_field("display_status", "message")
    }

    /// Z height from a four-element toolhead position.
    pub fn z_position(&self) -> Option<f64> {
        match self.get("toolhead", "position")?.as_array()?.as_slice() {
            [_, _, z, _] => z.as_f64(),
            _ => None,
        }
    }

    /// The state and message the classifier compares across a patch.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.print_state(),
            message: self.display_message().map(str::to_string),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Value> for PrinterStatus {
    fn from(value: Value) -> Self {
        let mut status = Self::new();
        status.merge(&value);
        status
    }
}

/// Recursively merge `patch` into `target`.
///
/// Nested objects merge key by key; anything else (scalars, arrays, null)
/// replaces the existing value. Past [`MAX_MERGE_DEPTH`] nested objects are
/// replaced wholesale instead of merged.
fn merge_map(target: &mut Map<String, Value>, patch: &Map<String, Value>, depth: usize) {
    for (key, incoming) in patch {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) if depth < MAX_MERGE_DEPTH => {
                merge_map(existing, nested, depth + 1);
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Klippy state from `printer.info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KlippyState {
    Ready,
    Startup,
    Shutdown,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl KlippyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Result of `printer.info`, refreshed only by explicit query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PrinterInfo {
    #[serde(default)]
    pub state: KlippyState,
    #[serde(default)]
    pub state_message: String,
}

impl PrinterInfo {
    pub fn is_ready(&self) -> bool {
        self.state == KlippyState::Ready
    }
}

/// Before/after view of one patch application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub previous: StateSnapshot,
    pub current: StateSnapshot,
}

/// Owns the cumulative telemetry of one printer.
#[derive(Debug, Default)]
pub struct StatusStore {
    status: PrinterStatus,
    info: PrinterInfo,
    host_stats: Map<String, Value>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a pushed status patch and report what changed.
    pub fn apply_patch(&mut self, patch: &Value) -> Transition {
        let previous = self.status.snapshot();
        self.status.merge(patch);
        Transition {
            previous,
            current: self.status.snapshot(),
        }
    }

    /// Query `fields` in full and merge the result.
    ///
    /// Returns `false` when the backend gave no answer (not connected).
    pub async fn baseline(&mut self, rpc: &dyn PrinterRpc, fields: Value) -> bool {
        let Some(result) = rpc
            .call("printer.objects.query", json!({ "objects": fields }))
            .await
        else {
            return false;
        };

        match result.get("status") {
            Some(status) => {
                self.status.merge(status);
                true
            }
            None => false,
        }
    }

    /// Re-read `printer.info`. An unanswered query leaves the state unknown.
    pub async fn refresh_info(&mut self, rpc: &dyn PrinterRpc) -> &PrinterInfo {
        self.info = match rpc.call("printer.info", json!({})).await {
            Some(result) => serde_json::from_value(result).unwrap_or_default(),
            None => PrinterInfo::default(),
        };
        &self.info
    }

    /// Merge a host process statistics patch.
    pub fn apply_host_stats(&mut self, patch: &Value) {
        if let Value::Object(patch) = patch {
            merge_map(&mut self.host_stats, patch, 0);
        }
    }

    pub fn status(&self) -> &PrinterStatus {
        &self.status
    }

    pub fn info(&self) -> &PrinterInfo {
        &self.info
    }

    pub fn host_stats(&self) -> &Map<String, Value> {
        &self.host_stats
    }
}
