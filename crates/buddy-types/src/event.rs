use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Loosely-typed status event published on the engine bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    /// Task id carried in the properties, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.properties
            .get("taskID")
            .or_else(|| self.properties.get("task_id"))
            .and_then(Value::as_str)
    }
}
