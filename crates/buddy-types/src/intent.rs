use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::IntentId;

/// A user request handed to the orchestrator. Never mutated after acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    /// Explicit plan category; when absent the planner classifies the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub payload: Value,
    pub requester: String,
    pub created_at: DateTime<Utc>,
}

impl Intent {
    pub fn new(requester: impl Into<String>, payload: Value) -> Self {
        Self {
            id: IntentId::generate(),
            category: None,
            payload,
            requester: requester.into(),
            created_at: Utc::now(),
        }
    }

    pub fn text(requester: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(requester, Value::String(text.into()))
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Free-form text carried by the payload, either as a bare string or a `text` field.
    pub fn text_content(&self) -> Option<&str> {
        match &self.payload {
            Value::String(text) => Some(text.as_str()),
            Value::Object(map) => map
                .get("text")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_content_reads_string_and_object_payloads() {
        let bare = Intent::text("sam", "send check-in message to Alex");
        assert_eq!(bare.text_content(), Some("send check-in message to Alex"));

        let structured = Intent::new("sam", json!({"text": "plan my day", "tz": "UTC"}));
        assert_eq!(structured.text_content(), Some("plan my day"));

        let opaque = Intent::new("sam", json!([1, 2, 3]));
        assert_eq!(opaque.text_content(), None);
    }
}
