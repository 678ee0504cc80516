//! Wire-shaped session events.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    Plan,
    Reasoning,
    Code,
    Plot,
    AssistantMessage,
    Metadata,
    Artifacts,
    Error,
}

/// One event on a session's bus. Serialized form is the public wire
/// shape: `{event_id, type, payload, timestamp, step?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub payload: serde_json::Value,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
}

impl Event {
    pub fn new(kind: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            timestamp: chrono::Utc::now().to_rfc3339(),
            step: None,
        }
    }

    /// Same as [`Event::new`] with the execution step index attached
    /// (used by `code` and `plot` events).
    pub fn with_step(kind: EventType, payload: serde_json::Value, step: u64) -> Self {
        let mut event = Self::new(kind, payload);
        event.step = Some(step);
        event
    }

    pub fn status(stage: &str) -> Self {
        Self::new(EventType::Status, serde_json::json!({ "stage": stage }))
    }

    pub fn error(message: &str) -> Self {
        Self::new(EventType::Error, serde_json::json!({ "message": message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let event = Event::with_step(EventType::Code, json!({"code": "print(1)"}), 3);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "code");
        assert_eq!(value["step"], 3);
        assert!(value["event_id"].is_string());
        assert!(value["timestamp"].is_string());
        assert_eq!(value["payload"]["code"], "print(1)");
    }

    #[test]
    fn test_step_omitted_when_absent() {
        let event = Event::status("running");
        let s = serde_json::to_string(&event).unwrap();
        assert!(!s.contains("\"step\""));
        assert!(s.contains("\"type\":\"status\""));
    }

    #[test]
    fn test_event_ids_unique() {
        let a = Event::status("running");
        let b = Event::status("running");
        assert_ne!(a.event_id, b.event_id);
    }
}
