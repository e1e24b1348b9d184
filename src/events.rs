//! Domain event envelope.
//!
//! The JSON body of every message published on the bus:
//!
//! ```json
//! {"id":"...","type":"created","subject":"entities.org1.created",
//!  "data":{...},"metadata":{...},"timestamp":"...","source":"entity-service"}
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Kind of a domain event, serialized in snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    StatusChanged,
    Alert,
    Telemetry,
    Command,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::StatusChanged => "status_changed",
            EventKind::Alert => "alert",
            EventKind::Telemetry => "telemetry",
            EventKind::Command => "command",
        }
    }

    /// Whether the event carries the full entity snapshot.
    pub fn carries_snapshot(&self) -> bool {
        matches!(self, EventKind::Created | EventKind::Updated)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope decode failure.
#[derive(Debug, thiserror::Error)]
#[error("Malformed event envelope: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// A domain event as carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub subject: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl DomainEvent {
    /// Create an event with a random id, stamped now.
    pub fn new(kind: EventKind, subject: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            subject: subject.into(),
            data: Map::new(),
            metadata: None,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// String field from `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let event = DomainEvent::new(EventKind::StatusChanged, "entities.org1.status", "test")
            .with_id("e1")
            .with_data("entity_id", "ent1");

        let value: Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["id"], "e1");
        assert_eq!(value["type"], "status_changed");
        assert_eq!(value["data"]["entity_id"], "ent1");
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_decode_minimal_envelope() {
        let bytes = json!({
            "id": "e1",
            "type": "created",
            "subject": "entities.org1.created",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "entity-service"
        })
        .to_string();

        let event = DomainEvent::from_json(bytes.as_bytes()).unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert!(event.data.is_empty());
        assert!(event.metadata.is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let bytes = br#"{"id":"e1","type":"exploded","subject":"s","timestamp":"2024-01-01T00:00:00Z","source":"x"}"#;
        assert!(DomainEvent::from_json(bytes).is_err());
        assert!(DomainEvent::from_json(b"not json").is_err());
    }

    #[test]
    fn test_metadata_accumulates() {
        let event = DomainEvent::new(EventKind::Alert, "events.org1.alert", "test")
            .with_metadata("severity", "high")
            .with_metadata("zone", 4);
        let metadata = event.metadata.unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["zone"], 4);
    }

    #[test]
    fn test_snapshot_kinds() {
        assert!(EventKind::Created.carries_snapshot());
        assert!(EventKind::Updated.carries_snapshot());
        assert!(!EventKind::Deleted.carries_snapshot());
        assert!(!EventKind::StatusChanged.carries_snapshot());
    }
}
