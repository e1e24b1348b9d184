use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Vehicle,
    Person,
    Asset,
    Location,
    Sensor,
    Device,
    Drone,
    Robot,
}

/// Operational status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
    Offline,
    Online,
}

/// Handling priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!(concat!("Unknown ", stringify!($ty), ": {}"), other)),
                }
            }
        }
    };
}

string_enum!(EntityType {
    Vehicle => "vehicle",
    Person => "person",
    Asset => "asset",
    Location => "location",
    Sensor => "sensor",
    Device => "device",
    Drone => "drone",
    Robot => "robot",
});

string_enum!(EntityStatus {
    Active => "active",
    Inactive => "inactive",
    Unknown => "unknown",
    Offline => "offline",
    Online => "online",
});

string_enum!(Priority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Critical => "critical",
});

/// Geographic position in WGS84 degrees, altitude in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

/// A tracked entity, scoped to one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub org_id: String,
    pub entity_type: EntityType,
    pub status: EntityStatus,
    pub priority: Priority,
    pub is_live: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<f64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub components: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// New entity with default status and priority, stamped now.
    pub fn new(
        entity_id: impl Into<String>,
        org_id: impl Into<String>,
        entity_type: EntityType,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            org_id: org_id.into(),
            entity_type,
            status: EntityStatus::default(),
            priority: Priority::default(),
            is_live: false,
            latitude: None,
            longitude: None,
            altitude: None,
            heading: None,
            velocity: None,
            components: Value::Null,
            tags: Vec::new(),
            metadata: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.latitude = Some(position.latitude);
        self.longitude = Some(position.longitude);
        self.altitude = position.altitude;
        self
    }

    /// Position, when both coordinates are known.
    pub fn position(&self) -> Option<Position> {
        Some(Position {
            latitude: self.latitude?,
            longitude: self.longitude?,
            altitude: self.altitude,
        })
    }

    /// Monotonic version stamp derived from `updated_at`.
    ///
    /// Stable across retries of the same state change, so it is safe to
    /// embed in deduplication keys.
    pub fn version_stamp(&self) -> i64 {
        self.updated_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.updated_at.timestamp_micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_enum_strings_round_trip() {
        for text in ["vehicle", "person", "asset", "location", "sensor", "device", "drone", "robot"] {
            assert_eq!(text.parse::<EntityType>().unwrap().as_str(), text);
        }
        assert_eq!("online".parse::<EntityStatus>(), Ok(EntityStatus::Online));
        assert!("exploded".parse::<EntityStatus>().is_err());
        assert!(Priority::Critical > Priority::High);
    }

    #[test]
    fn test_new_entity_defaults() {
        let entity = Entity::new("ent1", "org1", EntityType::Drone);
        assert_eq!(entity.status, EntityStatus::Unknown);
        assert_eq!(entity.priority, Priority::Normal);
        assert!(entity.position().is_none());
        assert_eq!(entity.created_at, entity.updated_at);
    }

    #[test]
    fn test_position_requires_both_coordinates() {
        let mut entity = Entity::new("ent1", "org1", EntityType::Sensor).with_position(Position {
            latitude: 51.5,
            longitude: -0.12,
            altitude: Some(30.0),
        });
        assert_eq!(entity.position().unwrap().altitude, Some(30.0));

        entity.longitude = None;
        assert!(entity.position().is_none());
    }

    #[test]
    fn test_serialization_omits_absent_fields() {
        let entity = Entity::new("ent1", "org1", EntityType::Robot);
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["entity_type"], "robot");
        assert_eq!(value["status"], "unknown");
        assert!(value.get("latitude").is_none());
        assert!(value.get("tags").is_none());
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_version_stamp_tracks_updated_at() {
        let mut entity = Entity::new("ent1", "org1", EntityType::Asset);
        entity.updated_at = Utc.timestamp_opt(100, 0).unwrap();
        assert_eq!(entity.version_stamp(), 100_000_000_000);
    }
}
