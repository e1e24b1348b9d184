//! Typed partial updates.
//!
//! An [`EntityUpdate`] names only the fields a caller may change. It is
//! validated into a list of [`FieldChange`]s before anything is written,
//! so the storage layer and the event producer see the same change set.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::entity::{Entity, EntityStatus, EntityType, Priority};

/// Rejected update.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpdateError {
    #[error("No updates provided")]
    Empty,

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Field {field} must be a JSON object")]
    NotAnObject { field: &'static str },
}

/// Fields a caller may update. Unknown fields are rejected at decode time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityUpdate {
    pub entity_type: Option<EntityType>,
    pub status: Option<EntityStatus>,
    pub priority: Option<Priority>,
    pub is_live: Option<bool>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub velocity: Option<f64>,
    pub components: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Value>,
}

/// One validated column change.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    EntityType(EntityType),
    Status(EntityStatus),
    Priority(Priority),
    IsLive(bool),
    Latitude(f64),
    Longitude(f64),
    Altitude(f64),
    Heading(f64),
    Velocity(f64),
    Components(Value),
    Tags(Vec<String>),
    Metadata(Value),
}

impl FieldChange {
    /// Column the change writes.
    pub fn column(&self) -> &'static str {
        match self {
            FieldChange::EntityType(_) => "entity_type",
            FieldChange::Status(_) => "status",
            FieldChange::Priority(_) => "priority",
            FieldChange::IsLive(_) => "is_live",
            FieldChange::Latitude(_) => "latitude",
            FieldChange::Longitude(_) => "longitude",
            FieldChange::Altitude(_) => "altitude",
            FieldChange::Heading(_) => "heading",
            FieldChange::Velocity(_) => "velocity",
            FieldChange::Components(_) => "components",
            FieldChange::Tags(_) => "tags",
            FieldChange::Metadata(_) => "metadata",
        }
    }

    fn apply(&self, entity: &mut Entity) {
        match self {
            FieldChange::EntityType(v) => entity.entity_type = *v,
            FieldChange::Status(v) => entity.status = *v,
            FieldChange::Priority(v) => entity.priority = *v,
            FieldChange::IsLive(v) => entity.is_live = *v,
            FieldChange::Latitude(v) => entity.latitude = Some(*v),
            FieldChange::Longitude(v) => entity.longitude = Some(*v),
            FieldChange::Altitude(v) => entity.altitude = Some(*v),
            FieldChange::Heading(v) => entity.heading = Some(*v),
            FieldChange::Velocity(v) => entity.velocity = Some(*v),
            FieldChange::Components(v) => entity.components = v.clone(),
            FieldChange::Tags(v) => entity.tags = v.clone(),
            FieldChange::Metadata(v) => entity.metadata = v.clone(),
        }
    }
}

fn bounded(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, UpdateError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(UpdateError::OutOfRange { field, value })
    }
}

fn object(field: &'static str, value: &Value) -> Result<Value, UpdateError> {
    if value.is_object() {
        Ok(value.clone())
    } else {
        Err(UpdateError::NotAnObject { field })
    }
}

impl EntityUpdate {
    /// Update that only changes the status.
    pub fn status(status: EntityStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Validate every field and return the change set.
    pub fn validate(&self) -> Result<Vec<FieldChange>, UpdateError> {
        if self.is_empty() {
            return Err(UpdateError::Empty);
        }

        let mut changes = Vec::new();
        if let Some(v) = self.entity_type {
            changes.push(FieldChange::EntityType(v));
        }
        if let Some(v) = self.status {
            changes.push(FieldChange::Status(v));
        }
        if let Some(v) = self.priority {
            changes.push(FieldChange::Priority(v));
        }
        if let Some(v) = self.is_live {
            changes.push(FieldChange::IsLive(v));
        }
        if let Some(v) = self.latitude {
            changes.push(FieldChange::Latitude(bounded("latitude", v, -90.0, 90.0)?));
        }
        if let Some(v) = self.longitude {
            changes.push(FieldChange::Longitude(bounded("longitude", v, -180.0, 180.0)?));
        }
        if let Some(v) = self.altitude {
            changes.push(FieldChange::Altitude(bounded("altitude", v, f64::MIN, f64::MAX)?));
        }
        if let Some(v) = self.heading {
            changes.push(FieldChange::Heading(bounded("heading", v, 0.0, 360.0)?));
        }
        if let Some(v) = self.velocity {
            changes.push(FieldChange::Velocity(bounded("velocity", v, 0.0, f64::MAX)?));
        }
        if let Some(v) = &self.components {
            changes.push(FieldChange::Components(object("components", v)?));
        }
        if let Some(v) = &self.tags {
            changes.push(FieldChange::Tags(v.clone()));
        }
        if let Some(v) = &self.metadata {
            changes.push(FieldChange::Metadata(object("metadata", v)?));
        }
        Ok(changes)
    }

    /// Validate, then apply to `entity` and stamp `updated_at`.
    ///
    /// Nothing is applied when validation fails.
    pub fn apply(
        &self,
        entity: &mut Entity,
        now: DateTime<Utc>,
    ) -> Result<Vec<FieldChange>, UpdateError> {
        let changes = self.validate()?;
        for change in &changes {
            change.apply(entity);
        }
        entity.updated_at = now;
        Ok(changes)
    }
}
