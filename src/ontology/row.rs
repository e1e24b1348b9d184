//! Row decoding.
//!
//! Storage backends expose a row through [`RowReader`]; [`decode_entity`]
//! is the one place column values are turned into an [`Entity`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::entity::Entity;

/// Column order used by entity queries.
pub const ENTITY_COLUMNS: [&str; 16] = [
    "entity_id",
    "org_id",
    "entity_type",
    "status",
    "priority",
    "is_live",
    "latitude",
    "longitude",
    "altitude",
    "heading",
    "velocity",
    "components",
    "tags",
    "metadata",
    "created_at",
    "updated_at",
];

/// Row decode failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RowError {
    #[error("Column {0} is missing or NULL")]
    Missing(&'static str),

    #[error("Column {column} has an invalid value: {reason}")]
    Invalid { column: &'static str, reason: String },

    #[error("Backend error reading column {column}: {message}")]
    Backend { column: &'static str, message: String },
}

/// Typed access to one result row. `Ok(None)` means SQL NULL.
pub trait RowReader {
    fn text(&self, column: &'static str) -> Result<Option<String>, RowError>;
    fn real(&self, column: &'static str) -> Result<Option<f64>, RowError>;
    fn integer(&self, column: &'static str) -> Result<Option<i64>, RowError>;
}

fn required(row: &(impl RowReader + ?Sized), column: &'static str) -> Result<String, RowError> {
    row.text(column)?.ok_or(RowError::Missing(column))
}

fn parsed<T>(row: &(impl RowReader + ?Sized), column: &'static str) -> Result<T, RowError>
where
    T: std::str::FromStr<Err = String>,
{
    required(row, column)?
        .parse()
        .map_err(|reason| RowError::Invalid { column, reason })
}

fn timestamp(row: &(impl RowReader + ?Sized), column: &'static str) -> Result<DateTime<Utc>, RowError> {
    let text = required(row, column)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RowError::Invalid {
            column,
            reason: e.to_string(),
        })
}

fn json(row: &(impl RowReader + ?Sized), column: &'static str) -> Result<Value, RowError> {
    match row.text(column)? {
        None => Ok(Value::Null),
        Some(text) if text.is_empty() => Ok(Value::Null),
        Some(text) => serde_json::from_str(&text).map_err(|e| RowError::Invalid {
            column,
            reason: e.to_string(),
        }),
    }
}

/// Decode one entity row.
pub fn decode_entity<R: RowReader + ?Sized>(row: &R) -> Result<Entity, RowError> {
    let tags = match json(row, "tags")? {
        Value::Null => Vec::new(),
        value => serde_json::from_value(value).map_err(|e| RowError::Invalid {
            column: "tags",
            reason: e.to_string(),
        })?,
    };

    Ok(Entity {
        entity_id: required(row, "entity_id")?,
        org_id: required(row, "org_id")?,
        entity_type: parsed(row, "entity_type")?,
        status: parsed(row, "status")?,
        priority: parsed(row, "priority")?,
        is_live: row.integer("is_live")?.unwrap_or(0) != 0,
        latitude: row.real("latitude")?,
        longitude: row.real("longitude")?,
        altitude: row.real("altitude")?,
        heading: row.real("heading")?,
        velocity: row.real("velocity")?,
        components: json(row, "components")?,
        tags,
        metadata: json(row, "metadata")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

/// Decode every row, failing on the first bad one.
pub fn decode_entities<'a, R, I>(rows: I) -> Result<Vec<Entity>, RowError>
where
    R: RowReader + ?Sized + 'a,
    I: IntoIterator<Item = &'a R>,
{
    rows.into_iter().map(decode_entity).collect()
}

/// JSON-shaped rows, as returned by document stores and test fixtures.
impl RowReader for HashMap<String, Value> {
    fn text(&self, column: &'static str) -> Result<Option<String>, RowError> {
        match self.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Ok(Some(other.to_string())),
        }
    }

    fn real(&self, column: &'static str) -> Result<Option<f64>, RowError> {
        match self.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| RowError::Invalid {
                column,
                reason: format!("expected number, got {}", value),
            }),
        }
    }

    fn integer(&self, column: &'static str) -> Result<Option<i64>, RowError> {
        match self.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(i64::from(*b))),
            Some(value) => value.as_i64().map(Some).ok_or_else(|| RowError::Invalid {
                column,
                reason: format!("expected integer, got {}", value),
            }),
        }
    }
}
