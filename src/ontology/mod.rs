//! Entity record value shared by the domain service and the event producer.
//!
//! The relational layer and HTTP shaping live elsewhere; this module only
//! defines the value, the typed update-set applied to it, and the row
//! decoder both single- and multi-row reads go through.

mod entity;
mod row;
mod update;

pub use entity::{Entity, EntityStatus, EntityType, Position, Priority};
pub use row::{decode_entities, decode_entity, RowError, RowReader, ENTITY_COLUMNS};
pub use update::{EntityUpdate, FieldChange, UpdateError};
