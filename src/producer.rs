//! Entity event producer.
//!
//! Turns entity lifecycle changes into [`DomainEvent`]s on the matching
//! subject, with a deduplication key derived from the entity's version
//! stamp. Retrying the same state change yields the same key and the same
//! payload, so the broker stores it once.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::bus::{BusError, Result};
use crate::events::{DomainEvent, EventKind};
use crate::ontology::{Entity, EntityStatus, FieldChange};
use crate::publish::{EventPublisher, OutboundMessage, PublishReceipt};
use crate::subjects::{validate_token, SubjectSpace, SUFFIX_BROADCAST};

/// Deduplication key for one entity state change.
pub fn entity_dedup_key(entity: &Entity, kind: EventKind) -> String {
    format!("{}-{}-{}", entity.entity_id, kind, entity.version_stamp())
}

/// Event id derived from a deduplication key.
pub fn event_id(dedup_key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, dedup_key.as_bytes()).to_string()
}

/// Publishes entity, telemetry, command and alert events.
#[derive(Clone)]
pub struct EntityEventProducer {
    publisher: Arc<dyn EventPublisher>,
    subjects: SubjectSpace,
    source: String,
}

impl EntityEventProducer {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        subjects: SubjectSpace,
        source: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            subjects,
            source: source.into(),
        }
    }

    pub fn subjects(&self) -> &SubjectSpace {
        &self.subjects
    }

    /// Build the message for an entity event without publishing it.
    ///
    /// Only the four entity lifecycle kinds are accepted.
    pub fn prepare(&self, entity: &Entity, kind: EventKind) -> Result<OutboundMessage> {
        let (event, key) = self.entity_event(entity, kind)?;
        OutboundMessage::from_event(&event, key)
    }

    fn entity_event(&self, entity: &Entity, kind: EventKind) -> Result<(DomainEvent, String)> {
        let subject = match kind {
            EventKind::Created => self.subjects.entity_created(&entity.org_id)?,
            EventKind::Updated => self.subjects.entity_updated(&entity.org_id)?,
            EventKind::Deleted => self.subjects.entity_deleted(&entity.org_id)?,
            EventKind::StatusChanged => self.subjects.entity_status(&entity.org_id)?,
            other => {
                return Err(BusError::Publish {
                    subject: entity.entity_id.clone(),
                    message: format!("'{}' is not an entity lifecycle event", other),
                })
            }
        };

        let key = entity_dedup_key(entity, kind);
        let mut event = DomainEvent::new(kind, subject, self.source.as_str())
            .with_id(event_id(&key))
            .with_timestamp(entity.updated_at)
            .with_data("entity_id", entity.entity_id.as_str())
            .with_data("org_id", entity.org_id.as_str())
            .with_data("entity_type", entity.entity_type.as_str())
            .with_data("status", entity.status.as_str())
            .with_data("priority", entity.priority.as_str());

        if kind.carries_snapshot() {
            event = event.with_data("entity", serde_json::to_value(entity)?);
        }
        Ok((event, key))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishReceipt> {
        let receipt = self.publisher.publish_message(&message).await?;
        debug!(
            subject = %message.subject,
            msg_id = %message.dedup_key,
            sequence = receipt.sequence,
            duplicate = receipt.duplicate,
            "Event published"
        );
        Ok(receipt)
    }

    pub async fn entity_created(&self, entity: &Entity) -> Result<PublishReceipt> {
        self.publish(self.prepare(entity, EventKind::Created)?).await
    }

    /// Publish `updated`, plus `status_changed` when the changes include a status.
    pub async fn entity_updated(
        &self,
        entity: &Entity,
        changes: &[FieldChange],
    ) -> Result<Vec<PublishReceipt>> {
        let mut receipts = vec![self.publish(self.prepare(entity, EventKind::Updated)?).await?];
        if changes.iter().any(|c| matches!(c, FieldChange::Status(_))) {
            receipts.push(self.entity_status_changed(entity, None).await?);
        }
        Ok(receipts)
    }

    pub async fn entity_deleted(&self, entity: &Entity) -> Result<PublishReceipt> {
        self.publish(self.prepare(entity, EventKind::Deleted)?).await
    }

    /// Publish `status_changed`, recording the previous status when known.
    pub async fn entity_status_changed(
        &self,
        entity: &Entity,
        previous: Option<EntityStatus>,
    ) -> Result<PublishReceipt> {
        let (mut event, key) = self.entity_event(entity, EventKind::StatusChanged)?;
        if let Some(previous) = previous {
            event = event.with_metadata("previous_status", previous.as_str());
        }
        self.publish(OutboundMessage::from_event(&event, key)?).await
    }

    /// Publish a telemetry reading for one entity.
    ///
    /// `sample_id` identifies the reading; resending it is deduplicated.
    pub async fn telemetry(
        &self,
        org_id: &str,
        entity_id: &str,
        reading: Value,
        sample_id: &str,
    ) -> Result<PublishReceipt> {
        validate_token("sample_id", sample_id)?;
        let subject = self.subjects.telemetry(org_id, entity_id)?;
        let key = format!("{}-{}-{}", entity_id, EventKind::Telemetry, sample_id);
        let event = DomainEvent::new(EventKind::Telemetry, subject, self.source.as_str())
            .with_id(event_id(&key))
            .with_data("entity_id", entity_id)
            .with_data("org_id", org_id)
            .with_data("reading", reading);
        self.publish(OutboundMessage::from_event(&event, key)?).await
    }

    /// Publish a command to one entity, or to every entity of the
    /// organization when `target` is `None`.
    pub async fn command(
        &self,
        org_id: &str,
        target: Option<&str>,
        body: Value,
        command_id: &str,
    ) -> Result<PublishReceipt> {
        validate_token("command_id", command_id)?;
        let subject = match target {
            Some(entity_id) => self.subjects.command(org_id, entity_id)?,
            None => self.subjects.command_broadcast(org_id)?,
        };
        let key = match target {
            Some(entity_id) => format!("{}-{}-{}", entity_id, EventKind::Command, command_id),
            None => format!(
                "{}-{}-{}-{}",
                org_id,
                SUFFIX_BROADCAST,
                EventKind::Command,
                command_id
            ),
        };
        let mut event = DomainEvent::new(EventKind::Command, subject, self.source.as_str())
            .with_id(event_id(&key))
            .with_data("org_id", org_id)
            .with_data("command", body);
        if let Some(entity_id) = target {
            event = event.with_data("entity_id", entity_id);
        }
        self.publish(OutboundMessage::from_event(&event, key)?).await
    }

    /// Publish an organization-wide alert on the events stream.
    pub async fn alert(
        &self,
        org_id: &str,
        alert_id: &str,
        entity_id: Option<&str>,
        details: Map<String, Value>,
    ) -> Result<PublishReceipt> {
        validate_token("alert_id", alert_id)?;
        let subject = self.subjects.event(org_id, EventKind::Alert.as_str())?;
        let key = format!("{}-{}-{}", org_id, EventKind::Alert, alert_id);
        let mut event = DomainEvent::new(EventKind::Alert, subject, self.source.as_str())
            .with_id(event_id(&key));
        event.data.extend(details);
        event = event.with_data("org_id", org_id);
        match entity_id {
            Some(entity_id) => event = event.with_data("entity_id", entity_id),
            None => {
                event.data.remove("entity_id");
            }
        }
        self.publish(OutboundMessage::from_event(&event, key)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::{EntityType, EntityUpdate};
    use crate::publish::MockPublisher;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn entity() -> Entity {
        let mut entity = Entity::new("ent1", "org1", EntityType::Drone);
        entity.updated_at = Utc.timestamp_nanos(100);
        entity
    }

    fn producer(publisher: &Arc<MockPublisher>) -> EntityEventProducer {
        EntityEventProducer::new(publisher.clone(), SubjectSpace::default(), "entity-service")
    }

    fn decode(payload: &[u8]) -> DomainEvent {
        DomainEvent::from_json(payload).unwrap()
    }

    #[test]
    fn test_dedup_key_uses_version_stamp() {
        assert_eq!(
            entity_dedup_key(&entity(), EventKind::Created),
            "ent1-created-100"
        );
        assert_eq!(event_id("ent1-created-100"), event_id("ent1-created-100"));
        assert_ne!(event_id("ent1-created-100"), event_id("ent1-created-101"));
    }

    #[test]
    fn test_prepare_created_carries_snapshot() {
        let publisher = Arc::new(MockPublisher::new());
        let message = producer(&publisher)
            .prepare(&entity(), EventKind::Created)
            .unwrap();

        assert_eq!(message.subject, "entities.org1.created");
        assert_eq!(message.dedup_key, "ent1-created-100");

        let event = decode(&message.payload);
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.id, event_id("ent1-created-100"));
        assert_eq!(event.data_str("entity_type"), Some("drone"));
        assert_eq!(event.data_str("status"), Some("unknown"));
        assert_eq!(event.data_str("priority"), Some("normal"));
        assert_eq!(event.data["entity"]["entity_id"], "ent1");
    }

    #[test]
    fn test_prepare_is_stable_across_retries() {
        let publisher = Arc::new(MockPublisher::new());
        let producer = producer(&publisher);
        let first = producer.prepare(&entity(), EventKind::Updated).unwrap();
        let second = producer.prepare(&entity(), EventKind::Updated).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_deleted_has_no_snapshot() {
        let publisher = Arc::new(MockPublisher::new());
        let message = producer(&publisher)
            .prepare(&entity(), EventKind::Deleted)
            .unwrap();
        assert_eq!(message.subject, "entities.org1.deleted");
        assert!(!decode(&message.payload).data.contains_key("entity"));
    }

    #[test]
    fn test_prepare_rejects_non_entity_kinds() {
        let publisher = Arc::new(MockPublisher::new());
        assert!(producer(&publisher)
            .prepare(&entity(), EventKind::Alert)
            .is_err());
    }

    #[test]
    fn test_invalid_org_rejected() {
        let publisher = Arc::new(MockPublisher::new());
        let mut entity = entity();
        entity.org_id = "org.1".to_string();
        assert!(matches!(
            producer(&publisher).prepare(&entity, EventKind::Created),
            Err(BusError::Subject(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_is_deduplicated() {
        let publisher = Arc::new(MockPublisher::new());
        let producer = producer(&publisher);

        let first = producer.entity_created(&entity()).await.unwrap();
        let second = producer.entity_created(&entity()).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(publisher.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_status_update_emits_status_changed() {
        let publisher = Arc::new(MockPublisher::new());
        let producer = producer(&publisher);
        let mut entity = entity();
        let changes = EntityUpdate::status(EntityStatus::Active)
            .apply(&mut entity, Utc.timestamp_nanos(200))
            .unwrap();

        let receipts = producer.entity_updated(&entity, &changes).await.unwrap();
        assert_eq!(receipts.len(), 2);

        let published = publisher.published().await;
        assert_eq!(published[0].subject, "entities.org1.updated");
        assert_eq!(published[1].subject, "entities.org1.status");
        assert_eq!(published[1].dedup_key, "ent1-status_changed-200");
        assert_eq!(decode(&published[1].payload).data_str("status"), Some("active"));
    }

    #[tokio::test]
    async fn test_non_status_update_emits_one_event() {
        let publisher = Arc::new(MockPublisher::new());
        let receipts = producer(&publisher)
            .entity_updated(&entity(), &[FieldChange::Heading(90.0)])
            .await
            .unwrap();
        assert_eq!(receipts.len(), 1);
    }

    #[tokio::test]
    async fn test_status_changed_records_previous() {
        let publisher = Arc::new(MockPublisher::new());
        producer(&publisher)
            .entity_status_changed(&entity(), Some(EntityStatus::Offline))
            .await
            .unwrap();

        let event = decode(&publisher.published().await[0].payload);
        assert_eq!(event.metadata.unwrap()["previous_status"], "offline");
    }

    #[tokio::test]
    async fn test_telemetry_and_commands() {
        let publisher = Arc::new(MockPublisher::new());
        let producer = producer(&publisher);

        producer
            .telemetry("org1", "ent1", json!({"battery": 0.8}), "s1")
            .await
            .unwrap();
        producer
            .command("org1", Some("ent1"), json!({"action": "rtb"}), "c1")
            .await
            .unwrap();
        producer
            .command("org1", None, json!({"action": "hold"}), "c2")
            .await
            .unwrap();

        let published = publisher.published().await;
        assert_eq!(published[0].subject, "telemetry.org1.ent1");
        assert_eq!(published[0].dedup_key, "ent1-telemetry-s1");
        assert_eq!(published[1].subject, "commands.org1.ent1");
        assert_eq!(published[2].subject, "commands.org1.broadcast");
        assert_eq!(published[2].dedup_key, "org1-broadcast-command-c2");
        assert_eq!(decode(&published[2].payload).data["command"]["action"], "hold");
    }

    #[tokio::test]
    async fn test_alert() {
        let publisher = Arc::new(MockPublisher::new());
        let mut details = Map::new();
        details.insert("severity".to_string(), json!("high"));

        producer(&publisher)
            .alert("org1", "a1", Some("ent1"), details)
            .await
            .unwrap();

        let published = publisher.published().await;
        assert_eq!(published[0].subject, "events.org1.alert");
        let event = decode(&published[0].payload);
        assert_eq!(event.kind, EventKind::Alert);
        assert_eq!(event.data_str("severity"), Some("high"));
    }

    #[tokio::test]
    async fn test_alert_details_cannot_override_identity() {
        let publisher = Arc::new(MockPublisher::new());
        let mut details = Map::new();
        details.insert("org_id".to_string(), json!("org2"));
        details.insert("entity_id".to_string(), json!("ent9"));
        details.insert("severity".to_string(), json!("low"));

        let producer = producer(&publisher);
        producer
            .alert("org1", "a1", Some("ent1"), details.clone())
            .await
            .unwrap();
        producer.alert("org1", "a2", None, details).await.unwrap();

        let published = publisher.published().await;
        let targeted = decode(&published[0].payload);
        assert_eq!(targeted.data_str("org_id"), Some("org1"));
        assert_eq!(targeted.data_str("entity_id"), Some("ent1"));
        assert_eq!(targeted.data_str("severity"), Some("low"));

        let untargeted = decode(&published[1].payload);
        assert_eq!(untargeted.data_str("org_id"), Some("org1"));
        assert_eq!(untargeted.data_str("entity_id"), None);
    }

    #[tokio::test]
    async fn test_publish_errors_propagate() {
        let publisher = Arc::new(MockPublisher::new());
        publisher.set_fail_on_publish(true).await;
        assert!(producer(&publisher).entity_deleted(&entity()).await.is_err());
    }
}
