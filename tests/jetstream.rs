//! JetStream integration tests using testcontainers.
//!
//! Run with: cargo test --test jetstream -- --ignored --nocapture
//!
//! These tests spin up NATS with JetStream in a container using testcontainers-rs.

mod common;

use std::time::Duration;

use bytes::Bytes;
use constellation::bus::{BusError, FetchError, JetStreamBus, PullBus, PullSource};
use constellation::config::{ConsumerSettings, StreamsConfig};
use constellation::consumers::{ConsumerDefinition, ConsumerManager, EnsureOutcome};
use constellation::publish::{EventPublisher, JetStreamPublisher};
use constellation::streams::{DeclareOutcome, StreamCatalog, StreamDefinition, StreamRegistry};
use constellation::subjects::{Domain, SubjectSpace};

use common::{attach, start_nats, stored_messages};

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_broker_attach_health() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;

    assert!(!broker.is_embedded());
    assert_eq!(broker.process_health().await, None);
    broker.health_check().await.expect("Broker should be healthy");

    broker.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_shutdown_closes_connection_for_every_handle() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;
    StreamRegistry::new(broker.jetstream().clone())
        .declare_all(&StreamCatalog::from_config(&StreamsConfig::default()))
        .await
        .unwrap();

    let publisher = JetStreamPublisher::new(broker.jetstream().clone());
    publisher
        .publish_deduped("entities.org1.created", Bytes::from_static(b"{}"), "k1")
        .await
        .unwrap();

    broker.shutdown().await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        publisher.publish_deduped("entities.org1.created", Bytes::from_static(b"{}"), "k2"),
    )
    .await
    .expect("publish on a closed connection should fail, not hang");
    assert!(result.is_err());
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_declare_is_idempotent() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;
    let registry = StreamRegistry::new(broker.jetstream().clone());
    let catalog = StreamCatalog::from_config(&StreamsConfig::default());

    let first = registry.declare_all(&catalog).await.unwrap();
    assert!(first
        .iter()
        .all(|(_, outcome)| *outcome == DeclareOutcome::Created));

    let second = registry.declare_all(&catalog).await.unwrap();
    assert!(second
        .iter()
        .all(|(_, outcome)| *outcome == DeclareOutcome::Unchanged));

    let widened = StreamDefinition {
        max_messages: 200_000,
        ..catalog.get(Domain::Entities).unwrap().clone()
    };
    assert_eq!(
        registry.declare(&widened).await.unwrap(),
        DeclareOutcome::Updated
    );
    assert_eq!(
        registry.declare(&widened).await.unwrap(),
        DeclareOutcome::Unchanged
    );
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_declare_reports_lookup_failure() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;
    let registry = StreamRegistry::new(broker.jetstream().clone());

    let invalid = StreamDefinition {
        name: "CONSTELLATION.ENTITIES".to_string(),
        ..StreamDefinition::canonical(Domain::Entities, &SubjectSpace::default())
    };
    match registry.declare(&invalid).await {
        Err(BusError::Stream { message, .. }) => {
            assert!(message.starts_with("Stream lookup failed"), "{}", message)
        }
        other => panic!("expected lookup failure, got {:?}", other),
    }
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_duplicate_key_stores_one_message() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;
    let catalog = StreamCatalog::from_config(&StreamsConfig::default());
    StreamRegistry::new(broker.jetstream().clone())
        .declare_all(&catalog)
        .await
        .unwrap();

    let publisher = JetStreamPublisher::new(broker.jetstream().clone());
    let payload = Bytes::from_static(br#"{"id":"e1"}"#);

    let first = publisher
        .publish_deduped("entities.org1.created", payload.clone(), "ent1-created-100")
        .await
        .unwrap();
    let second = publisher
        .publish_deduped("entities.org1.created", payload, "ent1-created-100")
        .await
        .unwrap();

    assert_eq!(first.stream, "CONSTELLATION_ENTITIES");
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.sequence, second.sequence);
    assert_eq!(
        stored_messages(broker.jetstream(), "CONSTELLATION_ENTITIES").await,
        1
    );
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_discard_new_rejects_overflow() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;
    let subjects = SubjectSpace::default();
    let commands = StreamDefinition {
        max_messages: 10,
        ..StreamDefinition::canonical(Domain::Commands, &subjects)
    };
    StreamRegistry::new(broker.jetstream().clone())
        .declare(&commands)
        .await
        .unwrap();

    let publisher = JetStreamPublisher::new(broker.jetstream().clone());
    for i in 0..10 {
        publisher
            .publish_deduped(
                "commands.org1.ent1",
                Bytes::from(format!(r#"{{"n":{}}}"#, i)),
                &format!("cmd-{}", i),
            )
            .await
            .unwrap();
    }

    let result = publisher
        .publish_deduped(
            "commands.org1.ent1",
            Bytes::from_static(br#"{"n":10}"#),
            "cmd-10",
        )
        .await;
    assert!(
        matches!(result, Err(BusError::Overflow { .. })),
        "expected overflow, got {:?}",
        result
    );
    assert_eq!(
        stored_messages(broker.jetstream(), "CONSTELLATION_COMMANDS").await,
        10
    );
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_publish_without_stream() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;
    let publisher = JetStreamPublisher::new(broker.jetstream().clone());

    let result = publisher
        .publish_deduped("nowhere.org1.created", Bytes::from_static(b"{}"), "k1")
        .await;
    assert!(matches!(result, Err(BusError::NoStream(_))));

    let result = publisher
        .publish_deduped("nowhere.org1.created", Bytes::from_static(b"{}"), "")
        .await;
    assert!(matches!(result, Err(BusError::EmptyDedupKey)));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_consumer_reused_by_name() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;
    let catalog = StreamCatalog::from_config(&StreamsConfig::default());
    StreamRegistry::new(broker.jetstream().clone())
        .declare_all(&catalog)
        .await
        .unwrap();

    let manager = ConsumerManager::new(broker.jetstream().clone());
    let definition = ConsumerDefinition::for_domain(
        Domain::Entities,
        catalog.subjects(),
        &ConsumerSettings::default(),
    );

    assert_eq!(
        manager.ensure(&definition).await.unwrap(),
        EnsureOutcome::Created
    );
    assert_eq!(
        manager.ensure(&definition).await.unwrap(),
        EnsureOutcome::Existing
    );
    assert_eq!(
        manager
            .ensure_consumer("CONSTELLATION_ENTITIES", "entity-processor", "entities.>")
            .await
            .unwrap(),
        EnsureOutcome::Existing
    );
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_idle_fetch_times_out() {
    let (_container, url) = start_nats().await;
    let broker = attach(&url).await;
    let catalog = StreamCatalog::from_config(&StreamsConfig::default());
    StreamRegistry::new(broker.jetstream().clone())
        .declare_all(&catalog)
        .await
        .unwrap();

    let bus = JetStreamBus::new(broker.client().clone(), broker.jetstream().clone());
    let definition = ConsumerDefinition::for_domain(
        Domain::Telemetry,
        catalog.subjects(),
        &ConsumerSettings::default(),
    );
    let mut source = bus.bind(&definition).await.unwrap();

    let result = source.fetch(10, Duration::from_millis(200)).await;
    assert_eq!(result.err(), Some(FetchError::Timeout));

    source.drain().await.unwrap();
}
