//! Deduplicated publishing.
//!
//! Every publish carries a deduplication key in the `Nats-Msg-Id` header.
//! The broker stores one message per key within the stream's duplicate
//! window; a repeat is acknowledged with `duplicate = true`.

mod mock;
mod queue;

pub use mock::{MockPublisher, PublishedMessage};
pub use queue::{PublishQueue, PublishTicket};

use async_nats::jetstream::{self, context::PublishErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::bus::{BusError, Result};
use crate::events::DomainEvent;

/// Header carrying the deduplication key.
pub const DEDUP_HEADER: &str = "Nats-Msg-Id";

/// Broker acknowledgment of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub stream: String,
    pub sequence: u64,
    /// The key was seen within the window; nothing new was stored.
    pub duplicate: bool,
}

/// A message ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
    pub dedup_key: String,
}

impl OutboundMessage {
    /// Encode an event for its own subject.
    pub fn from_event(event: &DomainEvent, dedup_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            subject: event.subject.clone(),
            payload: Bytes::from(event.to_json()?),
            dedup_key: dedup_key.into(),
        })
    }
}

/// Interface for publishing to durable streams.
///
/// Implementations:
/// - `JetStreamPublisher`: NATS JetStream
/// - `MockPublisher`: in-memory mock with deduplication for testing
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish and wait for the broker to store the message.
    ///
    /// Not retried internally; callers reuse the same key when they retry.
    async fn publish_deduped(
        &self,
        subject: &str,
        payload: Bytes,
        dedup_key: &str,
    ) -> Result<PublishReceipt>;

    async fn publish_message(&self, message: &OutboundMessage) -> Result<PublishReceipt> {
        self.publish_deduped(&message.subject, message.payload.clone(), &message.dedup_key)
            .await
    }
}

/// JetStream implementation of [`EventPublisher`].
#[derive(Clone)]
pub struct JetStreamPublisher {
    jetstream: jetstream::Context,
}

impl JetStreamPublisher {
    pub fn new(jetstream: jetstream::Context) -> Self {
        Self { jetstream }
    }
}

#[async_trait]
impl EventPublisher for JetStreamPublisher {
    async fn publish_deduped(
        &self,
        subject: &str,
        payload: Bytes,
        dedup_key: &str,
    ) -> Result<PublishReceipt> {
        if dedup_key.is_empty() {
            return Err(BusError::EmptyDedupKey);
        }

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(DEDUP_HEADER, dedup_key);

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| classify_publish_error(subject, e.kind(), &e.to_string()))?
            .await
            .map_err(|e| classify_publish_error(subject, e.kind(), &e.to_string()))?;

        debug!(
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            msg_id = %dedup_key,
            "Published message"
        );

        Ok(PublishReceipt {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }
}

fn classify_publish_error(subject: &str, kind: PublishErrorKind, description: &str) -> BusError {
    match kind {
        PublishErrorKind::TimedOut => BusError::Timeout(subject.to_string()),
        PublishErrorKind::StreamNotFound => BusError::NoStream(subject.to_string()),
        _ => classify_rejection(subject, description),
    }
}

/// Map a broker rejection to an error by its description.
///
/// JetStream reports limit violations only as text, e.g. `maximum messages
/// exceeded` or `message size exceeds maximum allowed`.
pub fn classify_rejection(subject: &str, description: &str) -> BusError {
    let lower = description.to_ascii_lowercase();
    let subject = subject.to_string();
    let message = description.to_string();

    if lower.contains("maximum messages") || lower.contains("maximum bytes") {
        BusError::Overflow { subject, message }
    } else if lower.contains("exceeds maximum") {
        BusError::MessageTooLarge { subject, message }
    } else if lower.contains("no stream") || lower.contains("no responders") {
        BusError::NoStream(subject)
    } else {
        BusError::Publish { subject, message }
    }
}
