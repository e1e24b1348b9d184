//! Pull-based message bus.
//!
//! This module contains:
//! - `BusError` / `FetchError`: failures of bus operations
//! - `PullBus` / `PullSource`: binding a durable consumer and fetching batches
//! - `Delivery`: one fetched message and its acknowledgment
//! - `MessageHandler`: per-message processing invoked by workers
//! - Implementations: NATS JetStream, Mock

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::consumers::ConsumerDefinition;
use crate::subjects::SubjectError;

pub mod mock;
pub mod nats;

pub use mock::{MockBus, MockMessage, MockStep};
pub use nats::{JetStreamBus, JetStreamDelivery, JetStreamSource};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish to '{subject}' failed: {message}")]
    Publish { subject: String, message: String },

    #[error("Stream for '{subject}' is full: {message}")]
    Overflow { subject: String, message: String },

    #[error("Message on '{subject}' exceeds the stream's size limit: {message}")]
    MessageTooLarge { subject: String, message: String },

    #[error("No stream accepts subject '{0}'")]
    NoStream(String),

    #[error("Publish to '{0}' timed out waiting for acknowledgment")]
    Timeout(String),

    #[error("Deduplication key must not be empty")]
    EmptyDedupKey,

    #[error("Stream '{name}' declaration failed: {message}")]
    Stream { name: String, message: String },

    #[error("Consumer '{name}' on stream '{stream}' failed: {message}")]
    Consumer {
        stream: String,
        name: String,
        message: String,
    },

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgment failed: {0}")]
    Ack(String),

    #[error("Publish queue is full")]
    QueueFull,

    #[error("Publish queue is closed")]
    QueueClosed,

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Subject(#[from] SubjectError),
}

/// Why a fetch returned no messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The wait elapsed with nothing to deliver. Normal when idle.
    #[error("Fetch timed out")]
    Timeout,

    /// The client is disconnected and reconnecting.
    #[error("Fetch failed while disconnected: {0}")]
    Transient(String),

    /// The broker answered, but rejected the request.
    #[error("Broker rejected fetch: {0}")]
    Broker(String),
}

/// A message fetched from a durable consumer.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// Delivery attempt, starting at 1, when the bus reports it.
    fn delivery_attempt(&self) -> Option<u64>;

    /// Acknowledge successful processing.
    async fn ack(&self) -> Result<()>;

    /// Negatively acknowledge; the bus redelivers until max deliveries.
    async fn nak(&self) -> Result<()>;
}

/// A bound durable consumer.
#[async_trait]
pub trait PullSource: Send + Sync {
    type Message: Delivery + 'static;

    /// Fetch up to `max_messages`, waiting at most about `max_wait`.
    async fn fetch(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> std::result::Result<Vec<Self::Message>, FetchError>;

    /// Stop fetching and flush in-flight acknowledgments.
    async fn drain(&mut self) -> Result<()>;
}

/// Interface for binding workers to durable consumers.
///
/// Implementations:
/// - `JetStreamBus`: NATS JetStream pull consumers
/// - `MockBus`: scripted in-memory bus for testing
#[async_trait]
pub trait PullBus: Send + Sync {
    type Source: PullSource + 'static;

    /// Provision the consumer if needed and bind a source to it.
    async fn bind(&self, consumer: &ConsumerDefinition) -> Result<Self::Source>;
}

/// Owned copy of a delivery handed to handlers.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub subject: String,
    pub payload: Bytes,
    pub delivery_attempt: Option<u64>,
}

impl InboundMessage {
    pub fn from_delivery(delivery: &dyn Delivery) -> Self {
        Self {
            subject: delivery.subject().to_string(),
            payload: Bytes::copy_from_slice(delivery.payload()),
            delivery_attempt: delivery.delivery_attempt(),
        }
    }
}

/// Handler failures, deciding the acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The payload can never be processed. Acknowledged so it is not redelivered.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Processing failed; negatively acknowledged for redelivery.
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Handler for processing messages from the bus.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: InboundMessage)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_error_display() {
        let err = BusError::Overflow {
            subject: "commands.org1.ent1".into(),
            message: "maximum messages exceeded".into(),
        };
        assert_eq!(
            err.to_string(),
            "Stream for 'commands.org1.ent1' is full: maximum messages exceeded"
        );
        assert_eq!(
            BusError::NoStream("x.y".into()).to_string(),
            "No stream accepts subject 'x.y'"
        );
    }

    #[test]
    fn test_subject_error_converts() {
        let err: BusError = SubjectError::EmptyToken { field: "org_id" }.into();
        assert!(matches!(err, BusError::Subject(_)));
    }
}
