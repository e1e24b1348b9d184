//! NATS JetStream pull bus.
//!
//! Each worker binds a durable pull consumer and fetches small batches with
//! a bounded wait. Messages are acknowledged explicitly; a negative
//! acknowledgment asks the broker to redeliver.

use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream::{self, consumer::pull, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};

use super::{BusError, Delivery, FetchError, PullBus, PullSource, Result};
use crate::consumers::{ConsumerDefinition, ConsumerManager};

/// Extra time allowed beyond the fetch expiry before giving up locally.
const FETCH_GRACE: Duration = Duration::from_millis(500);

/// JetStream implementation of [`PullBus`].
#[derive(Clone)]
pub struct JetStreamBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    consumers: ConsumerManager,
}

impl JetStreamBus {
    pub fn new(client: async_nats::Client, jetstream: jetstream::Context) -> Self {
        let consumers = ConsumerManager::new(jetstream.clone());
        Self {
            client,
            jetstream,
            consumers,
        }
    }
}

#[async_trait]
impl PullBus for JetStreamBus {
    type Source = JetStreamSource;

    async fn bind(&self, definition: &ConsumerDefinition) -> Result<JetStreamSource> {
        self.consumers.ensure(definition).await?;

        let stream = self
            .jetstream
            .get_stream(&definition.stream)
            .await
            .map_err(|e| BusError::Subscribe(format!("Stream '{}' unavailable: {}", definition.stream, e)))?;

        let consumer = stream
            .get_consumer::<pull::Config>(&definition.durable_name)
            .await
            .map_err(|e| {
                BusError::Subscribe(format!(
                    "Consumer '{}' unavailable: {}",
                    definition.durable_name, e
                ))
            })?;

        debug!(
            stream = %definition.stream,
            consumer = %definition.durable_name,
            "Bound pull consumer"
        );

        Ok(JetStreamSource {
            client: self.client.clone(),
            consumer,
            consumer_name: definition.durable_name.clone(),
        })
    }
}

/// A bound JetStream pull consumer.
pub struct JetStreamSource {
    client: async_nats::Client,
    consumer: jetstream::consumer::PullConsumer,
    consumer_name: String,
}

impl JetStreamSource {
    fn classify(&self, message: String) -> FetchError {
        if self.client.connection_state() == State::Connected {
            FetchError::Broker(message)
        } else {
            FetchError::Transient(message)
        }
    }
}

#[async_trait]
impl PullSource for JetStreamSource {
    type Message = JetStreamDelivery;

    async fn fetch(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> std::result::Result<Vec<JetStreamDelivery>, FetchError> {
        let request = async {
            let mut batch = self
                .consumer
                .fetch()
                .max_messages(max_messages)
                .expires(max_wait)
                .messages()
                .await
                .map_err(|e| self.classify(e.to_string()))?;

            let mut messages = Vec::with_capacity(max_messages);
            while let Some(next) = batch.next().await {
                match next {
                    Ok(message) => messages.push(JetStreamDelivery { message }),
                    Err(e) if messages.is_empty() => return Err(self.classify(e.to_string())),
                    Err(e) => {
                        // Keep what arrived; the error resurfaces on the next fetch.
                        warn!(
                            consumer = %self.consumer_name,
                            error = %e,
                            received = messages.len(),
                            "Batch ended early"
                        );
                        break;
                    }
                }
            }
            Ok(messages)
        };

        match tokio::time::timeout(max_wait + FETCH_GRACE, request).await {
            Ok(Ok(messages)) if messages.is_empty() => Err(FetchError::Timeout),
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    async fn drain(&mut self) -> Result<()> {
        // Acks are published on the shared client; flushing delivers any
        // still buffered. The durable consumer itself stays on the broker.
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to flush acknowledgments: {}", e)))?;
        debug!(consumer = %self.consumer_name, "Drained pull consumer");
        Ok(())
    }
}

/// A message fetched from JetStream.
pub struct JetStreamDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for JetStreamDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_attempt(&self) -> Option<u64> {
        self.message.info().ok().map(|info| info.delivered as u64)
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
