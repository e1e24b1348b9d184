//! Durable pull consumer provisioning.
//!
//! Every worker binds to one durable consumer. Consumers are created once
//! and then reused by name across restarts; an existing consumer is never
//! reconfigured.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, ReplayPolicy},
};
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::bus::{BusError, Result};
use crate::config::ConsumerSettings;
use crate::subjects::{Domain, SubjectSpace};

/// Outcome of [`ConsumerManager::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Existing,
}

/// A durable, explicitly acknowledged pull consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub stream: String,
    pub durable_name: String,
    /// May narrow the stream's subjects.
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub max_ack_pending: i64,
}

impl ConsumerDefinition {
    pub fn new(
        stream: impl Into<String>,
        durable_name: impl Into<String>,
        filter_subject: impl Into<String>,
        settings: &ConsumerSettings,
    ) -> Self {
        Self {
            stream: stream.into(),
            durable_name: durable_name.into(),
            filter_subject: filter_subject.into(),
            ack_wait: settings.ack_wait(),
            max_deliver: settings.max_deliver,
            max_ack_pending: settings.max_ack_pending,
        }
    }

    /// The canonical consumer for a domain: its stream, durable name and
    /// catch-all filter.
    pub fn for_domain(domain: Domain, subjects: &SubjectSpace, settings: &ConsumerSettings) -> Self {
        Self::new(
            domain.stream_name(),
            domain.consumer_name(),
            subjects.wildcard(domain),
            settings,
        )
    }

    pub fn to_config(&self) -> pull::Config {
        pull::Config {
            durable_name: Some(self.durable_name.clone()),
            filter_subject: self.filter_subject.clone(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            max_ack_pending: self.max_ack_pending,
            deliver_policy: DeliverPolicy::All,
            replay_policy: ReplayPolicy::Instant,
            ..Default::default()
        }
    }
}

/// Creates durable consumers on demand.
#[derive(Clone)]
pub struct ConsumerManager {
    jetstream: jetstream::Context,
}

impl ConsumerManager {
    pub fn new(jetstream: jetstream::Context) -> Self {
        Self { jetstream }
    }

    /// Ensure the consumer exists, creating it when absent.
    pub async fn ensure(&self, definition: &ConsumerDefinition) -> Result<EnsureOutcome> {
        let stream = self
            .jetstream
            .get_stream(&definition.stream)
            .await
            .map_err(|e| consumer_error(definition, format!("Stream lookup failed: {}", e)))?;

        let names: Vec<String> = stream
            .consumer_names()
            .try_collect()
            .await
            .map_err(|e| consumer_error(definition, format!("Consumer lookup failed: {}", e)))?;

        if names.contains(&definition.durable_name) {
            debug!(
                stream = %definition.stream,
                consumer = %definition.durable_name,
                "Durable consumer already exists"
            );
            return Ok(EnsureOutcome::Existing);
        }

        stream
            .create_consumer(definition.to_config())
            .await
            .map_err(|e| consumer_error(definition, format!("Failed to create consumer: {}", e)))?;

        info!(
            stream = %definition.stream,
            consumer = %definition.durable_name,
            filter = %definition.filter_subject,
            "Created durable consumer"
        );
        Ok(EnsureOutcome::Created)
    }

    /// Ensure a consumer with default settings.
    pub async fn ensure_consumer(
        &self,
        stream: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<EnsureOutcome> {
        let definition = ConsumerDefinition::new(
            stream,
            durable_name,
            filter_subject,
            &ConsumerSettings::default(),
        );
        self.ensure(&definition).await
    }

    /// Ensure the canonical consumer of every domain.
    pub async fn ensure_all(
        &self,
        subjects: &SubjectSpace,
        settings: &ConsumerSettings,
    ) -> Result<Vec<(ConsumerDefinition, EnsureOutcome)>> {
        let mut outcomes = Vec::with_capacity(Domain::ALL.len());
        for domain in Domain::ALL {
            let definition = ConsumerDefinition::for_domain(domain, subjects, settings);
            let outcome = self.ensure(&definition).await?;
            outcomes.push((definition, outcome));
        }
        Ok(outcomes)
    }
}

fn consumer_error(definition: &ConsumerDefinition, message: String) -> BusError {
    BusError::Consumer {
        stream: definition.stream.clone(),
        name: definition.durable_name.clone(),
        message,
    }
}
