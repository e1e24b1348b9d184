//! Runtime context.
//!
//! Owns everything the event distribution core starts: the broker, the
//! declared streams, the publisher with its queue, and the worker pool.
//! Startup order is broker, streams, consumers, publisher, workers;
//! shutdown runs in reverse.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::bus::{BusError, JetStreamBus};
use crate::config::{Config, ConfigError};
use crate::consumers::ConsumerManager;
use crate::producer::EntityEventProducer;
use crate::publish::{EventPublisher, JetStreamPublisher, PublishQueue};
use crate::streams::{DeclareOutcome, StreamCatalog, StreamRegistry};
use crate::workers::{WorkerPool, WorkerReport, WorkerSinks, WorkerState};

/// Service name reported in health reports.
pub const SERVICE_NAME: &str = "constellation";

/// Errors that abort startup or shutdown.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Point-in-time health of the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    /// Seconds since startup.
    pub uptime: u64,
    pub timestamp: DateTime<Utc>,
    pub details: BTreeMap<String, String>,
}

impl HealthReport {
    /// Unhealthy when the broker check failed or any worker is not running.
    pub fn new(
        broker: Result<(), BrokerError>,
        workers: &[(String, WorkerState)],
        uptime: Duration,
    ) -> Self {
        let mut healthy = true;
        let mut details = BTreeMap::new();

        let broker = match broker {
            Ok(()) => "healthy".to_string(),
            Err(e) => {
                healthy = false;
                format!("unhealthy: {}", e)
            }
        };
        details.insert("broker".to_string(), broker);

        for (name, state) in workers {
            healthy &= *state == WorkerState::Running;
            details.insert(name.clone(), state.to_string());
        }

        Self {
            status: if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: uptime.as_secs(),
            timestamp: Utc::now(),
            details,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// The running event distribution core.
pub struct Runtime {
    broker: Broker,
    catalog: StreamCatalog,
    streams: Vec<(String, DeclareOutcome)>,
    publisher: Arc<JetStreamPublisher>,
    queue: PublishQueue,
    producer: EntityEventProducer,
    pool: WorkerPool<JetStreamBus>,
    started_at: Instant,
}

impl Runtime {
    /// Start the broker, declare streams and consumers, then start workers.
    ///
    /// Any failure after the broker is up stops the broker again.
    pub async fn start(config: &Config, sinks: WorkerSinks) -> Result<Self, RuntimeError> {
        config.validate()?;
        let broker = Broker::start(&config.broker).await?;

        match Self::provision(&broker, config).await {
            Ok((catalog, streams)) => {
                let publisher = Arc::new(JetStreamPublisher::new(broker.jetstream().clone()));
                let queue = PublishQueue::spawn(
                    publisher.clone() as Arc<dyn EventPublisher>,
                    config.publisher.queue_capacity,
                );
                let producer = EntityEventProducer::new(
                    publisher.clone(),
                    catalog.subjects().clone(),
                    config.publisher.source.as_str(),
                );

                let bus = Arc::new(JetStreamBus::new(
                    broker.client().clone(),
                    broker.jetstream().clone(),
                ));
                let mut pool = WorkerPool::for_domains(
                    bus,
                    catalog.subjects(),
                    &config.consumers,
                    &config.workers,
                    sinks,
                );
                pool.start();

                info!(url = %broker.url(), workers = pool.len(), "Runtime started");
                Ok(Self {
                    broker,
                    catalog,
                    streams,
                    publisher,
                    queue,
                    producer,
                    pool,
                    started_at: Instant::now(),
                })
            }
            Err(e) => {
                error!(error = %e, "Startup failed, stopping broker");
                if let Err(stop) = broker.shutdown().await {
                    warn!(error = %stop, "Failed to stop broker");
                }
                Err(e.into())
            }
        }
    }

    async fn provision(
        broker: &Broker,
        config: &Config,
    ) -> Result<(StreamCatalog, Vec<(String, DeclareOutcome)>), BusError> {
        let catalog = StreamCatalog::from_config(&config.streams);
        let streams = StreamRegistry::new(broker.jetstream().clone())
            .declare_all(&catalog)
            .await?;
        for (name, outcome) in &streams {
            info!(stream = %name, outcome = ?outcome, "Stream declared");
        }

        let consumers = ConsumerManager::new(broker.jetstream().clone())
            .ensure_all(catalog.subjects(), &config.consumers)
            .await?;
        for (definition, outcome) in &consumers {
            info!(
                stream = %definition.stream,
                consumer = %definition.durable_name,
                outcome = ?outcome,
                "Consumer ready"
            );
        }

        Ok((catalog, streams))
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn catalog(&self) -> &StreamCatalog {
        &self.catalog
    }

    /// Outcome of each stream declaration at startup.
    pub fn stream_outcomes(&self) -> &[(String, DeclareOutcome)] {
        &self.streams
    }

    /// Publisher awaiting broker storage for every message.
    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        self.publisher.clone()
    }

    /// Background queue in front of the publisher.
    pub fn publish_queue(&self) -> &PublishQueue {
        &self.queue
    }

    pub fn producer(&self) -> &EntityEventProducer {
        &self.producer
    }

    pub fn worker_states(&self) -> Vec<(String, WorkerState)> {
        self.pool.states()
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport::new(
            self.broker.health_check().await,
            &self.pool.states(),
            self.started_at.elapsed(),
        )
    }

    /// Stop workers, drain the publish queue, release every client handle
    /// the runtime holds, then close the connection and stop the broker.
    pub async fn shutdown(self) -> Result<Vec<WorkerReport>, RuntimeError> {
        let Self {
            broker,
            publisher,
            queue,
            producer,
            pool,
            ..
        } = self;

        info!("Shutting down runtime");
        let reports = pool.shutdown().await;
        queue.close().await;
        drop(queue);
        drop(producer);
        drop(publisher);

        broker.shutdown().await?;
        info!("Runtime stopped");
        Ok(reports)
    }
}
