//! Pull workers.
//!
//! A worker binds one durable consumer and loops: fetch a small batch, hand
//! each message to its handler, then acknowledge. Handler success and
//! malformed payloads are acknowledged; failures and panics are negatively
//! acknowledged so the broker redelivers them. A handler still running when
//! cancellation arrives is abandoned and its message left unacknowledged.
//!
//! Fetch errors never end the loop:
//! - timeouts and empty batches are the idle case and are not logged as errors
//! - errors while the client is disconnected are retried after the backoff
//!   delay at `warn`, the client reconnects on its own
//! - errors the broker returned are retried after the same backoff at `error`
//!
//! The backoff resets after every successful fetch.

mod handlers;
mod pool;

pub use handlers::{EnvelopeHandler, JsonPayloadHandler, WorkerSinks};
pub use pool::{WorkerPool, WorkerReport};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{
    BusError, Delivery, FetchError, HandlerError, InboundMessage, MessageHandler, PullBus,
    PullSource,
};
use crate::config::WorkerConfig;
use crate::consumers::ConsumerDefinition;
use crate::utils::retry::fetch_backoff;

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// Why a worker's loop ended.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Normal shutdown.
    #[error("Worker cancelled")]
    Cancelled,

    #[error("Worker {0} was already started")]
    AlreadyStarted(String),

    #[error("Worker {worker} could not bind its consumer: {source}")]
    Bind {
        worker: String,
        #[source]
        source: BusError,
    },
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Acked,
    Rejected,
    AckFailed,
}

/// A pull worker bound to one durable consumer.
pub struct Worker<B: PullBus> {
    name: String,
    consumer: ConsumerDefinition,
    bus: Arc<B>,
    handler: Arc<dyn MessageHandler>,
    settings: WorkerConfig,
    state: watch::Sender<WorkerState>,
    source: Option<B::Source>,
}

impl<B: PullBus> Worker<B> {
    pub fn new(
        name: impl Into<String>,
        consumer: ConsumerDefinition,
        bus: Arc<B>,
        handler: Arc<dyn MessageHandler>,
        settings: WorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Created);
        Self {
            name: name.into(),
            consumer,
            bus,
            handler,
            settings,
            state,
            source: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer(&self) -> &ConsumerDefinition {
        &self.consumer
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Bind the consumer and run until `cancel` flips to `true`.
    ///
    /// Returns `WorkerError::Cancelled` on normal shutdown.
    pub async fn start(&mut self, mut cancel: watch::Receiver<bool>) -> Result<(), WorkerError> {
        if self.state() != WorkerState::Created {
            return Err(WorkerError::AlreadyStarted(self.name.clone()));
        }

        let mut source = match self.bus.bind(&self.consumer).await {
            Ok(source) => source,
            Err(e) => {
                self.state.send_replace(WorkerState::Stopped);
                return Err(WorkerError::Bind {
                    worker: self.name.clone(),
                    source: e,
                });
            }
        };

        self.state.send_replace(WorkerState::Running);
        info!(
            worker = %self.name,
            stream = %self.consumer.stream,
            consumer = %self.consumer.durable_name,
            filter = %self.consumer.filter_subject,
            "Worker started"
        );

        let result = self.run(&mut source, &mut cancel).await;
        self.source = Some(source);
        self.state.send_replace(WorkerState::Stopped);
        info!(worker = %self.name, "Worker stopped");
        result
    }

    /// Drain the consumer binding. Safe to call on a worker that never ran.
    pub async fn stop(&mut self) -> Result<(), BusError> {
        match self.source.take() {
            Some(mut source) => source.drain().await,
            None => Ok(()),
        }
    }

    fn cancelled(&self, cancel: &watch::Receiver<bool>) -> bool {
        // A dropped sender can never resume the worker.
        if *cancel.borrow() || cancel.has_changed().is_err() {
            self.state.send_replace(WorkerState::Stopping);
            true
        } else {
            false
        }
    }

    async fn run(
        &self,
        source: &mut B::Source,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let backoff = fetch_backoff(self.settings.backoff_min(), self.settings.backoff_max());
        let mut delays = backoff.build();
        let fetch_wait = self.settings.fetch_wait();

        loop {
            if self.cancelled(cancel) {
                return Err(WorkerError::Cancelled);
            }

            let batch = match source.fetch(self.settings.batch_size, fetch_wait).await {
                Ok(batch) => {
                    delays = backoff.build();
                    batch
                }
                Err(FetchError::Timeout) => {
                    trace!(worker = %self.name, "No messages");
                    continue;
                }
                Err(e) => {
                    let delay = delays.next().unwrap_or(self.settings.backoff_max());
                    match &e {
                        FetchError::Transient(_) => warn!(
                            worker = %self.name,
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            "Fetch failed while disconnected, retrying"
                        ),
                        _ => error!(
                            worker = %self.name,
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            "Fetch failed, retrying after backoff"
                        ),
                    }
                    self.pause(delay, cancel).await;
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            let fetched = batch.len();
            let (mut acked, mut rejected, mut ack_failed) = (0usize, 0usize, 0usize);
            for message in &batch {
                // Unprocessed messages are left for redelivery after ack_wait.
                if self.cancelled(cancel) {
                    debug!(
                        worker = %self.name,
                        unprocessed = fetched - acked - rejected - ack_failed,
                        "Cancelled mid-batch"
                    );
                    return Err(WorkerError::Cancelled);
                }
                let disposition = tokio::select! {
                    biased;
                    disposition = self.process(message) => disposition,
                    _ = cancellation(cancel) => {
                        self.state.send_replace(WorkerState::Stopping);
                        warn!(
                            worker = %self.name,
                            subject = %message.subject(),
                            "Cancelled while handling message, left for redelivery"
                        );
                        return Err(WorkerError::Cancelled);
                    }
                };
                match disposition {
                    Disposition::Acked => acked += 1,
                    Disposition::Rejected => rejected += 1,
                    Disposition::AckFailed => ack_failed += 1,
                }
            }

            debug!(
                worker = %self.name,
                fetched,
                acked,
                rejected,
                ack_failed,
                "Batch processed"
            );
        }
    }

    /// Sleep for `delay`, waking early on cancellation.
    async fn pause(&self, delay: Duration, cancel: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => {}
        }
    }

    async fn process(&self, message: &<B::Source as PullSource>::Message) -> Disposition {
        let inbound = InboundMessage::from_delivery(message);
        let subject = inbound.subject.clone();
        let handler = Arc::clone(&self.handler);

        let outcome = AssertUnwindSafe(async move { handler.handle(inbound).await })
            .catch_unwind()
            .await;

        let acknowledge = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(HandlerError::Malformed(reason))) => {
                debug!(worker = %self.name, subject = %subject, reason = %reason, "Acknowledging malformed message");
                true
            }
            Ok(Err(e @ HandlerError::Failed(_))) => {
                error!(worker = %self.name, subject = %subject, error = %e, "Handler failed");
                false
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(worker = %self.name, subject = %subject, panic = %reason, "Handler panicked");
                false
            }
        };

        if acknowledge {
            match message.ack().await {
                Ok(()) => Disposition::Acked,
                Err(e) => {
                    error!(worker = %self.name, subject = %subject, error = %e, "Failed to ack message");
                    Disposition::AckFailed
                }
            }
        } else {
            if let Err(e) = message.nak().await {
                error!(worker = %self.name, subject = %subject, error = %e, "Failed to nak message");
            }
            Disposition::Rejected
        }
    }
}

/// Resolves once cancellation is requested or the sender is gone.
async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests;
