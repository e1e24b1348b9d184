use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::handlers::{EnvelopeHandler, JsonPayloadHandler, WorkerSinks};
use super::{Worker, WorkerError, WorkerState};
use crate::bus::{MessageHandler, PullBus};
use crate::config::{ConsumerSettings, WorkerConfig};
use crate::consumers::ConsumerDefinition;
use crate::subjects::{Domain, SubjectSpace};

type WorkerTask<B> = JoinHandle<(Worker<B>, Result<(), WorkerError>)>;

/// Final state of one worker after shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: String,
    pub state: WorkerState,
    /// Set when the worker ended for any reason other than cancellation.
    pub error: Option<String>,
    pub drained: bool,
}

/// Runs one task per worker and stops them together.
pub struct WorkerPool<B: PullBus + 'static> {
    cancel: watch::Sender<bool>,
    states: Vec<(String, watch::Receiver<WorkerState>)>,
    idle: Vec<Worker<B>>,
    running: Vec<(String, WorkerTask<B>)>,
}

impl<B: PullBus + 'static> WorkerPool<B> {
    pub fn new(workers: Vec<Worker<B>>) -> Self {
        let (cancel, _) = watch::channel(false);
        let states = workers
            .iter()
            .map(|w| (w.name().to_string(), w.watch_state()))
            .collect();
        Self {
            cancel,
            states,
            idle: workers,
            running: Vec::new(),
        }
    }

    /// One worker per domain, bound to its canonical durable consumer.
    pub fn for_domains(
        bus: Arc<B>,
        subjects: &SubjectSpace,
        consumers: &ConsumerSettings,
        settings: &WorkerConfig,
        sinks: WorkerSinks,
    ) -> Self {
        let workers = Domain::ALL
            .into_iter()
            .map(|domain| {
                let name = domain.worker_name();
                let handler: Arc<dyn MessageHandler> = match domain {
                    Domain::Entities => Arc::new(EnvelopeHandler::new(name, sinks.entities.clone())),
                    Domain::Events => Arc::new(EnvelopeHandler::new(name, sinks.events.clone())),
                    Domain::Telemetry => {
                        Arc::new(JsonPayloadHandler::new(name, sinks.telemetry.clone()))
                    }
                    Domain::Commands => {
                        Arc::new(JsonPayloadHandler::new(name, sinks.commands.clone()))
                    }
                };
                Worker::new(
                    name,
                    ConsumerDefinition::for_domain(domain, subjects, consumers),
                    Arc::clone(&bus),
                    handler,
                    settings.clone(),
                )
            })
            .collect();
        Self::new(workers)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Spawn every worker not yet running.
    pub fn start(&mut self) {
        for mut worker in self.idle.drain(..) {
            let name = worker.name().to_string();
            let cancel = self.cancel.subscribe();
            let task = tokio::spawn(async move {
                let result = worker.start(cancel).await;
                match &result {
                    Ok(()) | Err(WorkerError::Cancelled) => {}
                    Err(e) => error!(worker = %worker.name(), error = %e, "Worker exited"),
                }
                (worker, result)
            });
            self.running.push((name, task));
        }
        info!(workers = self.running.len(), "Worker pool started");
    }

    /// Current state of every worker.
    pub fn states(&self) -> Vec<(String, WorkerState)> {
        self.states
            .iter()
            .map(|(name, state)| (name.clone(), *state.borrow()))
            .collect()
    }

    /// Cancel every worker, wait for them to stop, then drain their bindings.
    pub async fn shutdown(self) -> Vec<WorkerReport> {
        self.cancel.send_replace(true);

        let mut reports = Vec::with_capacity(self.states.len());
        for (name, task) in self.running {
            let report = match task.await {
                Ok((mut worker, result)) => {
                    let error = match result {
                        Ok(()) | Err(WorkerError::Cancelled) => None,
                        Err(e) => Some(e.to_string()),
                    };
                    let drained = match worker.stop().await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(worker = %name, error = %e, "Failed to drain worker");
                            false
                        }
                    };
                    WorkerReport {
                        worker: name,
                        state: worker.state(),
                        error,
                        drained,
                    }
                }
                Err(e) => {
                    error!(worker = %name, error = %e, "Worker task failed");
                    WorkerReport {
                        worker: name,
                        state: WorkerState::Stopped,
                        error: Some(e.to_string()),
                        drained: false,
                    }
                }
            };
            reports.push(report);
        }

        for worker in self.idle {
            reports.push(WorkerReport {
                worker: worker.name().to_string(),
                state: worker.state(),
                error: None,
                drained: true,
            });
        }

        info!(workers = reports.len(), "Worker pool stopped");
        reports
    }
}
