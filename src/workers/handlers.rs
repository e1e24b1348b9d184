//! Domain message handlers.

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{HandlerError, InboundMessage, MessageHandler};
use crate::events::DomainEvent;

/// Optional channels that receive decoded messages, per domain.
#[derive(Debug, Clone, Default)]
pub struct WorkerSinks {
    pub entities: Option<mpsc::Sender<DomainEvent>>,
    pub events: Option<mpsc::Sender<DomainEvent>>,
    pub telemetry: Option<mpsc::Sender<Value>>,
    pub commands: Option<mpsc::Sender<Value>>,
}

fn malformed(worker: &str, message: &InboundMessage, error: &dyn std::fmt::Display) -> HandlerError {
    warn!(
        worker = %worker,
        subject = %message.subject,
        raw = %String::from_utf8_lossy(&message.payload),
        error = %error,
        "Malformed payload"
    );
    HandlerError::Malformed(error.to_string())
}

/// Decodes [`DomainEvent`] envelopes (entities and events streams).
pub struct EnvelopeHandler {
    worker: String,
    sink: Option<mpsc::Sender<DomainEvent>>,
}

impl EnvelopeHandler {
    pub fn new(worker: impl Into<String>, sink: Option<mpsc::Sender<DomainEvent>>) -> Self {
        Self {
            worker: worker.into(),
            sink,
        }
    }
}

impl MessageHandler for EnvelopeHandler {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, Result<(), HandlerError>> {
        let worker = self.worker.clone();
        let sink = self.sink.clone();

        Box::pin(async move {
            let event = match DomainEvent::from_json(&message.payload) {
                Ok(event) => event,
                Err(e) => return Err(malformed(&worker, &message, &e)),
            };

            info!(
                worker = %worker,
                subject = %message.subject,
                event_id = %event.id,
                event_type = %event.kind,
                entity_id = event.data_str("entity_id").unwrap_or_default(),
                attempt = message.delivery_attempt.unwrap_or(1),
                "Received event"
            );

            if let Some(sink) = sink {
                sink.send(event)
                    .await
                    .map_err(|_| HandlerError::Failed("downstream channel closed".to_string()))?;
            }
            Ok(())
        })
    }
}

/// Decodes arbitrary JSON (telemetry and commands streams).
pub struct JsonPayloadHandler {
    worker: String,
    sink: Option<mpsc::Sender<Value>>,
}

impl JsonPayloadHandler {
    pub fn new(worker: impl Into<String>, sink: Option<mpsc::Sender<Value>>) -> Self {
        Self {
            worker: worker.into(),
            sink,
        }
    }
}

impl MessageHandler for JsonPayloadHandler {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, Result<(), HandlerError>> {
        let worker = self.worker.clone();
        let sink = self.sink.clone();

        Box::pin(async move {
            let body: Value = match serde_json::from_slice(&message.payload) {
                Ok(body) => body,
                Err(e) => return Err(malformed(&worker, &message, &e)),
            };

            debug!(
                worker = %worker,
                subject = %message.subject,
                body = %body,
                "Received message"
            );

            if let Some(sink) = sink {
                sink.send(body)
                    .await
                    .map_err(|_| HandlerError::Failed("downstream channel closed".to_string()))?;
            }
            Ok(())
        })
    }
}
