//! Bounded background publish queue.
//!
//! Request handlers enqueue and move on; a single task publishes jobs in
//! order. Each job returns a [`PublishTicket`] that resolves to the broker
//! receipt, so failures stay observable even when nobody waits on them.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EventPublisher, OutboundMessage, PublishReceipt};
use crate::bus::{BusError, Result};

struct PublishJob {
    message: OutboundMessage,
    reply: oneshot::Sender<Result<PublishReceipt>>,
}

/// Handle to the outcome of a queued publish. Dropping it is fine.
pub struct PublishTicket {
    reply: oneshot::Receiver<Result<PublishReceipt>>,
}

impl PublishTicket {
    /// Wait for the broker receipt.
    pub async fn wait(self) -> Result<PublishReceipt> {
        self.reply.await.map_err(|_| BusError::QueueClosed)?
    }
}

/// Bounded queue in front of an [`EventPublisher`].
pub struct PublishQueue {
    sender: RwLock<Option<mpsc::Sender<PublishJob>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

impl PublishQueue {
    /// Spawn the publishing task.
    pub fn spawn(publisher: Arc<dyn EventPublisher>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(Self::run(publisher, rx));
        Self {
            sender: RwLock::new(Some(tx)),
            task: Mutex::new(Some(task)),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn run(publisher: Arc<dyn EventPublisher>, mut rx: mpsc::Receiver<PublishJob>) {
        while let Some(job) = rx.recv().await {
            let result = publisher.publish_message(&job.message).await;
            match &result {
                Ok(receipt) => debug!(
                    subject = %job.message.subject,
                    sequence = receipt.sequence,
                    duplicate = receipt.duplicate,
                    "Queued publish stored"
                ),
                Err(e) => warn!(
                    subject = %job.message.subject,
                    msg_id = %job.message.dedup_key,
                    error = %e,
                    "Queued publish failed"
                ),
            }
            // Receiver may have been dropped; the outcome is already logged.
            let _ = job.reply.send(result);
        }
        debug!("Publish queue drained");
    }

    async fn sender(&self) -> Result<mpsc::Sender<PublishJob>> {
        self.sender.read().await.clone().ok_or(BusError::QueueClosed)
    }

    fn job(message: OutboundMessage) -> Result<(PublishJob, PublishTicket)> {
        if message.dedup_key.is_empty() {
            return Err(BusError::EmptyDedupKey);
        }
        let (reply, rx) = oneshot::channel();
        Ok((PublishJob { message, reply }, PublishTicket { reply: rx }))
    }

    /// Enqueue, waiting for capacity.
    pub async fn enqueue(&self, message: OutboundMessage) -> Result<PublishTicket> {
        let (job, ticket) = Self::job(message)?;
        self.sender()
            .await?
            .send(job)
            .await
            .map_err(|_| BusError::QueueClosed)?;
        Ok(ticket)
    }

    /// Enqueue without waiting; fails with `QueueFull` at capacity.
    pub async fn try_enqueue(&self, message: OutboundMessage) -> Result<PublishTicket> {
        let (job, ticket) = Self::job(message)?;
        self.sender().await?.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BusError::QueueClosed,
        })?;
        Ok(ticket)
    }

    /// Stop accepting jobs and wait until queued ones are published.
    pub async fn close(&self) {
        if self.sender.write().await.take().is_none() {
            return;
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Publish queue task ended abnormally");
            }
        }
        info!("Publish queue closed");
    }
}
