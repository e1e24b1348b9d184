//! Mock publisher for testing.
//!
//! Keeps published messages in memory and collapses repeated
//! deduplication keys the way a stream's duplicate window does.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{EventPublisher, PublishReceipt};
use crate::bus::{BusError, Result};

const MOCK_STREAM: &str = "MOCK";

/// A message accepted by [`MockPublisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
    pub dedup_key: String,
    pub sequence: u64,
}

#[derive(Default)]
struct MockState {
    published: Vec<PublishedMessage>,
    keys: HashMap<String, u64>,
    fail_on_publish: bool,
    max_messages: Option<usize>,
    delay: Option<Duration>,
}

/// Mock publisher for testing.
#[derive(Default)]
pub struct MockPublisher {
    state: RwLock<MockState>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        self.state.write().await.fail_on_publish = fail;
    }

    /// Reject new messages with `Overflow` once this many are stored.
    pub async fn set_max_messages(&self, max: usize) {
        self.state.write().await.max_messages = Some(max);
    }

    /// Delay every publish, to simulate a slow broker.
    pub async fn set_delay(&self, delay: Duration) {
        self.state.write().await.delay = Some(delay);
    }

    pub async fn published_count(&self) -> usize {
        self.state.read().await.published.len()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.read().await.published.clone()
    }

    pub async fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut self.state.write().await.published)
    }
}

#[async_trait]
impl EventPublisher for MockPublisher {
    async fn publish_deduped(
        &self,
        subject: &str,
        payload: Bytes,
        dedup_key: &str,
    ) -> Result<PublishReceipt> {
        if dedup_key.is_empty() {
            return Err(BusError::EmptyDedupKey);
        }

        let delay = self.state.read().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if state.fail_on_publish {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }

        if let Some(&sequence) = state.keys.get(dedup_key) {
            return Ok(PublishReceipt {
                stream: MOCK_STREAM.to_string(),
                sequence,
                duplicate: true,
            });
        }

        if state.max_messages.is_some_and(|max| state.published.len() >= max) {
            return Err(BusError::Overflow {
                subject: subject.to_string(),
                message: "maximum messages exceeded".to_string(),
            });
        }

        let sequence = state.keys.len() as u64 + 1;
        state.keys.insert(dedup_key.to_string(), sequence);
        state.published.push(PublishedMessage {
            subject: subject.to_string(),
            payload,
            dedup_key: dedup_key.to_string(),
            sequence,
        });

        Ok(PublishReceipt {
            stream: MOCK_STREAM.to_string(),
            sequence,
            duplicate: false,
        })
    }
}
