//! Mock pull bus implementation for testing.
//!
//! Each consumer is driven by a script of [`MockStep`]s. Once a script runs
//! out, fetches wait for the full fetch interval and time out, like an idle
//! broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::{BusError, Delivery, FetchError, PullBus, PullSource, Result};
use crate::consumers::ConsumerDefinition;

/// A scripted message.
#[derive(Debug, Clone)]
pub struct MockMessage {
    pub subject: String,
    pub payload: Bytes,
    pub attempt: u64,
}

impl MockMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            attempt: 1,
        }
    }
}

/// One scripted fetch result.
#[derive(Debug, Clone)]
pub enum MockStep {
    Batch(Vec<MockMessage>),
    Timeout,
    Transient(String),
    Broker(String),
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<MockStep>>,
    bound: Vec<String>,
    fetches: HashMap<String, usize>,
    acked: Vec<String>,
    naked: Vec<String>,
    drained: Vec<String>,
    fail_acks: bool,
    fail_bind: bool,
}

/// Mock pull bus for testing.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step to a consumer's script.
    pub async fn push(&self, consumer: &str, step: MockStep) {
        self.state
            .lock()
            .await
            .scripts
            .entry(consumer.to_string())
            .or_default()
            .push_back(step);
    }

    pub async fn set_fail_acks(&self, fail: bool) {
        self.state.lock().await.fail_acks = fail;
    }

    pub async fn set_fail_bind(&self, fail: bool) {
        self.state.lock().await.fail_bind = fail;
    }

    /// Subjects acknowledged, in order.
    pub async fn acked(&self) -> Vec<String> {
        self.state.lock().await.acked.clone()
    }

    /// Subjects negatively acknowledged, in order.
    pub async fn naked(&self) -> Vec<String> {
        self.state.lock().await.naked.clone()
    }

    pub async fn bound(&self) -> Vec<String> {
        self.state.lock().await.bound.clone()
    }

    pub async fn drained(&self) -> Vec<String> {
        self.state.lock().await.drained.clone()
    }

    pub async fn fetch_count(&self, consumer: &str) -> usize {
        self.state
            .lock()
            .await
            .fetches
            .get(consumer)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PullBus for MockBus {
    type Source = MockSource;

    async fn bind(&self, consumer: &ConsumerDefinition) -> Result<MockSource> {
        let mut state = self.state.lock().await;
        if state.fail_bind {
            return Err(BusError::Subscribe("Mock bind failure".to_string()));
        }
        state.bound.push(consumer.durable_name.clone());
        Ok(MockSource {
            consumer: consumer.durable_name.clone(),
            state: Arc::clone(&self.state),
        })
    }
}

/// Source bound through [`MockBus`].
pub struct MockSource {
    consumer: String,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl PullSource for MockSource {
    type Message = MockDelivery;

    async fn fetch(
        &mut self,
        max_messages: usize,
        max_wait: Duration,
    ) -> std::result::Result<Vec<MockDelivery>, FetchError> {
        let step = {
            let mut state = self.state.lock().await;
            *state.fetches.entry(self.consumer.clone()).or_default() += 1;
            state
                .scripts
                .get_mut(&self.consumer)
                .and_then(VecDeque::pop_front)
        };

        match step {
            Some(MockStep::Batch(messages)) => Ok(messages
                .into_iter()
                .take(max_messages)
                .map(|message| MockDelivery {
                    message,
                    state: Arc::clone(&self.state),
                })
                .collect()),
            Some(MockStep::Timeout) => Err(FetchError::Timeout),
            Some(MockStep::Transient(message)) => Err(FetchError::Transient(message)),
            Some(MockStep::Broker(message)) => Err(FetchError::Broker(message)),
            None => {
                tokio::time::sleep(max_wait).await;
                Err(FetchError::Timeout)
            }
        }
    }

    async fn drain(&mut self) -> Result<()> {
        self.state.lock().await.drained.push(self.consumer.clone());
        Ok(())
    }
}

/// Delivery handed out by [`MockSource`].
pub struct MockDelivery {
    message: MockMessage,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Delivery for MockDelivery {
    fn subject(&self) -> &str {
        &self.message.subject
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_attempt(&self) -> Option<u64> {
        Some(self.message.attempt)
    }

    async fn ack(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_acks {
            return Err(BusError::Ack("Mock ack failure".to_string()));
        }
        state.acked.push(self.message.subject.clone());
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_acks {
            return Err(BusError::Ack("Mock nak failure".to_string()));
        }
        state.naked.push(self.message.subject.clone());
        Ok(())
    }
}
