//! Stream, consumer, worker and publisher configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::subjects::Domain;

/// Stream catalog configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Optional prefix prepended to every subject (e.g. `constellation`).
    pub subject_prefix: Option<String>,
    /// Replica count for every stream.
    pub replicas: usize,
    /// Per-domain limit overrides.
    pub overrides: HashMap<Domain, StreamOverride>,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            subject_prefix: None,
            replicas: 1,
            overrides: HashMap::new(),
        }
    }
}

/// Limit overrides for one stream. Unset fields keep the built-in tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamOverride {
    pub max_messages: Option<i64>,
    pub max_bytes: Option<i64>,
    pub max_age_secs: Option<u64>,
    pub max_message_size: Option<i32>,
    pub duplicate_window_secs: Option<u64>,
}

/// Durable consumer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Seconds before an unacknowledged delivery is redelivered.
    pub ack_wait_secs: u64,
    /// Delivery attempts per message.
    pub max_deliver: i64,
    /// Unacknowledged deliveries allowed in flight.
    pub max_ack_pending: i64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            ack_wait_secs: 30,
            max_deliver: 3,
            max_ack_pending: 1000,
        }
    }
}

impl ConsumerSettings {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

/// Pull loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Messages requested per fetch.
    pub batch_size: usize,
    /// Milliseconds a fetch waits for messages.
    pub fetch_wait_ms: u64,
    /// First delay after a broker-side fetch error.
    pub backoff_min_ms: u64,
    /// Ceiling for the fetch error backoff.
    pub backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            fetch_wait_ms: 2000,
            backoff_min_ms: 100,
            backoff_max_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Publish bridge settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// `source` field stamped on produced events.
    pub source: String,
    /// Jobs the background publish queue holds before `enqueue` waits.
    pub queue_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            source: "entity-service".to_string(),
            queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_overrides_keyed_by_domain() {
        let yaml = r#"
subject_prefix: constellation
overrides:
  telemetry:
    max_age_secs: 600
  commands:
    max_messages: 10
    duplicate_window_secs: 30
"#;
        let config: StreamsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.replicas, 1);
        assert_eq!(config.overrides[&Domain::Telemetry].max_age_secs, Some(600));
        let commands = &config.overrides[&Domain::Commands];
        assert_eq!(commands.max_messages, Some(10));
        assert_eq!(commands.max_bytes, None);
    }

    #[test]
    fn test_unknown_domain_rejected() {
        let yaml = r#"
overrides:
  metrics:
    max_messages: 10
"#;
        assert!(serde_yaml::from_str::<StreamsConfig>(yaml).is_err());
    }

    #[test]
    fn test_worker_durations() {
        let config: WorkerConfig = serde_yaml::from_str("fetch_wait_ms: 500").unwrap();
        assert_eq!(config.fetch_wait(), Duration::from_millis(500));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.backoff_max(), Duration::from_secs(5));
    }
}
