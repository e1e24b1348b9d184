//! Broker process and client connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default client port.
const DEFAULT_PORT: u16 = 4222;
/// Default in-memory JetStream ceiling (256 MiB).
const DEFAULT_MAX_MEMORY: i64 = 256 * 1024 * 1024;
/// Default on-disk JetStream ceiling (2 GiB).
const DEFAULT_MAX_FILE_STORE: i64 = 2 * 1024 * 1024 * 1024;

/// Broker configuration.
///
/// With `external_url` unset the broker is spawned and supervised as a
/// child process; otherwise the runtime only connects to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Connect to an already running broker instead of spawning one.
    pub external_url: Option<String>,
    /// Path or name of the `nats-server` executable.
    pub server_binary: String,
    /// Server name reported by the broker.
    pub server_name: String,
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// JetStream storage directory. The generated server config lives here too.
    pub data_dir: PathBuf,
    /// In-memory storage ceiling in bytes.
    pub max_memory: i64,
    /// File storage ceiling in bytes.
    pub max_file_store: i64,
    /// JetStream domain label.
    pub jetstream_domain: String,
    /// TLS material; absent means plaintext.
    pub tls: Option<TlsConfig>,
    /// WebSocket listener port. Only opened together with TLS.
    pub websocket_port: Option<u16>,
    /// Seconds to wait for the broker port to accept connections.
    pub ready_timeout_secs: u64,
    /// Seconds between client reconnect attempts.
    pub reconnect_wait_secs: u64,
    /// Seconds to wait for the process after SIGTERM before killing it.
    pub shutdown_grace_secs: u64,
    /// Client connection name.
    pub client_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            external_url: None,
            server_binary: "nats-server".to_string(),
            server_name: "constellation".to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("./data/nats"),
            max_memory: DEFAULT_MAX_MEMORY,
            max_file_store: DEFAULT_MAX_FILE_STORE,
            jetstream_domain: "constellation".to_string(),
            tls: None,
            websocket_port: None,
            ready_timeout_secs: 10,
            reconnect_wait_secs: 2,
            shutdown_grace_secs: 5,
            client_name: "constellation".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Configuration for attaching to a broker at `url`.
    pub fn external(url: impl Into<String>) -> Self {
        Self {
            external_url: Some(url.into()),
            ..Self::default()
        }
    }

    /// URL clients use to reach the broker.
    pub fn client_url(&self) -> String {
        match &self.external_url {
            Some(url) => url.clone(),
            None => {
                let scheme = if self.tls.is_some() { "tls" } else { "nats" };
                format!("{}://{}:{}", scheme, self.host, self.port)
            }
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// TLS material for the broker listener and client.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Server certificate (PEM).
    pub cert_file: PathBuf,
    /// Server private key (PEM).
    pub key_file: PathBuf,
    /// CA bundle the client trusts; system roots when absent.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}
