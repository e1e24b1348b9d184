//! Broker bootstrap.
//!
//! Starts `nats-server` with JetStream as a supervised child process, or
//! attaches to an already running broker, and owns the single client
//! connection the rest of the runtime shares by clone.

mod process;
mod server_config;

pub use process::{wait_for_ready, ManagedProcess};
pub use server_config::{render_server_config, SERVER_CONFIG_FILE};

use std::path::PathBuf;
use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream;
use async_nats::{ConnectOptions, Event};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::utils::connect_with_retry;

/// Interval between readiness probes of the broker port.
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that can occur while running the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write broker configuration to {}: {source}", .path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Broker at {address} not ready within {timeout:?}")]
    NotReady { address: String, timeout: Duration },

    #[error("Broker process exited during startup: {0}")]
    ProcessExited(String),

    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("JetStream is not available: {0}")]
    JetStreamUnavailable(String),

    #[error("Broker process is not running")]
    ProcessDown,

    #[error("Client is not connected (state: {0})")]
    Disconnected(String),

    #[error("Broker shutdown failed: {0}")]
    Shutdown(String),
}

/// A running broker and its client connection.
pub struct Broker {
    config: BrokerConfig,
    url: String,
    process: Option<ManagedProcess>,
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl Broker {
    /// Start the configured broker, or attach when `external_url` is set.
    ///
    /// Fails when the broker is not ready within the ready timeout, when
    /// the client cannot connect, or when JetStream is not enabled.
    pub async fn start(config: &BrokerConfig) -> Result<Self, BrokerError> {
        if config.external_url.is_some() {
            return Self::attach(config).await;
        }

        let config_path = prepare_data_dir(config).await?;
        let process = ManagedProcess::spawn(
            &config.server_binary,
            &["-c".to_string(), config_path.to_string_lossy().into_owned()],
        )?;

        let address = format!("{}:{}", config.host, config.port);
        let ready = wait_for_ready(
            &address,
            config.ready_timeout(),
            READY_PROBE_INTERVAL,
            Some(&process),
        )
        .await;

        let url = config.client_url();
        let connected = match ready {
            Ok(()) => Self::connect(config, &url).await,
            Err(e) => Err(e),
        };

        match connected {
            Ok((client, jetstream)) => {
                info!(url = %url, pid = ?process.pid(), "Embedded broker started");
                Ok(Self {
                    config: config.clone(),
                    url,
                    process: Some(process),
                    client,
                    jetstream,
                })
            }
            Err(e) => {
                if let Err(stop) = process.terminate(config.shutdown_grace()).await {
                    warn!(error = %stop, "Failed to stop broker after startup failure");
                }
                Err(e)
            }
        }
    }

    /// Connect to an already running broker, retrying with backoff.
    pub async fn attach(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let url = config.client_url();
        let client = connect_with_retry("broker", &url, || {
            let options = connect_options(config);
            let url = url.clone();
            async move { options.connect(url).await }
        })
        .await
        .map_err(|e| BrokerError::Connect {
            url: url.clone(),
            message: e.to_string(),
        })?;

        let jetstream = verify_jetstream(client.clone()).await?;
        info!(url = %url, "Attached to external broker");

        Ok(Self {
            config: config.clone(),
            url,
            process: None,
            client,
            jetstream,
        })
    }

    async fn connect(
        config: &BrokerConfig,
        url: &str,
    ) -> Result<(async_nats::Client, jetstream::Context), BrokerError> {
        let client = connect_options(config)
            .connect(url)
            .await
            .map_err(|e| BrokerError::Connect {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let jetstream = verify_jetstream(client.clone()).await?;
        Ok((client, jetstream))
    }

    /// Shared client. Clones share one connection; never close it directly.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the broker runs as a supervised child process.
    pub fn is_embedded(&self) -> bool {
        self.process.is_some()
    }

    /// Liveness of the broker process; `None` when attached externally.
    pub async fn process_health(&self) -> Option<bool> {
        match &self.process {
            Some(process) => Some(process.is_running().await),
            None => None,
        }
    }

    pub fn connection_state(&self) -> State {
        self.client.connection_state()
    }

    /// Check process liveness and connection liveness.
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        if self.process_health().await == Some(false) {
            return Err(BrokerError::ProcessDown);
        }
        match self.connection_state() {
            State::Connected => Ok(()),
            other => Err(BrokerError::Disconnected(format!("{:?}", other))),
        }
    }

    /// Drain and close the shared connection, then stop the broker process.
    ///
    /// Draining closes the connection for every clone of the client, so
    /// handles still held elsewhere stop reconnecting.
    pub async fn shutdown(self) -> Result<(), BrokerError> {
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush client before shutdown");
        }
        if let Err(e) = self.client.drain().await {
            warn!(error = %e, "Failed to drain client before shutdown");
        }
        debug!(state = ?self.client.connection_state(), "Client closed");
        drop(self.jetstream);
        drop(self.client);

        if let Some(process) = &self.process {
            process.terminate(self.config.shutdown_grace()).await?;
        }
        info!(url = %self.url, "Broker stopped");
        Ok(())
    }
}

/// Create the data directory and write the server configuration into it.
///
/// Returns the path of the written configuration file.
pub async fn prepare_data_dir(config: &BrokerConfig) -> Result<PathBuf, BrokerError> {
    let data_dir = &config.data_dir;
    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|e| BrokerError::ConfigWrite {
            path: data_dir.clone(),
            source: e,
        })?;

    let store_dir = tokio::fs::canonicalize(data_dir)
        .await
        .unwrap_or_else(|_| data_dir.clone());
    let path = data_dir.join(SERVER_CONFIG_FILE);
    tokio::fs::write(&path, render_server_config(config, &store_dir))
        .await
        .map_err(|e| BrokerError::ConfigWrite {
            path: path.clone(),
            source: e,
        })?;

    debug!(path = %path.display(), "Wrote broker configuration");
    Ok(path)
}

fn connect_options(config: &BrokerConfig) -> ConnectOptions {
    let reconnect_wait = config.reconnect_wait();
    let mut options = ConnectOptions::new()
        .name(&config.client_name)
        .max_reconnects(None)
        .reconnect_delay_callback(move |_attempts| reconnect_wait)
        .event_callback(|event| async move { log_connection_event(event) });

    if let Some(tls) = &config.tls {
        options = options.require_tls(true);
        if let Some(ca) = &tls.ca_file {
            options = options.add_root_certificates(ca.clone());
        }
    }
    options
}

fn log_connection_event(event: Event) {
    match event {
        Event::Disconnected => warn!("Broker connection lost, reconnecting"),
        Event::Connected => info!("Broker connection established"),
        Event::ServerError(e) => error!(error = %e, "Broker reported an error"),
        Event::ClientError(e) => error!(error = %e, "Broker client error"),
        other => debug!(event = %other, "Broker connection event"),
    }
}

async fn verify_jetstream(client: async_nats::Client) -> Result<jetstream::Context, BrokerError> {
    let jetstream = jetstream::new(client);
    let account = jetstream
        .query_account()
        .await
        .map_err(|e| BrokerError::JetStreamUnavailable(e.to_string()))?;
    debug!(streams = account.streams, consumers = account.consumers, "JetStream account ready");
    Ok(jetstream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_data_dir_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            data_dir: dir.path().join("nats"),
            port: 14222,
            ..BrokerConfig::default()
        };

        let path = prepare_data_dir(&config).await.unwrap();
        assert_eq!(path, dir.path().join("nats").join(SERVER_CONFIG_FILE));

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("port: 14222"));
        assert!(written.contains("jetstream {"));
    }

    #[tokio::test]
    async fn test_start_fails_when_binary_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            data_dir: dir.path().to_path_buf(),
            server_binary: "constellation-no-such-nats-server".to_string(),
            ..BrokerConfig::default()
        };

        assert!(matches!(
            Broker::start(&config).await,
            Err(BrokerError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_fails_when_process_exits() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            data_dir: dir.path().to_path_buf(),
            server_binary: "false".to_string(),
            port: 1,
            ..BrokerConfig::default()
        };

        assert!(matches!(
            Broker::start(&config).await,
            Err(BrokerError::ProcessExited(_))
        ));
    }

    #[test]
    fn test_error_display() {
        let err = BrokerError::NotReady {
            address: "127.0.0.1:4222".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "Broker at 127.0.0.1:4222 not ready within 10s");
    }
}
