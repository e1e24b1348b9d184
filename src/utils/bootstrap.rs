//! Bootstrap utilities for the constellation binary.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the CONSTELLATION_LOG environment variable.
///
/// Defaults to "info" level if CONSTELLATION_LOG is not set. With the
/// `json-logs` feature, lines are emitted as JSON objects.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    #[cfg(feature = "json-logs")]
    let layer = tracing_subscriber::fmt::layer().json();
    #[cfg(not(feature = "json-logs"))]
    let layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry().with(filter).with(layer).init();
}

/// Connect with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "broker")
/// * `address` - The address being connected to
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connected client on success, or the last error once retries run out.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = connection_backoff().build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                info!(service = %service_name, address = %address, "Connected");
                return Ok(client);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        service = %service_name,
                        address = %address,
                        attempt,
                        error = %e,
                        retry_in_ms = %delay.as_millis(),
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        service = %service_name,
                        address = %address,
                        attempts = attempt,
                        error = %e,
                        "Connection failed, giving up"
                    );
                    return Err(e);
                }
            },
        }
    }
}
