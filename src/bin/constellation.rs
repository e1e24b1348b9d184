//! constellation: durable entity event distribution
//!
//! Starts (or attaches to) a NATS JetStream broker, declares the entity,
//! event, telemetry and command streams, provisions their durable
//! consumers and runs one pull worker per stream until interrupted.
//!
//! ## Architecture
//! ```text
//! [entity service] --(publish, Nats-Msg-Id)--> [JetStream streams]
//!                                                     |
//!                                              (pull, explicit ack)
//!                                                     v
//!                                          [EntityWorker, EventWorker,
//!                                           TelemetryWorker, CommandWorker]
//! ```
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - CONSTELLATION_CONFIG: path to a YAML config file (optional)
//! - CONSTELLATION__<SECTION>__<KEY>: per-field overrides,
//!   e.g. CONSTELLATION__BROKER__EXTERNAL_URL=nats://localhost:4222
//! - CONSTELLATION_LOG: tracing filter (default: info)

use std::time::Duration;

use tracing::{info, warn};

use constellation::config::Config;
use constellation::runtime::Runtime;
use constellation::utils::bootstrap::init_tracing;
use constellation::workers::WorkerSinks;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let runtime = Runtime::start(&config, WorkerSinks::default()).await?;
    info!(
        url = %runtime.broker().url(),
        embedded = runtime.broker().is_embedded(),
        "constellation started"
    );

    let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
    ticker.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = ticker.tick() => {
                let health = runtime.health().await;
                if health.is_healthy() {
                    info!(uptime = health.uptime, "Health check passed");
                } else {
                    warn!(details = ?health.details, "Health check failed");
                }
            }
        }
    }

    info!("Shutdown requested");
    for report in runtime.shutdown().await? {
        info!(
            worker = %report.worker,
            state = %report.state,
            drained = report.drained,
            error = ?report.error,
            "Worker report"
        );
    }

    Ok(())
}
