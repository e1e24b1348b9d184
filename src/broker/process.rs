//! Supervision of the spawned broker process.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::BrokerError;

/// A spawned child process, terminated on shutdown or drop.
pub struct ManagedProcess {
    child: Mutex<Option<Child>>,
    command: String,
    pid: Option<u32>,
}

impl ManagedProcess {
    /// Spawn `program` with `args`. No shell interpretation.
    ///
    /// Output is inherited so broker logs land next to ours.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, BrokerError> {
        let command = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        info!(command = %command, "Spawning broker process");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                error!(command = %command, error = %e, "Failed to spawn broker process");
                BrokerError::Spawn {
                    command: command.clone(),
                    source: e,
                }
            })?;

        let pid = child.id();
        info!(pid = ?pid, "Broker process spawned");

        Ok(Self {
            child: Mutex::new(Some(child)),
            command,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit status if the process has ended, `None` while it runs.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                error!(command = %self.command, error = %e, "Failed to check process status");
                None
            }
        }
    }

    /// Whether the process is still running.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!(status = ?status, command = %self.command, "Process exited");
                false
            }
            Some(Err(e)) => {
                error!(error = %e, "Failed to check process status");
                false
            }
            None => false,
        }
    }

    /// Ask the process to stop with SIGTERM, then kill it after `grace`.
    pub async fn terminate(&self, grace: Duration) -> Result<(), BrokerError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(status = ?status, "Broker process already exited");
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                info!(pid, "Sending SIGTERM to broker process");
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid, error = %e, "Failed to send SIGTERM");
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to stop broker process");
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(status = ?status, "Broker process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(BrokerError::Shutdown(e.to_string())),
            Err(_) => {
                warn!(grace_ms = %grace.as_millis(), "Broker did not exit in time, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| BrokerError::Shutdown(e.to_string()))
            }
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.get_mut().as_mut() {
            if let Ok(None) = child.try_wait() {
                warn!(pid = ?child.id(), "Killing orphaned broker process on drop");
                let _ = child.start_kill();
            }
        }
    }
}

/// Wait until `address` accepts TCP connections.
///
/// Fails early when `process` exits before the port opens.
pub async fn wait_for_ready(
    address: &str,
    timeout: Duration,
    retry_interval: Duration,
    process: Option<&ManagedProcess>,
) -> Result<(), BrokerError> {
    let start = std::time::Instant::now();

    loop {
        match TcpStream::connect(address).await {
            Ok(_) => {
                info!(address = %address, "Broker is accepting connections");
                return Ok(());
            }
            Err(e) => {
                if let Some(process) = process {
                    if let Some(status) = process.exit_status().await {
                        return Err(BrokerError::ProcessExited(status.to_string()));
                    }
                }
                if start.elapsed() > timeout {
                    error!(address = %address, error = %e, "Timeout waiting for broker");
                    return Err(BrokerError::NotReady {
                        address: address.to_string(),
                        timeout,
                    });
                }
                debug!(address = %address, "Broker not ready, retrying...");
                sleep(retry_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_wait_for_ready_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        wait_for_ready(&address, Duration::from_secs(1), Duration::from_millis(10), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = wait_for_ready(
            &address,
            Duration::from_millis(50),
            Duration::from_millis(10),
            None,
        )
        .await;
        assert!(matches!(result, Err(BrokerError::NotReady { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_process_fails_fast() {
        let process = ManagedProcess::spawn("sh", &["-c".to_string(), "exit 3".to_string()])
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = wait_for_ready(
            &address,
            Duration::from_secs(5),
            Duration::from_millis(10),
            Some(&process),
        )
        .await;
        assert!(matches!(result, Err(BrokerError::ProcessExited(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_process() {
        let process = ManagedProcess::spawn("sleep", &["30".to_string()]).unwrap();
        assert!(process.is_running().await);

        process.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!process.is_running().await);

        // Second terminate is a no-op.
        process.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let result = ManagedProcess::spawn("constellation-no-such-binary", &[]);
        assert!(matches!(result, Err(BrokerError::Spawn { .. })));
    }
}
