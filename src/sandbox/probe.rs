//! Liveness probe for a single sandbox.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::client::{CommandOptions, SandboxClient, SandboxHandle};

const ECHO_MARKER: &str = "forge-health-ok";

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    pub latency: Duration,
    pub error: Option<String>,
    /// The reconnected handle, when the probe got that far.
    pub handle: Option<SandboxHandle>,
}

/// Reconnects, runs an echo and a filesystem check, all under one hard timeout.
///
/// Never returns an error: every failure, including the timeout, becomes a
/// `ProbeResult` with `success == false`.
#[derive(Clone)]
pub struct HealthProber {
    client: Arc<dyn SandboxClient>,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(client: Arc<dyn SandboxClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn probe(&self, sandbox_id: &str) -> ProbeResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.run_checks(sandbox_id)).await;
        let latency = started.elapsed();

        match outcome {
            Ok(Ok(handle)) => ProbeResult {
                success: true,
                latency,
                error: None,
                handle: Some(handle),
            },
            Ok(Err(e)) => ProbeResult {
                success: false,
                latency,
                error: Some(format!("{:#}", e)),
                handle: None,
            },
            Err(_) => ProbeResult {
                success: false,
                latency,
                error: Some(format!(
                    "Health probe connection timeout after {}s",
                    self.timeout.as_secs()
                )),
                handle: None,
            },
        }
    }

    async fn run_checks(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let handle = self.client.reconnect(sandbox_id).await?;
        let opts = CommandOptions::new(None, self.timeout);

        let echo = self
            .client
            .run_command(&handle, &format!("echo {}", ECHO_MARKER), &opts)
            .await?
            .check("echo")?;
        if !echo.stdout.contains(ECHO_MARKER) {
            anyhow::bail!("Liveness command returned unexpected output");
        }

        self.client
            .run_command(&handle, "pwd && ls -la > /dev/null", &opts)
            .await?
            .check("filesystem check")?;

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::MockSandboxClient;

    #[tokio::test]
    async fn test_probe_success() {
        let client = Arc::new(MockSandboxClient::new());
        client.add_sandbox("b1");
        let prober = HealthProber::new(client.clone(), Duration::from_secs(5));

        let result = prober.probe("b1").await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.error.is_none());
        assert_eq!(result.handle.unwrap().id, "b1");
        assert_eq!(client.commands_for("b1").len(), 2);
    }

    #[tokio::test]
    async fn test_probe_reconnect_failure_is_mapped() {
        let client = Arc::new(MockSandboxClient::new());
        let prober = HealthProber::new(client, Duration::from_secs(5));

        let result = prober.probe("missing").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
        assert!(result.handle.is_none());
    }

    #[tokio::test]
    async fn test_probe_command_failure_is_mapped() {
        let client = Arc::new(MockSandboxClient::new());
        client.add_sandbox("b1");
        client.fail_commands("b1", "pwd", 1, "permission denied");
        let prober = HealthProber::new(client, Duration::from_secs(5));

        let result = prober.probe("b1").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_times_out() {
        let client = Arc::new(MockSandboxClient::new());
        client.add_sandbox("b1");
        client.set_delay(Duration::from_secs(30));
        let prober = HealthProber::new(client, Duration::from_secs(5));

        let result = prober.probe("b1").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timeout"));
    }
}
