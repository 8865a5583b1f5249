//! Contract for the remote sandbox provider.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A live sandbox as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxHandle {
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Parameters for creating a sandbox.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateSandboxParams {
    pub template: Option<String>,
    pub cpu: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    /// Minutes of inactivity before the provider auto-stops the sandbox (0 = never)
    pub auto_stop_interval: u32,
    pub labels: HashMap<String, String>,
}

impl CreateSandboxParams {
    pub fn from_settings(provider: &crate::config::ProviderSection) -> Self {
        Self {
            template: provider.template.clone(),
            cpu: provider.cpu,
            memory_gb: provider.memory_gb,
            disk_gb: provider.disk_gb,
            auto_stop_interval: provider.auto_stop_interval_mins,
            labels: provider.labels.clone(),
        }
    }

    pub fn label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    pub fn new(cwd: Option<&str>, timeout: Duration) -> Self {
        Self {
            cwd: cwd.map(str::to_string),
            timeout: Some(timeout),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Error out with the captured output when the command exited non-zero.
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        anyhow::bail!(
            "Command '{}' failed with exit code {}: {}",
            command,
            self.exit_code,
            crate::util::tail(detail.trim(), 500)
        )
    }
}

/// Signed URL for a port exposed by the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewLink {
    pub url: String,
    pub token: Option<String>,
}

/// Remote sandbox provider.
///
/// Real implementation: `DaytonaClient`. Tests substitute scripted doubles.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    async fn create(&self, params: &CreateSandboxParams) -> Result<SandboxHandle>;

    /// Attach to an existing sandbox, starting it if the provider stopped it.
    async fn reconnect(&self, sandbox_id: &str) -> Result<SandboxHandle>;

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        opts: &CommandOptions,
    ) -> Result<CommandOutput>;

    async fn close(&self, handle: &SandboxHandle) -> Result<()>;

    async fn preview_link(&self, sandbox_id: &str, port: u16) -> Result<PreviewLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_passes_successful_output() {
        let out = CommandOutput {
            stdout: "ok".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(out.check("echo ok").unwrap().stdout, "ok");
    }

    #[test]
    fn test_check_prefers_stderr() {
        let out = CommandOutput {
            stdout: "partial".into(),
            stderr: "npm ERR! missing script: dev".into(),
            exit_code: 1,
        };
        let err = out.check("npm run dev").unwrap_err().to_string();
        assert!(err.contains("exit code 1"));
        assert!(err.contains("missing script"));
    }

    #[test]
    fn test_params_from_settings_with_labels() {
        let provider = crate::config::ProviderSection::default();
        let params = CreateSandboxParams::from_settings(&provider)
            .label("session_id", "s1")
            .label("recovered", "true");
        assert_eq!(params.cpu, 2);
        assert_eq!(params.memory_gb, 4);
        assert_eq!(params.disk_gb, 8);
        assert_eq!(params.auto_stop_interval, 0);
        assert_eq!(params.labels.get("session_id").map(String::as_str), Some("s1"));
        assert_eq!(params.labels.get("recovered").map(String::as_str), Some("true"));
    }
}
