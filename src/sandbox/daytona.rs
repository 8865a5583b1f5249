//! `SandboxClient` backed by a Daytona-style REST API.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::client::{
    CommandOptions, CommandOutput, CreateSandboxParams, PreviewLink, SandboxClient, SandboxHandle,
};
use crate::config::ProviderSection;
use crate::errors::{SandboxError, SandboxResult};
use crate::util::shell_quote;

/// Upper bound for control-plane requests that don't carry their own timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack added on top of a command's own timeout for the HTTP round trip.
const COMMAND_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    target: &'a str,
    cpu: u32,
    memory: u32,
    disk: u32,
    auto_stop_interval: u32,
    labels: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxResponse {
    id: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl SandboxResponse {
    fn into_handle(self) -> SandboxHandle {
        SandboxHandle {
            id: self.id,
            labels: self.labels,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }

    fn is_started(&self) -> bool {
        matches!(self.state.as_deref(), Some("started") | None)
    }
}

#[derive(Debug, Serialize)]
struct ExecuteBody<'a> {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    exit_code: i32,
    #[serde(default)]
    result: String,
}

#[derive(Debug, Deserialize)]
struct PreviewResponse {
    url: String,
    #[serde(default)]
    token: Option<String>,
}

pub struct DaytonaClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    target: String,
}

impl DaytonaClient {
    /// Build a client from provider settings. A missing API key is fatal.
    pub fn new(provider: &ProviderSection) -> SandboxResult<Self> {
        let api_key = provider
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                SandboxError::Configuration(
                    "DAYTONA_API_KEY is not set and [provider].api_key is empty".to_string(),
                )
            })?;

        let http = reqwest::Client::builder()
            .user_agent("forge-sandbox")
            .build()
            .map_err(|e| SandboxError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_url: provider.api_url.trim_end_matches('/').to_string(),
            api_key,
            target: provider.target.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Daytona-Target", &self.target)
            .timeout(REQUEST_TIMEOUT)
    }

    async fn fetch_sandbox(&self, sandbox_id: &str) -> Result<SandboxResponse> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/sandbox/{}", sandbox_id))
            .send()
            .await
            .with_context(|| format!("Failed to reach sandbox provider for {}", sandbox_id))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Sandbox {} not found (terminated or destroyed)", sandbox_id);
        }

        resp.error_for_status()
            .with_context(|| format!("Sandbox provider rejected lookup of {}", sandbox_id))?
            .json()
            .await
            .context("Failed to parse sandbox response")
    }
}

/// Wrap a command so pipes, `&&` and redirects behave as in a login shell.
fn shell_command(command: &str) -> String {
    format!("sh -c {}", shell_quote(command))
}

#[async_trait]
impl SandboxClient for DaytonaClient {
    async fn create(&self, params: &CreateSandboxParams) -> Result<SandboxHandle> {
        let body = CreateSandboxBody {
            image: params.template.as_deref(),
            target: &self.target,
            cpu: params.cpu,
            memory: params.memory_gb,
            disk: params.disk_gb,
            auto_stop_interval: params.auto_stop_interval,
            labels: &params.labels,
        };

        let sandbox: SandboxResponse = self
            .request(reqwest::Method::POST, "/sandbox")
            .json(&body)
            .send()
            .await
            .context("Failed to reach sandbox provider")?
            .error_for_status()
            .context("Sandbox provider rejected create request")?
            .json()
            .await
            .context("Failed to parse create response")?;

        Ok(sandbox.into_handle())
    }

    async fn reconnect(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let sandbox = self.fetch_sandbox(sandbox_id).await?;
        if sandbox.is_started() {
            return Ok(sandbox.into_handle());
        }

        tracing::info!(sandbox_id, state = ?sandbox.state, "Starting stopped sandbox");
        self.request(reqwest::Method::POST, &format!("/sandbox/{}/start", sandbox_id))
            .send()
            .await
            .with_context(|| format!("Failed to start sandbox {}", sandbox_id))?
            .error_for_status()
            .with_context(|| format!("Sandbox provider refused to start {}", sandbox_id))?;

        Ok(sandbox.into_handle())
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        opts: &CommandOptions,
    ) -> Result<CommandOutput> {
        let body = ExecuteBody {
            command: shell_command(command),
            cwd: opts.cwd.as_deref(),
            timeout: opts.timeout.map(|t| t.as_secs().max(1)),
        };
        let http_timeout = opts.timeout.unwrap_or(REQUEST_TIMEOUT) + COMMAND_TIMEOUT_SLACK;

        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/toolbox/{}/toolbox/process/execute", handle.id),
            )
            .timeout(http_timeout)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Connection to sandbox {} failed", handle.id))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Sandbox {} not found (terminated or destroyed)", handle.id);
        }

        let out: ExecuteResponse = resp
            .error_for_status()
            .with_context(|| format!("Command execution rejected for sandbox {}", handle.id))?
            .json()
            .await
            .context("Failed to parse execute response")?;

        // The toolbox API merges stdout and stderr into `result`.
        Ok(CommandOutput {
            stdout: out.result,
            stderr: String::new(),
            exit_code: out.exit_code,
        })
    }

    async fn close(&self, handle: &SandboxHandle) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/sandbox/{}", handle.id))
            .send()
            .await
            .with_context(|| format!("Failed to delete sandbox {}", handle.id))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()
            .with_context(|| format!("Sandbox provider refused to delete {}", handle.id))?;
        Ok(())
    }

    async fn preview_link(&self, sandbox_id: &str, port: u16) -> Result<PreviewLink> {
        let preview: PreviewResponse = self
            .request(
                reqwest::Method::GET,
                &format!("/sandbox/{}/ports/{}/preview-url", sandbox_id, port),
            )
            .send()
            .await
            .with_context(|| format!("Failed to request preview link for {}", sandbox_id))?
            .error_for_status()
            .with_context(|| format!("No preview link for port {} on {}", port, sandbox_id))?
            .json()
            .await
            .context("Failed to parse preview response")?;

        Ok(PreviewLink {
            url: preview.url,
            token: preview.token,
        })
    }
}
