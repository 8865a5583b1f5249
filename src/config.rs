//! Sandbox subsystem configuration.
//!
//! Settings are read from `.forge/sandbox.toml` in the project directory and
//! layered: file → environment → CLI. Every field has a default, so a partial
//! file only overrides what it names.
//!
//! # Configuration File Format
//!
//! ```toml
//! [provider]
//! api_url = "https://api.daytona.io"
//! target = "us"
//! cpu = 2
//! memory_gb = 4
//! disk_gb = 8
//!
//! [provider.labels]
//! project = "scaffold-app"
//!
//! [health]
//! check_interval_secs = 30
//! probe_timeout_secs = 10
//! degraded_latency_ms = 5000
//! auto_recovery_threshold = 3
//! max_recovery_attempts = 5
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! cooldown_secs = 60
//! half_open_success_threshold = 3
//!
//! [recovery]
//! max_concurrent = 4
//! restart_settle_secs = 5
//!
//! [lifecycle]
//! workspace_root = "/home/daytona"
//! idle_timeout_secs = 1800
//! cleanup_interval_secs = 300
//!
//! [project]
//! template_repo = "https://github.com/pria-cloud/agents.git"
//! dev_port = 3000
//!
//! [ai]
//! command = "claude --print --dangerously-skip-permissions"
//! timeout_secs = 120
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Remote sandbox provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// API key; usually supplied through `DAYTONA_API_KEY` instead of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_target")]
    pub target: String,
    /// Image or snapshot to create sandboxes from (provider default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    /// Minutes of inactivity before the provider stops the sandbox (0 = never)
    #[serde(default)]
    pub auto_stop_interval_mins: u32,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_api_url() -> String {
    "https://api.daytona.io".to_string()
}

fn default_target() -> String {
    "us".to_string()
}

fn default_cpu() -> u32 {
    2
}

fn default_memory_gb() -> u32 {
    4
}

fn default_disk_gb() -> u32 {
    8
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            target: default_target(),
            template: None,
            cpu: default_cpu(),
            memory_gb: default_memory_gb(),
            disk_gb: default_disk_gb(),
            auto_stop_interval_mins: 0,
            labels: HashMap::new(),
        }
    }
}

/// Health probing and automatic-recovery thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Latency above which a sandbox with no failures is reported Degraded
    #[serde(default = "default_degraded_latency")]
    pub degraded_latency_ms: u64,
    /// Consecutive failures that trigger automatic recovery
    #[serde(default = "default_auto_recovery_threshold")]
    pub auto_recovery_threshold: u32,
    /// Automatic recovery attempts allowed per session
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_check_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_degraded_latency() -> u64 {
    5000
}

fn default_auto_recovery_threshold() -> u32 {
    3
}

fn default_max_recovery_attempts() -> u32 {
    5
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            probe_timeout_secs: default_probe_timeout(),
            degraded_latency_ms: default_degraded_latency(),
            auto_recovery_threshold: default_auto_recovery_threshold(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

impl HealthSection {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    /// Cumulative failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit blocks attempts (seconds)
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Consecutive half-open successes needed to close the circuit
    #[serde(default = "default_half_open_successes")]
    pub half_open_success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    60
}

fn default_half_open_successes() -> u32 {
    3
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            half_open_success_threshold: default_half_open_successes(),
        }
    }
}

/// Recovery worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySection {
    /// Automatic recoveries allowed to run at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Wait after restarting a command in place before re-probing (seconds)
    #[serde(default = "default_restart_settle")]
    pub restart_settle_secs: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_restart_settle() -> u64 {
    5
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            restart_settle_secs: default_restart_settle(),
        }
    }
}

/// Sandbox lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSection {
    /// Parent directory for per-session working directories
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Cached sandboxes idle longer than this are closed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_workspace_root() -> String {
    "/home/daytona".to_string()
}

fn default_create_timeout() -> u64 {
    120
}

fn default_command_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_cleanup_interval() -> u64 {
    300
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            create_timeout_secs: default_create_timeout(),
            command_timeout_secs: default_command_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl LifecycleSection {
    /// Working directory used for a session when nothing better is known.
    pub fn working_directory_for(&self, session_id: &str) -> String {
        format!(
            "{}/projects/{}",
            self.workspace_root.trim_end_matches('/'),
            crate::util::path_safe(session_id)
        )
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Commands used to bootstrap a project inside a fresh sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default = "default_template_repo")]
    pub template_repo: String,
    #[serde(default = "default_verify_command")]
    pub verify_command: String,
    #[serde(default = "default_fallback_install")]
    pub fallback_install_command: String,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_scaffold_command")]
    pub scaffold_command: String,
    #[serde(default = "default_dev_command")]
    pub dev_command: String,
    #[serde(default = "default_dev_port")]
    pub dev_port: u16,
}

fn default_template_repo() -> String {
    "https://github.com/pria-cloud/agents.git".to_string()
}

fn default_verify_command() -> String {
    "node --version && npm --version && git --version".to_string()
}

fn default_fallback_install() -> String {
    "(sudo apt-get update && sudo apt-get install -y nodejs npm git) || (apt-get update && apt-get install -y nodejs npm git)".to_string()
}

fn default_install_command() -> String {
    "npm install --legacy-peer-deps".to_string()
}

fn default_scaffold_command() -> String {
    "npm init -y".to_string()
}

fn default_dev_command() -> String {
    "npm run dev".to_string()
}

fn default_dev_port() -> u16 {
    3000
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            template_repo: default_template_repo(),
            verify_command: default_verify_command(),
            fallback_install_command: default_fallback_install(),
            install_command: default_install_command(),
            scaffold_command: default_scaffold_command(),
            dev_command: default_dev_command(),
            dev_port: default_dev_port(),
        }
    }
}

/// Agent command run inside the sandbox for AI queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSection {
    #[serde(default = "default_ai_command")]
    pub command: String,
    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,
}

fn default_ai_command() -> String {
    "claude --print --dangerously-skip-permissions".to_string()
}

fn default_ai_timeout() -> u64 {
    120
}

impl Default for AiSection {
    fn default() -> Self {
        Self {
            command: default_ai_command(),
            timeout_secs: default_ai_timeout(),
        }
    }
}

/// The complete `.forge/sandbox.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub ai: AiSection,
}

impl SandboxSettings {
    /// Load settings from `.forge/sandbox.toml` in the project directory,
    /// then apply environment overrides. Returns defaults if the file doesn't exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = Self::config_path(project_dir);
        let mut settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            Self::default()
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".forge").join("sandbox.toml")
    }

    /// Write settings as TOML, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize sandbox settings")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Parse settings from a TOML string (no environment overrides).
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid sandbox.toml")
    }

    /// Apply `DAYTONA_*` environment variables over file values.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("DAYTONA_API_KEY")
            && !key.is_empty()
        {
            self.provider.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("DAYTONA_API_URL")
            && !url.is_empty()
        {
            self.provider.api_url = url;
        }
        if let Ok(target) = std::env::var("DAYTONA_TARGET")
            && !target.is_empty()
        {
            self.provider.target = target;
        }
    }

    /// Serialize to TOML with the API key redacted.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut copy = self.clone();
        if copy.provider.api_key.is_some() {
            copy.provider.api_key = Some("********".to_string());
        }
        toml::to_string_pretty(&copy).context("Failed to serialize sandbox settings")
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.provider.api_key.is_none() {
            warnings.push(
                "No provider API key configured: set DAYTONA_API_KEY or [provider].api_key"
                    .to_string(),
            );
        }
        if self.health.check_interval_secs == 0 {
            warnings.push("health.check_interval_secs must be greater than 0".to_string());
        }
        if self.health.probe_timeout_secs == 0 {
            warnings.push("health.probe_timeout_secs must be greater than 0".to_string());
        }
        if self.health.probe_timeout_secs >= self.health.check_interval_secs {
            warnings.push(format!(
                "health.probe_timeout_secs ({}) should be shorter than check_interval_secs ({})",
                self.health.probe_timeout_secs, self.health.check_interval_secs
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            warnings.push("circuit_breaker.failure_threshold must be greater than 0".to_string());
        }
        if self.circuit_breaker.half_open_success_threshold == 0 {
            warnings.push(
                "circuit_breaker.half_open_success_threshold must be greater than 0".to_string(),
            );
        }
        if self.recovery.max_concurrent == 0 {
            warnings.push("recovery.max_concurrent must be greater than 0".to_string());
        }
        if self.lifecycle.cleanup_interval_secs == 0 {
            warnings.push("lifecycle.cleanup_interval_secs must be greater than 0".to_string());
        }

        warnings
    }
}
