//! Bootstraps a project inside a freshly created sandbox.
//!
//! Used for new sessions and by the recreation strategies, so a recovered
//! sandbox comes up the same way a fresh one does.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use serde::Serialize;

use super::attempt::{Attempt, first_success};
use super::client::{CommandOptions, CommandOutput, SandboxClient, SandboxHandle};
use crate::config::ProjectSection;
use crate::util::shell_quote;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInitReport {
    pub working_directory: String,
    /// `"verified"` or `"fallback_install"`
    pub toolchain: &'static str,
    /// `"template"` or `"scaffold"`
    pub project_source: &'static str,
    pub dev_server_started: bool,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct ProjectInitializer {
    client: Arc<dyn SandboxClient>,
    project: ProjectSection,
    command_timeout: Duration,
    install_timeout: Duration,
}

impl ProjectInitializer {
    pub fn new(
        client: Arc<dyn SandboxClient>,
        project: ProjectSection,
        command_timeout: Duration,
        install_timeout: Duration,
    ) -> Self {
        Self {
            client,
            project,
            command_timeout,
            install_timeout,
        }
    }

    pub fn dev_port(&self) -> u16 {
        self.project.dev_port
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let opts = CommandOptions::new(cwd, timeout);
        tokio::time::timeout(timeout, self.client.run_command(handle, command, &opts))
            .await
            .map_err(|_| {
                anyhow::anyhow!("Command '{}' timed out after {}s", command, timeout.as_secs())
            })??
            .check(command)
    }

    /// Create the working directory, make sure the toolchain exists, populate
    /// the project and start the dev server.
    pub async fn initialize(
        &self,
        handle: &SandboxHandle,
        working_directory: &str,
    ) -> Result<ProjectInitReport> {
        let mut warnings = Vec::new();
        let wd = shell_quote(working_directory);

        self.run(handle, &format!("mkdir -p {}", wd), None, self.command_timeout)
            .await
            .context("Failed to create working directory")?;

        let toolchain = first_success(vec![
            Attempt::new(
                "verified",
                self.run(handle, &self.project.verify_command, None, self.command_timeout)
                    .boxed(),
            ),
            Attempt::new(
                "fallback_install",
                async {
                    self.run(
                        handle,
                        &self.project.fallback_install_command,
                        None,
                        self.install_timeout,
                    )
                    .await?;
                    self.run(handle, &self.project.verify_command, None, self.command_timeout)
                        .await
                }
                .boxed(),
            ),
        ])
        .await
        .context("Environment verification failed")?;
        if !toolchain.failures.is_empty() {
            tracing::warn!(sandbox_id = %handle.id, "Toolchain missing, installed manually");
            warnings.push("Toolchain verification failed; installed manually".to_string());
        }

        let clone_cmd = format!(
            "git clone --depth 1 {} {}",
            shell_quote(&self.project.template_repo),
            wd
        );
        let project = first_success(vec![
            Attempt::new(
                "template",
                async {
                    self.run(handle, &clone_cmd, None, self.install_timeout).await?;
                    self.run(
                        handle,
                        &self.project.install_command,
                        Some(working_directory),
                        self.install_timeout,
                    )
                    .await
                }
                .boxed(),
            ),
            Attempt::new(
                "scaffold",
                self.run(
                    handle,
                    &self.project.scaffold_command,
                    Some(working_directory),
                    self.command_timeout,
                )
                .boxed(),
            ),
        ])
        .await
        .context("Project initialization failed")?;
        if !project.failures.is_empty() {
            tracing::warn!(sandbox_id = %handle.id, "Template unavailable, using minimal scaffold");
            warnings.push("Template project unavailable; created minimal scaffold".to_string());
        }

        let dev_server_started = match self.start_dev_server(handle, working_directory).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(sandbox_id = %handle.id, error = %format!("{:#}", e), "Dev server did not start");
                warnings.push(format!("Dev server not started: {:#}", e));
                false
            }
        };

        Ok(ProjectInitReport {
            working_directory: working_directory.to_string(),
            toolchain: toolchain.name,
            project_source: project.name,
            dev_server_started,
            warnings,
        })
    }

    /// Launch the dev server in the background; output goes to `dev.log`.
    pub async fn start_dev_server(
        &self,
        handle: &SandboxHandle,
        working_directory: &str,
    ) -> Result<()> {
        let cmd = background_command(&self.project.dev_command);
        self.run(handle, &cmd, Some(working_directory), self.command_timeout)
            .await
            .map(|_| ())
    }
}

/// Pid of the last command started with [`background_command`], relative to
/// the working directory.
pub const BACKGROUND_PID_FILE: &str = ".forge-bg.pid";

/// Detach a long-running command so the call returns immediately.
/// Its pid is written to [`BACKGROUND_PID_FILE`].
pub fn background_command(command: &str) -> String {
    format!(
        "nohup {} > dev.log 2>&1 & echo $! > {}",
        command, BACKGROUND_PID_FILE
    )
}

/// Stop whatever [`background_command`] last started. Succeeds when nothing is running.
pub fn stop_background_command() -> String {
    format!(
        "if [ -f {pid} ]; then kill $(cat {pid}) 2>/dev/null; rm -f {pid}; fi; true",
        pid = BACKGROUND_PID_FILE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::MockSandboxClient;

    fn initializer(client: Arc<MockSandboxClient>) -> ProjectInitializer {
        ProjectInitializer::new(
            client,
            ProjectSection::default(),
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_happy_path_uses_template() {
        let client = Arc::new(MockSandboxClient::new());
        let handle = client.add_sandbox("b1");
        let report = initializer(client.clone())
            .initialize(&handle, "/home/daytona/projects/s1")
            .await
            .unwrap();

        assert_eq!(report.toolchain, "verified");
        assert_eq!(report.project_source, "template");
        assert!(report.dev_server_started);
        assert!(report.warnings.is_empty());

        let cmds = client.commands_for("b1");
        assert!(cmds[0].starts_with("mkdir -p /home/daytona/projects/s1"));
        assert!(cmds.iter().any(|c| c.starts_with("git clone --depth 1")));
        assert!(cmds.iter().any(|c| c == "npm install --legacy-peer-deps"));
        assert!(cmds.iter().any(|c| c.contains("nohup npm run dev")));
        assert!(!cmds.iter().any(|c| c.contains("apt-get")));
    }

    #[tokio::test]
    async fn test_missing_toolchain_installs_manually() {
        let client = Arc::new(MockSandboxClient::new());
        let handle = client.add_sandbox("b1");
        client.fail_commands_once("b1", "node --version", 127, "node: not found");

        let report = initializer(client.clone())
            .initialize(&handle, "/w")
            .await
            .unwrap();
        assert_eq!(report.toolchain, "fallback_install");
        assert!(report.warnings.iter().any(|w| w.contains("installed manually")));
        assert!(client.commands_for("b1").iter().any(|c| c.contains("apt-get")));
    }

    #[tokio::test]
    async fn test_clone_failure_falls_back_to_scaffold() {
        let client = Arc::new(MockSandboxClient::new());
        let handle = client.add_sandbox("b1");
        client.fail_commands("b1", "git clone", 128, "repository not reachable");

        let report = initializer(client.clone())
            .initialize(&handle, "/w")
            .await
            .unwrap();
        assert_eq!(report.project_source, "scaffold");
        assert!(client.commands_for("b1").iter().any(|c| c == "npm init -y"));
    }

    #[tokio::test]
    async fn test_everything_failing_is_an_error() {
        let client = Arc::new(MockSandboxClient::new());
        let handle = client.add_sandbox("b1");
        client.fail_commands("b1", "git clone", 128, "fatal");
        client.fail_commands("b1", "npm init", 1, "npm: not found");

        let err = initializer(client)
            .initialize(&handle, "/w")
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Project initialization failed"));
    }

    #[tokio::test]
    async fn test_dev_server_failure_is_only_a_warning() {
        let client = Arc::new(MockSandboxClient::new());
        let handle = client.add_sandbox("b1");
        client.fail_commands("b1", "nohup", 1, "port in use");

        let report = initializer(client).initialize(&handle, "/w").await.unwrap();
        assert!(!report.dev_server_started);
        assert!(report.warnings.iter().any(|w| w.contains("port in use")));
    }

    #[test]
    fn test_background_command() {
        assert_eq!(
            background_command("npm run dev"),
            "nohup npm run dev > dev.log 2>&1 & echo $! > .forge-bg.pid"
        );
    }

    #[test]
    fn test_stop_background_command_targets_pid_file() {
        let stop = stop_background_command();
        assert!(stop.contains("kill $(cat .forge-bg.pid)"));
        assert!(!stop.contains("pkill"));
        assert!(stop.ends_with("; true"));
    }
}
