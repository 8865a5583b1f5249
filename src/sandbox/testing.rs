//! Scripted test doubles for the sandbox provider and session store.
//!
//! Public so integration tests under `tests/` can drive the monitor and the
//! lifecycle manager without a real provider.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::client::{
    CommandOptions, CommandOutput, CreateSandboxParams, PreviewLink, SandboxClient, SandboxHandle,
};
use super::models::*;
use super::store::SessionStore;

#[derive(Debug, Clone)]
struct CommandRule {
    sandbox_id: String,
    pattern: String,
    exit_code: i32,
    output: String,
    remaining: Option<usize>,
    is_failure: bool,
}

impl CommandRule {
    fn matches(&self, sandbox_id: &str, command: &str) -> bool {
        (self.sandbox_id == "*" || self.sandbox_id == sandbox_id)
            && command.contains(&self.pattern)
            && self.remaining != Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub sandbox_id: String,
    pub command: String,
    pub cwd: Option<String>,
}

#[derive(Default)]
struct MockState {
    alive: HashMap<String, bool>,
    next_id: usize,
    create_error: Option<String>,
    create_errors_remaining: Option<usize>,
    reconnect_errors: HashMap<String, String>,
    rules: Vec<CommandRule>,
    commands: Vec<RecordedCommand>,
    created: Vec<CreateSandboxParams>,
    closed: Vec<String>,
    delay: Duration,
}

/// In-memory `SandboxClient` with scriptable failures.
///
/// Sandboxes are "alive" until closed or killed. Commands succeed with
/// empty output unless a rule matches; `echo X` prints `X`.
#[derive(Default)]
pub struct MockSandboxClient {
    state: Mutex<MockState>,
}

impl MockSandboxClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an existing live sandbox.
    pub fn add_sandbox(&self, id: &str) -> SandboxHandle {
        self.state().alive.insert(id.to_string(), true);
        SandboxHandle::new(id)
    }

    /// Make a sandbox disappear as if the provider destroyed it.
    pub fn kill_sandbox(&self, id: &str) {
        self.state().alive.insert(id.to_string(), false);
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.state().alive.get(id).copied().unwrap_or(false)
    }

    /// Every `create` fails with `message` until cleared with `None`.
    pub fn fail_create(&self, message: Option<&str>) {
        let mut state = self.state();
        state.create_error = message.map(str::to_string);
        state.create_errors_remaining = None;
    }

    /// The next `count` creates fail with `message`.
    pub fn fail_create_times(&self, count: usize, message: &str) {
        let mut state = self.state();
        state.create_error = Some(message.to_string());
        state.create_errors_remaining = Some(count);
    }

    /// Reconnects to `id` fail with `message` (even if the sandbox is alive).
    pub fn fail_reconnect(&self, id: &str, message: &str) {
        self.state()
            .reconnect_errors
            .insert(id.to_string(), message.to_string());
    }

    pub fn clear_reconnect_failure(&self, id: &str) {
        self.state().reconnect_errors.remove(id);
    }

    fn push_rule(
        &self,
        sandbox_id: &str,
        pattern: &str,
        exit_code: i32,
        output: &str,
        remaining: Option<usize>,
        is_failure: bool,
    ) {
        self.state().rules.push(CommandRule {
            sandbox_id: sandbox_id.to_string(),
            pattern: pattern.to_string(),
            exit_code,
            output: output.to_string(),
            remaining,
            is_failure,
        });
    }

    /// Commands containing `pattern` exit with `exit_code` and `stderr`.
    /// `sandbox_id` may be `"*"` to match every sandbox.
    pub fn fail_commands(&self, sandbox_id: &str, pattern: &str, exit_code: i32, stderr: &str) {
        self.push_rule(sandbox_id, pattern, exit_code, stderr, None, true);
    }

    pub fn fail_commands_once(
        &self,
        sandbox_id: &str,
        pattern: &str,
        exit_code: i32,
        stderr: &str,
    ) {
        self.push_rule(sandbox_id, pattern, exit_code, stderr, Some(1), true);
    }

    /// Commands containing `pattern` succeed and print `stdout`.
    pub fn set_output(&self, sandbox_id: &str, pattern: &str, stdout: &str) {
        self.push_rule(sandbox_id, pattern, 0, stdout, None, false);
    }

    pub fn clear_rules(&self) {
        self.state().rules.clear();
    }

    /// Delay applied to every remote call.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    pub fn commands_for(&self, sandbox_id: &str) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .filter(|c| c.sandbox_id == sandbox_id)
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn recorded_commands(&self) -> Vec<RecordedCommand> {
        self.state().commands.clone()
    }

    pub fn created(&self) -> Vec<CreateSandboxParams> {
        self.state().created.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.state().closed.clone()
    }

    async fn pause(&self) {
        let delay = self.state().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn not_found(id: &str) -> anyhow::Error {
    anyhow::anyhow!("Sandbox {} not found (terminated or destroyed)", id)
}

#[async_trait]
impl SandboxClient for MockSandboxClient {
    async fn create(&self, params: &CreateSandboxParams) -> Result<SandboxHandle> {
        self.pause().await;
        let mut state = self.state();
        if let Some(message) = state.create_error.clone() {
            match state.create_errors_remaining {
                Some(0) => {}
                Some(n) => {
                    state.create_errors_remaining = Some(n - 1);
                    anyhow::bail!(message);
                }
                None => anyhow::bail!(message),
            }
        }
        state.next_id += 1;
        let id = format!("sb-{}", state.next_id);
        state.alive.insert(id.clone(), true);
        state.created.push(params.clone());
        let mut handle = SandboxHandle::new(id);
        handle.labels = params.labels.clone();
        Ok(handle)
    }

    async fn reconnect(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        self.pause().await;
        let state = self.state();
        if let Some(message) = state.reconnect_errors.get(sandbox_id) {
            anyhow::bail!(message.clone());
        }
        if state.alive.get(sandbox_id).copied().unwrap_or(false) {
            Ok(SandboxHandle::new(sandbox_id))
        } else {
            Err(not_found(sandbox_id))
        }
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        opts: &CommandOptions,
    ) -> Result<CommandOutput> {
        self.pause().await;
        let mut state = self.state();
        if !state.alive.get(&handle.id).copied().unwrap_or(false) {
            return Err(not_found(&handle.id));
        }
        state.commands.push(RecordedCommand {
            sandbox_id: handle.id.clone(),
            command: command.to_string(),
            cwd: opts.cwd.clone(),
        });

        if let Some(rule) = state
            .rules
            .iter_mut()
            .find(|r| r.matches(&handle.id, command))
        {
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return Ok(if rule.is_failure {
                CommandOutput {
                    stdout: String::new(),
                    stderr: rule.output.clone(),
                    exit_code: rule.exit_code,
                }
            } else {
                CommandOutput {
                    stdout: rule.output.clone(),
                    stderr: String::new(),
                    exit_code: 0,
                }
            });
        }

        let stdout = command
            .strip_prefix("echo ")
            .map(|rest| format!("{}\n", rest))
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn close(&self, handle: &SandboxHandle) -> Result<()> {
        let mut state = self.state();
        state.alive.insert(handle.id.clone(), false);
        state.closed.push(handle.id.clone());
        Ok(())
    }

    async fn preview_link(&self, sandbox_id: &str, port: u16) -> Result<PreviewLink> {
        if !self.is_alive(sandbox_id) {
            return Err(not_found(sandbox_id));
        }
        Ok(PreviewLink {
            url: format!("https://{}-{}.preview.test", port, sandbox_id),
            token: Some("preview-token".to_string()),
        })
    }
}

/// A session store whose every call fails.
pub struct FailingSessionStore;

#[async_trait]
impl SessionStore for FailingSessionStore {
    async fn get_session(&self, _session_id: &str) -> Result<Option<SessionRecord>> {
        anyhow::bail!("session store unavailable")
    }

    async fn update_session(&self, _session_id: &str, _patch: SessionPatch) -> Result<()> {
        anyhow::bail!("session store unavailable")
    }

    async fn get_latest_snapshot(&self, _session_id: &str) -> Result<Option<Snapshot>> {
        anyhow::bail!("session store unavailable")
    }

    async fn save_snapshot(&self, _session_id: &str, _state: &ProjectState) -> Result<Snapshot> {
        anyhow::bail!("session store unavailable")
    }

    async fn get_requirements(&self, _session_id: &str) -> Result<Vec<Requirement>> {
        anyhow::bail!("session store unavailable")
    }

    async fn record_recovery(
        &self,
        _session_id: &str,
        _trigger: RecoveryTrigger,
        _result: &RecoveryResult,
    ) -> Result<()> {
        anyhow::bail!("session store unavailable")
    }
}
