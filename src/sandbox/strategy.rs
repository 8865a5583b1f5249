//! Recovery strategies and their remediation procedures.
//!
//! | priority | strategy                        | failure kinds                              | new sandbox |
//! |----------|---------------------------------|--------------------------------------------|-------------|
//! | 1        | `restart_in_place`              | connection_timeout, command_failure        | no          |
//! | 2        | `context_preserving_recreation` | sandbox_terminated, resource_exhaustion    | yes         |
//! | 3        | `clean_slate_recovery`          | unknown, resource_exhaustion               | yes         |
//! | 4        | `backup_failover`               | sandbox_terminated, connection_timeout     | yes         |

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::client::{CommandOptions, CreateSandboxParams, SandboxClient, SandboxHandle};
use super::models::*;
use super::probe::HealthProber;
use super::project::{ProjectInitializer, background_command, stop_background_command};
use super::store::SessionStore;
use crate::config::{LifecycleSection, SandboxSettings};
use crate::util::shell_quote;

pub const RESTART_IN_PLACE: &str = "restart_in_place";
pub const CONTEXT_PRESERVING_RECREATION: &str = "context_preserving_recreation";
pub const CLEAN_SLATE_RECOVERY: &str = "clean_slate_recovery";
pub const BACKUP_FAILOVER: &str = "backup_failover";

/// Manifest written into a recovered working directory.
pub const RECOVERY_MANIFEST: &str = ".forge-recovery.json";

pub const CLEAN_SLATE_WARNING: &str = "Clean slate recovery completed - all previous context lost";

#[async_trait]
pub trait RecoveryProcedure: Send + Sync {
    /// Attempt the remediation. `Err` and `Ok` with `success == false` both
    /// count as a failed attempt.
    async fn recover(&self, ctx: &RecoveryContext) -> Result<RecoveryResult>;
}

#[derive(Clone)]
pub struct RecoveryStrategy {
    pub name: &'static str,
    /// Lower runs first.
    pub priority: u8,
    pub applicable_failure_types: Vec<FailureKind>,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub requires_new_sandbox: bool,
    pub preserves_context: bool,
    pub procedure: Arc<dyn RecoveryProcedure>,
}

impl RecoveryStrategy {
    pub fn applies_to(&self, kind: FailureKind) -> bool {
        self.applicable_failure_types.contains(&kind)
    }
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("applicable_failure_types", &self.applicable_failure_types)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Collaborators shared by the built-in procedures.
pub struct RecoveryDeps {
    pub client: Arc<dyn SandboxClient>,
    pub store: Arc<dyn SessionStore>,
    pub prober: HealthProber,
    pub initializer: ProjectInitializer,
    pub base_params: CreateSandboxParams,
    pub lifecycle: LifecycleSection,
    pub restart_settle: Duration,
}

impl RecoveryDeps {
    pub fn new(
        client: Arc<dyn SandboxClient>,
        store: Arc<dyn SessionStore>,
        settings: &SandboxSettings,
    ) -> Self {
        Self {
            prober: HealthProber::new(client.clone(), settings.health.probe_timeout()),
            initializer: ProjectInitializer::new(
                client.clone(),
                settings.project.clone(),
                settings.lifecycle.command_timeout(),
                settings.lifecycle.create_timeout(),
            ),
            base_params: CreateSandboxParams::from_settings(&settings.provider),
            lifecycle: settings.lifecycle.clone(),
            restart_settle: Duration::from_secs(settings.recovery.restart_settle_secs),
            client,
            store,
        }
    }

    fn command_opts(&self, cwd: &str) -> CommandOptions {
        CommandOptions::new(Some(cwd), self.lifecycle.command_timeout())
    }

    async fn create_sandbox(&self, params: &CreateSandboxParams) -> Result<SandboxHandle> {
        let timeout = self.lifecycle.create_timeout();
        tokio::time::timeout(timeout, self.client.create(params))
            .await
            .map_err(|_| {
                anyhow::anyhow!("Sandbox creation timed out after {}s", timeout.as_secs())
            })?
            .context("Failed to create sandbox")
    }

    /// Create and initialize a sandbox; closes it again if initialization fails.
    async fn provision(
        &self,
        params: &CreateSandboxParams,
        working_directory: &str,
    ) -> Result<(SandboxHandle, Vec<String>)> {
        let handle = self.create_sandbox(params).await?;
        match self.initializer.initialize(&handle, working_directory).await {
            Ok(report) => Ok((handle, report.warnings)),
            Err(e) => {
                self.close_quietly(&handle).await;
                Err(e)
            }
        }
    }

    async fn close_quietly(&self, handle: &SandboxHandle) {
        if let Err(e) = self.client.close(handle).await {
            tracing::warn!(sandbox_id = %handle.id, error = %format!("{:#}", e), "Failed to close sandbox");
        }
    }

    /// Best-effort cleanup of the sandbox a session used before recovery.
    async fn retire_old_sandbox(&self, ctx: &RecoveryContext) {
        if let Some(old) = &ctx.sandbox_id {
            self.close_quietly(&SandboxHandle::new(old.clone())).await;
        }
    }

    /// Write the recovery manifest and recreate the tracked file list.
    /// Returns the number of tracked files replayed.
    async fn replay_state(
        &self,
        handle: &SandboxHandle,
        working_directory: &str,
        tracked_files: &[String],
        workflow_phase: Option<&str>,
    ) -> Result<usize> {
        let manifest = serde_json::json!({
            "tracked_files": tracked_files,
            "workflow_phase": workflow_phase,
            "restored_at": chrono::Utc::now().to_rfc3339(),
        });
        let mut script = format!(
            "printf '%s' {} > {}",
            shell_quote(&manifest.to_string()),
            RECOVERY_MANIFEST
        );
        for file in tracked_files {
            let quoted = shell_quote(file);
            script.push_str(&format!(" && mkdir -p \"$(dirname {q})\" && touch {q}", q = quoted));
        }

        self.client
            .run_command(handle, &script, &self.command_opts(working_directory))
            .await?
            .check("replay recovery state")?;
        Ok(tracked_files.len())
    }

    fn recovery_params(&self, ctx: &RecoveryContext, session_id: &str) -> CreateSandboxParams {
        let mut params = self
            .base_params
            .clone()
            .label("session_id", session_id)
            .label("recovered", "true");
        if let Some(ws) = &ctx.workspace_id {
            params = params.label("workspace_id", ws.clone());
        }
        params
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ── restart_in_place ──────────────────────────────────────────────────

pub struct RestartInPlace {
    deps: Arc<RecoveryDeps>,
}

#[async_trait]
impl RecoveryProcedure for RestartInPlace {
    async fn recover(&self, ctx: &RecoveryContext) -> Result<RecoveryResult> {
        let started = Instant::now();
        let sandbox_id = ctx
            .sandbox_id
            .as_deref()
            .context("No sandbox id recorded for session")?;
        let deps = &self.deps;
        let wd = &ctx.last_known_state.working_directory;

        let handle = deps
            .client
            .reconnect(sandbox_id)
            .await
            .with_context(|| format!("Reconnect to {} failed", sandbox_id))?;

        let mut commands_replayed = 0;
        let mut warnings = Vec::new();
        if let Some(cmd) = &ctx.last_known_state.last_command {
            let stop = stop_background_command();
            if let Err(e) = deps.client.run_command(&handle, &stop, &deps.command_opts(wd)).await {
                warnings.push(format!("Could not stop hung processes: {:#}", e));
            }
            deps.client
                .run_command(&handle, &background_command(cmd), &deps.command_opts(wd))
                .await?
                .check(cmd)?;
            commands_replayed = 1;
        }

        tokio::time::sleep(deps.restart_settle).await;

        let probe = deps.prober.probe(sandbox_id).await;
        if !probe.success {
            anyhow::bail!(
                "Re-probe after restart failed: {}",
                probe.error.unwrap_or_default()
            );
        }

        Ok(RecoveryResult {
            success: true,
            new_sandbox_id: None,
            new_session_id: None,
            context_restored: true,
            duration_ms: elapsed_ms(started),
            strategy_used: RESTART_IN_PLACE.to_string(),
            errors: Vec::new(),
            warnings,
            restored_state: RestoredState {
                files_recovered: ctx.last_known_state.tracked_files.len(),
                commands_replayed,
                context_integrity: ContextIntegrity::Full,
            },
            attempted_strategies: Vec::new(),
        })
    }
}

// ── context_preserving_recreation ─────────────────────────────────────

pub struct ContextPreservingRecreation {
    deps: Arc<RecoveryDeps>,
}

#[async_trait]
impl RecoveryProcedure for ContextPreservingRecreation {
    async fn recover(&self, ctx: &RecoveryContext) -> Result<RecoveryResult> {
        let started = Instant::now();
        let deps = &self.deps;
        let state = &ctx.last_known_state;
        let params = deps.recovery_params(ctx, &ctx.session_id);

        let (handle, mut warnings) = deps.provision(&params, &state.working_directory).await?;

        let files_recovered = match deps
            .replay_state(
                &handle,
                &state.working_directory,
                &state.tracked_files,
                state.workflow_phase.as_deref(),
            )
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warnings.push(format!("Context replay incomplete: {:#}", e));
                0
            }
        };

        deps.store
            .update_session(
                &ctx.session_id,
                SessionPatch {
                    sandbox_id: Some(Some(handle.id.clone())),
                    working_directory: Some(state.working_directory.clone()),
                    status: Some(SessionStatus::Recovered),
                    ..SessionPatch::default()
                },
            )
            .await
            .context("Failed to persist recovered sandbox")?;

        deps.retire_old_sandbox(ctx).await;

        Ok(RecoveryResult {
            success: true,
            new_sandbox_id: Some(handle.id),
            new_session_id: None,
            context_restored: files_recovered > 0 || state.workflow_phase.is_some(),
            duration_ms: elapsed_ms(started),
            strategy_used: CONTEXT_PRESERVING_RECREATION.to_string(),
            errors: Vec::new(),
            warnings,
            restored_state: RestoredState {
                files_recovered,
                commands_replayed: 0,
                // Only the file list comes back, never the contents.
                context_integrity: ContextIntegrity::Partial,
            },
            attempted_strategies: Vec::new(),
        })
    }
}

// ── clean_slate_recovery ──────────────────────────────────────────────

pub struct CleanSlateRecovery {
    deps: Arc<RecoveryDeps>,
}

#[async_trait]
impl RecoveryProcedure for CleanSlateRecovery {
    async fn recover(&self, ctx: &RecoveryContext) -> Result<RecoveryResult> {
        let started = Instant::now();
        let deps = &self.deps;
        let new_session_id = uuid::Uuid::new_v4().to_string();
        let working_directory = deps.lifecycle.working_directory_for(&new_session_id);
        let params = deps
            .recovery_params(ctx, &new_session_id)
            .label("recovered_from", ctx.session_id.clone());

        let (handle, mut warnings) = deps.provision(&params, &working_directory).await?;

        deps.store
            .update_session(
                &new_session_id,
                SessionPatch {
                    sandbox_id: Some(Some(handle.id.clone())),
                    working_directory: Some(working_directory),
                    workspace_id: ctx.workspace_id.clone(),
                    user_id: ctx.user_id.clone(),
                    status: Some(SessionStatus::Ready),
                    metadata: None,
                }
                .with_metadata("recovered_from", serde_json::json!(ctx.session_id)),
            )
            .await
            .context("Failed to persist replacement session")?;

        if let Err(e) = deps
            .store
            .update_session(
                &ctx.session_id,
                SessionPatch {
                    sandbox_id: Some(None),
                    status: Some(SessionStatus::Terminated),
                    ..SessionPatch::default()
                }
                .with_metadata("replaced_by", serde_json::json!(new_session_id)),
            )
            .await
        {
            warnings.push(format!("Could not mark old session terminated: {:#}", e));
        }

        deps.retire_old_sandbox(ctx).await;
        warnings.insert(0, CLEAN_SLATE_WARNING.to_string());

        Ok(RecoveryResult {
            success: true,
            new_sandbox_id: Some(handle.id),
            new_session_id: Some(new_session_id),
            context_restored: false,
            duration_ms: elapsed_ms(started),
            strategy_used: CLEAN_SLATE_RECOVERY.to_string(),
            errors: Vec::new(),
            warnings,
            restored_state: RestoredState::lost(),
            attempted_strategies: Vec::new(),
        })
    }
}

// ── backup_failover ───────────────────────────────────────────────────

pub struct BackupFailover {
    deps: Arc<RecoveryDeps>,
}

#[async_trait]
impl RecoveryProcedure for BackupFailover {
    async fn recover(&self, ctx: &RecoveryContext) -> Result<RecoveryResult> {
        let started = Instant::now();
        let deps = &self.deps;

        let snapshot = deps
            .store
            .get_latest_snapshot(&ctx.session_id)
            .await
            .context("Failed to read snapshots")?
            .with_context(|| {
                format!("No backup snapshots available for session {}", ctx.session_id)
            })?;
        let project = &snapshot.project_state;
        let working_directory = if project.working_directory.is_empty() {
            ctx.last_known_state.working_directory.clone()
        } else {
            project.working_directory.clone()
        };

        let params = deps
            .recovery_params(ctx, &ctx.session_id)
            .label("restored_from_snapshot", snapshot.id.to_string());
        let (handle, mut warnings) = deps.provision(&params, &working_directory).await?;

        let files_recovered = match deps
            .replay_state(
                &handle,
                &working_directory,
                &project.tracked_files,
                project.workflow_phase.as_deref(),
            )
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warnings.push(format!("Snapshot replay incomplete: {:#}", e));
                0
            }
        };

        let mut commands_replayed = 0;
        if let Some(cmd) = &project.last_command {
            match deps
                .client
                .run_command(
                    &handle,
                    &background_command(cmd),
                    &deps.command_opts(&working_directory),
                )
                .await
                .and_then(|out| out.check(cmd))
            {
                Ok(_) => commands_replayed = 1,
                Err(e) => warnings.push(format!("Could not replay last command: {:#}", e)),
            }
        }

        deps.store
            .update_session(
                &ctx.session_id,
                SessionPatch {
                    sandbox_id: Some(Some(handle.id.clone())),
                    working_directory: Some(working_directory),
                    status: Some(SessionStatus::Recovered),
                    ..SessionPatch::default()
                }
                .with_metadata("restored_from_snapshot", serde_json::json!(snapshot.id)),
            )
            .await
            .context("Failed to persist recovered sandbox")?;

        deps.retire_old_sandbox(ctx).await;

        Ok(RecoveryResult {
            success: true,
            new_sandbox_id: Some(handle.id),
            new_session_id: None,
            context_restored: true,
            duration_ms: elapsed_ms(started),
            strategy_used: BACKUP_FAILOVER.to_string(),
            errors: Vec::new(),
            warnings,
            restored_state: RestoredState {
                files_recovered,
                commands_replayed,
                // Snapshots hold the file list, not file contents.
                context_integrity: ContextIntegrity::Partial,
            },
            attempted_strategies: Vec::new(),
        })
    }
}

/// The four built-in strategies, in priority order.
pub fn default_strategies(deps: Arc<RecoveryDeps>) -> Vec<RecoveryStrategy> {
    let light = Duration::from_secs(60);
    let heavy = deps.lifecycle.create_timeout() * 2;
    vec![
        RecoveryStrategy {
            name: RESTART_IN_PLACE,
            priority: 1,
            applicable_failure_types: vec![
                FailureKind::ConnectionTimeout,
                FailureKind::CommandFailure,
            ],
            max_attempts: 2,
            timeout: light,
            requires_new_sandbox: false,
            preserves_context: true,
            procedure: Arc::new(RestartInPlace { deps: deps.clone() }),
        },
        RecoveryStrategy {
            name: CONTEXT_PRESERVING_RECREATION,
            priority: 2,
            applicable_failure_types: vec![
                FailureKind::SandboxTerminated,
                FailureKind::ResourceExhaustion,
            ],
            max_attempts: 1,
            timeout: heavy,
            requires_new_sandbox: true,
            preserves_context: true,
            procedure: Arc::new(ContextPreservingRecreation { deps: deps.clone() }),
        },
        RecoveryStrategy {
            name: CLEAN_SLATE_RECOVERY,
            priority: 3,
            applicable_failure_types: vec![FailureKind::Unknown, FailureKind::ResourceExhaustion],
            max_attempts: 1,
            timeout: heavy,
            requires_new_sandbox: true,
            preserves_context: false,
            procedure: Arc::new(CleanSlateRecovery { deps: deps.clone() }),
        },
        RecoveryStrategy {
            name: BACKUP_FAILOVER,
            priority: 4,
            applicable_failure_types: vec![
                FailureKind::SandboxTerminated,
                FailureKind::ConnectionTimeout,
            ],
            max_attempts: 1,
            timeout: heavy,
            requires_new_sandbox: true,
            preserves_context: true,
            procedure: Arc::new(BackupFailover { deps }),
        },
    ]
}
