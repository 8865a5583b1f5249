//! Sandbox lifecycle manager.
//!
//! Creates, caches and reconnects sandboxes for sessions. The call path never
//! retries or recovers on its own: an unhealthy sandbox fails fast and the
//! health monitor owns recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::client::{
    CommandOptions, CommandOutput, CreateSandboxParams, PreviewLink, SandboxClient, SandboxHandle,
};
use super::events::{SandboxEvent, broadcast_event};
use super::models::*;
use super::monitor::HealthMonitor;
use super::probe::HealthProber;
use super::project::ProjectInitializer;
use super::store::SessionStore;
use crate::config::SandboxSettings;
use crate::errors::{SandboxError, SandboxResult};
use crate::util::{shell_quote, tail};

/// Tracked files listed per snapshot.
const SNAPSHOT_FILE_LIMIT: usize = 500;

/// Longest error text stored in session metadata.
const STORED_ERROR_LEN: usize = 2000;

/// Per-call overrides for `execute_command`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedSandbox {
    handle: SandboxHandle,
    working_directory: String,
    last_used: Instant,
}

/// Summary of a cached sandbox, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct CachedSandboxInfo {
    pub session_id: String,
    pub sandbox_id: String,
    pub working_directory: String,
    pub idle_secs: u64,
}

pub struct SandboxManager {
    client: Arc<dyn SandboxClient>,
    store: Arc<dyn SessionStore>,
    monitor: Arc<HealthMonitor>,
    prober: HealthProber,
    initializer: ProjectInitializer,
    settings: SandboxSettings,
    cache: Mutex<HashMap<String, CachedSandbox>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SandboxManager {
    pub fn new(
        client: Arc<dyn SandboxClient>,
        store: Arc<dyn SessionStore>,
        monitor: Arc<HealthMonitor>,
        settings: SandboxSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            prober: HealthProber::new(client.clone(), settings.health.probe_timeout()),
            initializer: ProjectInitializer::new(
                client.clone(),
                settings.project.clone(),
                settings.lifecycle.command_timeout(),
                settings.lifecycle.create_timeout(),
            ),
            client,
            store,
            monitor,
            settings,
            cache: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Cached handle for a session if the monitor still tracks that sandbox.
    ///
    /// Every cached session is registered with the monitor, so an untracked
    /// entry was either moved to another sandbox or replaced by a new session.
    async fn cached(&self, session_id: &str) -> Option<CachedSandbox> {
        let tracked = self.monitor.sandbox_id_for(session_id).await;
        let mut cache = self.cache.lock().await;
        let entry = cache.get_mut(session_id)?;
        if tracked.as_deref() != Some(entry.handle.id.as_str()) {
            tracing::debug!(
                session_id,
                stale = %entry.handle.id,
                current = ?tracked,
                "Dropping stale cached sandbox"
            );
            cache.remove(session_id);
            return None;
        }
        entry.last_used = Instant::now();
        Some(entry.clone())
    }

    async fn cache_handle(
        &self,
        session_id: &str,
        handle: &SandboxHandle,
        working_directory: &str,
    ) {
        self.cache.lock().await.insert(
            session_id.to_string(),
            CachedSandbox {
                handle: handle.clone(),
                working_directory: working_directory.to_string(),
                last_used: Instant::now(),
            },
        );
    }

    /// Persist a session update. Store failures are logged, never returned.
    async fn persist(&self, session_id: &str, patch: SessionPatch) {
        if let Err(e) = self.store.update_session(session_id, patch).await {
            tracing::warn!(session_id, error = %format!("{:#}", e), "Failed to persist session state");
        }
    }

    async fn close_quietly(&self, handle: &SandboxHandle) {
        if let Err(e) = self.client.close(handle).await {
            tracing::warn!(sandbox_id = %handle.id, error = %format!("{:#}", e), "Failed to close sandbox");
        }
    }

    // ── Create / get ─────────────────────────────────────────────────

    /// Return the session's live sandbox, creating and initializing one if needed.
    pub async fn create(
        &self,
        session_id: &str,
        context: InitialContext,
    ) -> SandboxResult<SandboxHandle> {
        if let Some(cached) = self.cached(session_id).await {
            tracing::debug!(session_id, sandbox_id = %cached.handle.id, "Reusing cached sandbox");
            return Ok(cached.handle);
        }

        let working_directory = context
            .working_directory
            .clone()
            .unwrap_or_else(|| self.settings.lifecycle.working_directory_for(session_id));

        let mut patch = SessionPatch {
            working_directory: Some(working_directory.clone()),
            workspace_id: context.workspace_id.clone(),
            user_id: context.user_id.clone(),
            status: Some(SessionStatus::Creating),
            ..SessionPatch::default()
        };
        if let Some(extra) = context.metadata.as_object() {
            patch.metadata = Some(extra.clone());
        }
        self.persist(session_id, patch).await;

        let mut params = CreateSandboxParams::from_settings(&self.settings.provider)
            .label("session_id", session_id);
        if let Some(ws) = &context.workspace_id {
            params = params.label("workspace_id", ws.clone());
        }

        tracing::info!(session_id, working_directory = %working_directory, "Creating sandbox");
        let timeout = self.settings.lifecycle.create_timeout();
        let handle = match tokio::time::timeout(timeout, self.client.create(&params)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                self.mark_error(session_id, &message).await;
                return Err(SandboxError::CreationFailed {
                    session_id: session_id.to_string(),
                    message,
                });
            }
            Err(_) => {
                self.mark_error(session_id, "sandbox creation timed out").await;
                return Err(SandboxError::Timeout {
                    operation: "create sandbox".to_string(),
                    secs: timeout.as_secs(),
                });
            }
        };

        let report = match self.initializer.initialize(&handle, &working_directory).await {
            Ok(report) => report,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(session_id, sandbox_id = %handle.id, error = %message, "Project initialization failed");
                self.close_quietly(&handle).await;
                self.mark_error(session_id, &message).await;
                return Err(SandboxError::CreationFailed {
                    session_id: session_id.to_string(),
                    message,
                });
            }
        };
        for warning in &report.warnings {
            tracing::warn!(session_id, sandbox_id = %handle.id, "{}", warning);
        }

        self.persist(
            session_id,
            SessionPatch {
                sandbox_id: Some(Some(handle.id.clone())),
                status: Some(SessionStatus::Ready),
                ..SessionPatch::default()
            }
            .with_metadata("toolchain", serde_json::json!(report.toolchain))
            .with_metadata("project_source", serde_json::json!(report.project_source))
            .with_metadata("dev_server_started", serde_json::json!(report.dev_server_started)),
        )
        .await;

        self.cache_handle(session_id, &handle, &working_directory).await;
        let initial = InitialContext {
            working_directory: Some(working_directory),
            ..context
        };
        self.monitor
            .register_sandbox(&handle.id, session_id, Some(initial))
            .await;

        tracing::info!(session_id, sandbox_id = %handle.id, "Sandbox ready");
        broadcast_event(
            self.monitor.events(),
            &SandboxEvent::SandboxCreated {
                session_id: session_id.to_string(),
                sandbox_id: handle.id.clone(),
            },
        );
        Ok(handle)
    }

    async fn mark_error(&self, session_id: &str, message: &str) {
        self.persist(
            session_id,
            SessionPatch::status(SessionStatus::Error)
                .with_metadata("last_error", serde_json::json!(tail(message, STORED_ERROR_LEN))),
        )
        .await;
    }

    /// Find the session's sandbox: cache first, then the store plus one probe.
    ///
    /// A stored sandbox that fails the probe is cleared from the store and
    /// `Ok(None)` is returned rather than a broken handle.
    pub async fn get(&self, session_id: &str) -> SandboxResult<Option<SandboxHandle>> {
        Ok(self.lookup(session_id).await?.map(|c| c.handle))
    }

    async fn lookup(&self, session_id: &str) -> SandboxResult<Option<CachedSandbox>> {
        if let Some(cached) = self.cached(session_id).await {
            return Ok(Some(cached));
        }

        let Some(session) = self
            .store
            .get_session(session_id)
            .await
            .map_err(SandboxError::Store)?
        else {
            return Ok(None);
        };
        if session.status == SessionStatus::Terminated {
            return Ok(None);
        }
        let Some(sandbox_id) = session.sandbox_id.clone() else {
            return Ok(None);
        };

        let probe = self.prober.probe(&sandbox_id).await;
        let Some(handle) = probe.handle.filter(|_| probe.success) else {
            tracing::warn!(
                session_id,
                sandbox_id = %sandbox_id,
                error = probe.error.as_deref().unwrap_or("unknown"),
                "Stored sandbox is not reachable, clearing it"
            );
            self.monitor.unregister_sandbox(session_id).await;
            self.persist(
                session_id,
                SessionPatch {
                    sandbox_id: Some(None),
                    ..SessionPatch::default()
                }
                .with_metadata("stale_sandbox_id", serde_json::json!(sandbox_id)),
            )
            .await;
            return Ok(None);
        };

        let working_directory = session
            .working_directory
            .clone()
            .unwrap_or_else(|| self.settings.lifecycle.working_directory_for(session_id));
        self.cache_handle(session_id, &handle, &working_directory).await;

        if self.monitor.sandbox_id_for(session_id).await.as_deref() != Some(handle.id.as_str()) {
            let initial = InitialContext {
                working_directory: Some(working_directory.clone()),
                workspace_id: session.workspace_id.clone(),
                user_id: session.user_id.clone(),
                metadata: serde_json::Value::Null,
            };
            self.monitor
                .register_sandbox(&handle.id, session_id, Some(initial))
                .await;
        }

        tracing::info!(session_id, sandbox_id = %handle.id, "Reconnected to stored sandbox");
        Ok(Some(CachedSandbox {
            handle,
            working_directory,
            last_used: Instant::now(),
        }))
    }

    /// A usable sandbox or an error; never waits for recovery.
    async fn require(&self, session_id: &str) -> SandboxResult<CachedSandbox> {
        if let Some(health) = self.monitor.health_of(session_id).await
            && !health.status.is_usable()
        {
            return Err(SandboxError::SandboxUnhealthy {
                session_id: session_id.to_string(),
                status: health.status.to_string(),
            });
        }
        self.lookup(session_id)
            .await?
            .ok_or_else(|| SandboxError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Run a command in the session's sandbox.
    ///
    /// A non-zero exit is returned as output, not as an error. The command is
    /// recorded as the session's `last_command`.
    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        opts: ExecOptions,
    ) -> SandboxResult<CommandOutput> {
        let sandbox = self.require(session_id).await?;
        let cwd = opts.cwd.unwrap_or_else(|| sandbox.working_directory.clone());
        let timeout = opts
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.settings.lifecycle.command_timeout());

        let output = self
            .run_bounded(&sandbox.handle, command, &cwd, timeout, "command")
            .await?;

        self.persist(
            session_id,
            SessionPatch::default().with_metadata("last_command", serde_json::json!(command)),
        )
        .await;
        tracing::debug!(session_id, exit_code = output.exit_code, "Command finished");
        Ok(output)
    }

    /// Run the configured agent command with `prompt` inside the sandbox.
    pub async fn execute_ai_query(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> SandboxResult<CommandOutput> {
        let sandbox = self.require(session_id).await?;
        let command = format!("{} {}", self.settings.ai.command, shell_quote(prompt));
        let timeout = Duration::from_secs(self.settings.ai.timeout_secs);
        self.run_bounded(
            &sandbox.handle,
            &command,
            &sandbox.working_directory,
            timeout,
            "AI query",
        )
        .await
    }

    async fn run_bounded(
        &self,
        handle: &SandboxHandle,
        command: &str,
        cwd: &str,
        timeout: Duration,
        operation: &str,
    ) -> SandboxResult<CommandOutput> {
        let opts = CommandOptions::new(Some(cwd), timeout);
        match tokio::time::timeout(timeout, self.client.run_command(handle, command, &opts)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(SandboxError::Provider(e)),
            Err(_) => Err(SandboxError::Timeout {
                operation: operation.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    // ── Terminate / preview / snapshot ───────────────────────────────

    /// Close the session's sandbox and stop tracking it. Idempotent.
    pub async fn terminate(&self, session_id: &str) -> SandboxResult<()> {
        let cached = self.cache.lock().await.remove(session_id);
        let tracked = self.monitor.sandbox_id_for(session_id).await;
        self.monitor.unregister_sandbox(session_id).await;

        let stored = match &cached {
            Some(_) => None,
            None => self
                .store
                .get_session(session_id)
                .await
                .map_err(SandboxError::Store)?
                .and_then(|s| s.sandbox_id),
        };
        let sandbox_id = cached
            .map(|c| c.handle.id)
            .or(tracked)
            .or(stored);

        if let Some(sandbox_id) = &sandbox_id {
            self.close_quietly(&SandboxHandle::new(sandbox_id.clone()))
                .await;
            tracing::info!(session_id, sandbox_id = %sandbox_id, "Sandbox terminated");
            broadcast_event(
                self.monitor.events(),
                &SandboxEvent::SandboxTerminated {
                    session_id: session_id.to_string(),
                    sandbox_id: sandbox_id.clone(),
                },
            );
        }

        self.persist(
            session_id,
            SessionPatch {
                sandbox_id: Some(None),
                status: Some(SessionStatus::Terminated),
                ..SessionPatch::default()
            },
        )
        .await;
        Ok(())
    }

    /// Public URL for a port inside the sandbox (the dev port when `None`).
    pub async fn preview_link(
        &self,
        session_id: &str,
        port: Option<u16>,
    ) -> SandboxResult<PreviewLink> {
        let sandbox = self.require(session_id).await?;
        let port = port.unwrap_or_else(|| self.initializer.dev_port());
        self.client
            .preview_link(&sandbox.handle.id, port)
            .await
            .map_err(SandboxError::Provider)
    }

    /// Record the working directory's file list and session markers as a
    /// snapshot for backup failover.
    pub async fn capture_snapshot(&self, session_id: &str) -> SandboxResult<Snapshot> {
        let sandbox = self.require(session_id).await?;
        let wd = &sandbox.working_directory;
        let timeout = self.settings.lifecycle.command_timeout();

        let git = self
            .run_bounded(&sandbox.handle, "git ls-files", wd, timeout, "list files")
            .await;
        let mut tracked_files = match git {
            Ok(out) if out.success() => parse_file_list(&out.stdout),
            _ => Vec::new(),
        };
        if tracked_files.is_empty() {
            let find = format!(
                "find . -type f -not -path './node_modules/*' -not -path './.git/*' | head -n {}",
                SNAPSHOT_FILE_LIMIT
            );
            let out = self
                .run_bounded(&sandbox.handle, &find, wd, timeout, "list files")
                .await?;
            tracked_files = parse_file_list(&out.stdout);
        }
        tracked_files.truncate(SNAPSHOT_FILE_LIMIT);

        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(SandboxError::Store)?;
        let state = ProjectState {
            working_directory: wd.clone(),
            last_command: session.as_ref().and_then(|s| s.metadata_str("last_command")),
            workflow_phase: session.as_ref().and_then(|s| s.metadata_str("workflow_phase")),
            artifacts: tracked_files
                .iter()
                .filter(|f| f.starts_with("dist/") || f.starts_with("build/"))
                .cloned()
                .collect(),
            tracked_files,
        };

        let snapshot = self
            .store
            .save_snapshot(session_id, &state)
            .await
            .map_err(SandboxError::Store)?;
        tracing::info!(
            session_id,
            snapshot_id = snapshot.id,
            files = snapshot.project_state.tracked_files.len(),
            "Snapshot captured"
        );
        Ok(snapshot)
    }

    // ── Idle cleanup ─────────────────────────────────────────────────

    pub async fn cached_sandboxes(&self) -> Vec<CachedSandboxInfo> {
        let cache = self.cache.lock().await;
        let mut list: Vec<_> = cache
            .iter()
            .map(|(session_id, c)| CachedSandboxInfo {
                session_id: session_id.clone(),
                sandbox_id: c.handle.id.clone(),
                working_directory: c.working_directory.clone(),
                idle_secs: c.last_used.elapsed().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    /// Close and evict cached sandboxes idle longer than the configured
    /// timeout. Returns how many were evicted.
    pub async fn cleanup_idle(&self) -> usize {
        let max_idle = self.settings.lifecycle.idle_timeout();
        let expired: Vec<(String, CachedSandbox)> = {
            let mut cache = self.cache.lock().await;
            let ids: Vec<String> = cache
                .iter()
                .filter(|(_, c)| c.last_used.elapsed() > max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| cache.remove(&id).map(|c| (id, c)))
                .collect()
        };

        for (session_id, cached) in &expired {
            let idle_secs = cached.last_used.elapsed().as_secs();
            tracing::info!(session_id = %session_id, sandbox_id = %cached.handle.id, idle_secs, "Evicting idle sandbox");
            self.monitor.unregister_sandbox(session_id).await;
            self.close_quietly(&cached.handle).await;
            self.persist(
                session_id,
                SessionPatch {
                    sandbox_id: Some(None),
                    ..SessionPatch::default()
                }
                .with_metadata("evicted_at", serde_json::json!(chrono::Utc::now().to_rfc3339())),
            )
            .await;
            broadcast_event(
                self.monitor.events(),
                &SandboxEvent::SandboxEvicted {
                    session_id: session_id.clone(),
                    sandbox_id: cached.handle.id.clone(),
                    idle_secs,
                },
            );
        }
        expired.len()
    }

    /// Spawn the idle-cleanup sweep.
    pub async fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.settings.lifecycle.cleanup_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = manager.cleanup_idle().await;
                        if evicted > 0 {
                            tracing::info!(evicted, "Idle sandbox sweep finished");
                        }
                    }
                }
            }
            tracing::debug!("Idle sandbox sweep stopped");
        });
        self.tasks.lock().await.push(handle);
    }

    /// Stop the sweep and forget cached handles. Sandboxes are left running.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                tracing::warn!(error = %e, "Idle sweep ended abnormally");
            }
        }
        self.cache.lock().await.clear();
    }
}

fn parse_file_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.strip_prefix("./").unwrap_or(l).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::health::HealthStatus;
    use crate::sandbox::store::SqliteSessionStore;
    use crate::sandbox::testing::MockSandboxClient;
    use tokio::sync::broadcast;

    struct Fixture {
        client: Arc<MockSandboxClient>,
        store: Arc<SqliteSessionStore>,
        manager: Arc<SandboxManager>,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(MockSandboxClient::new());
        let store = Arc::new(SqliteSessionStore::new_in_memory().unwrap());
        let mut settings = SandboxSettings::default();
        settings.recovery.restart_settle_secs = 0;
        let (tx, _) = broadcast::channel(64);
        let monitor = HealthMonitor::new(client.clone(), store.clone(), &settings, tx);
        let manager = SandboxManager::new(client.clone(), store.clone(), monitor, settings);
        Fixture {
            client,
            store,
            manager,
        }
    }

    #[tokio::test]
    async fn test_create_persists_ready_and_registers() {
        let f = fixture();
        let handle = f
            .manager
            .create("s1", InitialContext::default())
            .await
            .unwrap();
        assert_eq!(handle.id, "sb-1");

        let session = f.store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(session.sandbox_id.as_deref(), Some("sb-1"));
        assert_eq!(
            session.working_directory.as_deref(),
            Some("/home/daytona/projects/s1")
        );
        assert_eq!(session.metadata_str("project_source").as_deref(), Some("template"));

        let health = f.manager.monitor().health_of("s1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);

        let created = f.client.created();
        assert_eq!(created[0].labels.get("session_id").map(String::as_str), Some("s1"));
    }

    #[tokio::test]
    async fn test_create_returns_cached_handle() {
        let f = fixture();
        let first = f.manager.create("s1", InitialContext::default()).await.unwrap();
        let second = f.manager.create("s1", InitialContext::default()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.client.created().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_dropped_after_session_replaced() {
        let f = fixture();
        let first = f.manager.create("s1", InitialContext::default()).await.unwrap();

        let result = f
            .manager
            .monitor()
            .trigger_manual_recovery(
                "s1",
                FailureDetails::new(Some(FailureKind::Unknown), "something odd"),
            )
            .await;
        assert!(result.success, "{:?}", result.errors);
        assert!(result.new_session_id.is_some());
        assert!(!f.client.is_alive(&first.id));

        assert!(f.manager.get("s1").await.unwrap().is_none());
        assert!(f.manager.cached_sandboxes().await.is_empty());

        let again = f.manager.create("s1", InitialContext::default()).await.unwrap();
        assert_ne!(again.id, first.id);
        assert!(f.client.is_alive(&again.id));
    }

    #[tokio::test]
    async fn test_create_failure_persists_error() {
        let f = fixture();
        f.client.fail_create(Some("quota exceeded"));
        let err = f
            .manager
            .create("s1", InitialContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::CreationFailed { .. }));

        let session = f.store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.metadata_str("last_error").unwrap().contains("quota exceeded"));
        assert!(!f.manager.monitor().is_registered("s1").await);
    }

    #[tokio::test]
    async fn test_get_reconnects_from_store() {
        let f = fixture();
        f.client.add_sandbox("b9");
        f.store
            .update_session(
                "s1",
                SessionPatch {
                    sandbox_id: Some(Some("b9".into())),
                    working_directory: Some("/home/daytona/app".into()),
                    status: Some(SessionStatus::Ready),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        let handle = f.manager.get("s1").await.unwrap().unwrap();
        assert_eq!(handle.id, "b9");
        assert!(f.manager.monitor().is_registered("s1").await);
        assert_eq!(f.manager.cached_sandboxes().await[0].working_directory, "/home/daytona/app");
    }

    #[tokio::test]
    async fn test_get_clears_stale_sandbox() {
        let f = fixture();
        f.store
            .update_session(
                "s1",
                SessionPatch {
                    sandbox_id: Some(Some("gone".into())),
                    status: Some(SessionStatus::Ready),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        assert!(f.manager.get("s1").await.unwrap().is_none());
        let session = f.store.get_session("s1").await.unwrap().unwrap();
        assert!(session.sandbox_id.is_none());
        assert_eq!(session.metadata_str("stale_sandbox_id").as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn test_get_unknown_session() {
        let f = fixture();
        assert!(f.manager.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execute_command_records_last_command() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        f.client.set_output("sb-1", "ls", "package.json\n");

        let out = f
            .manager
            .execute_command("s1", "ls", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out.stdout, "package.json\n");

        let session = f.store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.metadata_str("last_command").as_deref(), Some("ls"));
        let cmd = f
            .client
            .recorded_commands()
            .into_iter()
            .rfind(|c| c.command == "ls")
            .unwrap();
        assert_eq!(cmd.cwd.as_deref(), Some("/home/daytona/projects/s1"));
    }

    #[tokio::test]
    async fn test_execute_command_fails_fast_when_unhealthy() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        f.client.fail_reconnect("sb-1", "connection refused");
        for _ in 0..3 {
            f.manager.monitor().check_session("s1").await;
        }

        let before = f.client.recorded_commands().len();
        let err = f
            .manager
            .execute_command("s1", "ls", ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SandboxUnhealthy { .. }));
        assert_eq!(f.client.recorded_commands().len(), before);
    }

    #[tokio::test]
    async fn test_execute_command_without_sandbox() {
        let f = fixture();
        let err = f
            .manager
            .execute_command("s1", "ls", ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_ai_query_quotes_prompt() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        f.manager
            .execute_ai_query("s1", "add a login page, it's urgent")
            .await
            .unwrap();
        let commands = f.client.commands_for("sb-1");
        assert!(commands.iter().any(|c| c
            == "claude --print --dangerously-skip-permissions 'add a login page, it'\\''s urgent'"));
    }

    #[tokio::test]
    async fn test_terminate_closes_and_unregisters() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        f.manager.terminate("s1").await.unwrap();

        assert_eq!(f.client.closed(), vec!["sb-1".to_string()]);
        assert!(!f.manager.monitor().is_registered("s1").await);
        let session = f.store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Terminated);
        assert!(f.manager.get("s1").await.unwrap().is_none());

        // Second call is a no-op.
        f.manager.terminate("s1").await.unwrap();
        assert_eq!(f.client.closed().len(), 1);
    }

    #[tokio::test]
    async fn test_capture_snapshot_uses_git_listing() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        f.client
            .set_output("sb-1", "git ls-files", "package.json\nsrc/app.tsx\ndist/index.js\n");
        f.store
            .update_session(
                "s1",
                SessionPatch::default().with_metadata("workflow_phase", serde_json::json!("build")),
            )
            .await
            .unwrap();

        let snapshot = f.manager.capture_snapshot("s1").await.unwrap();
        let state = &snapshot.project_state;
        assert_eq!(state.tracked_files.len(), 3);
        assert_eq!(state.artifacts, vec!["dist/index.js".to_string()]);
        assert_eq!(state.workflow_phase.as_deref(), Some("build"));
        assert_eq!(
            f.store.get_latest_snapshot("s1").await.unwrap().unwrap().id,
            snapshot.id
        );
    }

    #[tokio::test]
    async fn test_capture_snapshot_falls_back_to_find() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        f.client.fail_commands("sb-1", "git ls-files", 128, "not a git repository");
        f.client.set_output("sb-1", "find .", "./index.html\n./src/main.js\n");

        let snapshot = f.manager.capture_snapshot("s1").await.unwrap();
        assert_eq!(
            snapshot.project_state.tracked_files,
            vec!["index.html".to_string(), "src/main.js".to_string()]
        );
    }

    #[tokio::test]
    async fn test_preview_link_defaults_to_dev_port() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        let link = f.manager.preview_link("s1", None).await.unwrap();
        assert!(link.url.starts_with("https://3000-sb-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_evicts_idle_sandboxes() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        assert_eq!(f.manager.cleanup_idle().await, 0);

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert_eq!(f.manager.cleanup_idle().await, 1);
        assert!(f.manager.cached_sandboxes().await.is_empty());
        assert!(!f.manager.monitor().is_registered("s1").await);
        assert_eq!(f.client.closed(), vec!["sb-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_evicts_already_dead_sandbox() {
        let f = fixture();
        f.manager.create("s1", InitialContext::default()).await.unwrap();
        f.client.kill_sandbox("sb-1");
        tokio::time::advance(Duration::from_secs(1801)).await;
        assert_eq!(f.manager.cleanup_idle().await, 1);
    }

    #[test]
    fn test_parse_file_list() {
        assert_eq!(
            parse_file_list("./a.txt\n\n  b/c.rs \n"),
            vec!["a.txt".to_string(), "b/c.rs".to_string()]
        );
    }
}
