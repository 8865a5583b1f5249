//! Health registry, probe scheduler and recovery dispatch.
//!
//! The monitor owns the two shared tables (health and breaker), each behind
//! its own lock. Locks are only held for bookkeeping, never across a remote
//! call. Automatic recovery is queued to a worker so a slow recovery cannot
//! delay the next scheduler tick.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerPolicy, CircuitBreaker, CircuitState};
use super::chain::{CIRCUIT_OPEN, RECOVERY_IN_PROGRESS, RecoveryChain, gated_result};
use super::client::SandboxClient;
use super::context::{ContextHints, RecoveryContextBuilder};
use super::events::{SandboxEvent, broadcast_event};
use super::health::{HealthStatus, HealthSummary, SandboxHealth, SessionHealthDetail};
use super::models::*;
use super::probe::{HealthProber, ProbeResult};
use super::store::SessionStore;
use super::strategy::{RecoveryDeps, RecoveryStrategy, default_strategies};
use crate::config::{HealthSection, SandboxSettings};

/// Queued automatic recovery.
#[derive(Debug)]
struct RecoveryJob {
    session_id: String,
    failure: FailureDetails,
}

/// Outcome of one session in a forced recovery sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecovery {
    pub session_id: String,
    pub result: RecoveryResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForceRecoverySummary {
    pub attempted: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<SessionRecovery>,
}

pub struct HealthMonitor {
    health: Mutex<HashMap<String, SandboxHealth>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    prober: HealthProber,
    context_builder: RecoveryContextBuilder,
    chain: RecoveryChain,
    store: Arc<dyn SessionStore>,
    events: broadcast::Sender<String>,
    settings: HealthSection,
    breaker_policy: BreakerPolicy,
    recovery_permits: Arc<Semaphore>,
    jobs_tx: mpsc::UnboundedSender<RecoveryJob>,
    jobs_rx: Mutex<Option<mpsc::UnboundedReceiver<RecoveryJob>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Monitor with the four built-in recovery strategies.
    pub fn new(
        client: Arc<dyn SandboxClient>,
        store: Arc<dyn SessionStore>,
        settings: &SandboxSettings,
        events: broadcast::Sender<String>,
    ) -> Arc<Self> {
        let deps = Arc::new(RecoveryDeps::new(client.clone(), store.clone(), settings));
        Self::with_strategies(client, store, settings, events, default_strategies(deps))
    }

    pub fn with_strategies(
        client: Arc<dyn SandboxClient>,
        store: Arc<dyn SessionStore>,
        settings: &SandboxSettings,
        events: broadcast::Sender<String>,
        strategies: Vec<RecoveryStrategy>,
    ) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            health: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            prober: HealthProber::new(client, settings.health.probe_timeout()),
            context_builder: RecoveryContextBuilder::new(store.clone(), settings.lifecycle.clone()),
            chain: RecoveryChain::new(strategies),
            store,
            events,
            settings: settings.health.clone(),
            breaker_policy: BreakerPolicy::from(&settings.circuit_breaker),
            recovery_permits: Arc::new(Semaphore::new(settings.recovery.max_concurrent.max(1))),
            jobs_tx,
            jobs_rx: Mutex::new(Some(jobs_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> &broadcast::Sender<String> {
        &self.events
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Start tracking a session's sandbox and probe it once immediately.
    /// Re-registering a session replaces its previous records.
    pub async fn register_sandbox(
        &self,
        sandbox_id: &str,
        session_id: &str,
        initial_context: Option<InitialContext>,
    ) {
        self.health.lock().await.insert(
            session_id.to_string(),
            SandboxHealth::new(sandbox_id, session_id, initial_context),
        );
        self.breakers
            .lock()
            .await
            .insert(session_id.to_string(), CircuitBreaker::new(self.breaker_policy));

        tracing::info!(session_id, sandbox_id, "Registered sandbox for health monitoring");
        broadcast_event(
            &self.events,
            &SandboxEvent::SandboxRegistered {
                session_id: session_id.to_string(),
                sandbox_id: sandbox_id.to_string(),
            },
        );

        self.check_session(session_id).await;
    }

    /// Stop tracking a session. Unknown sessions are ignored.
    pub async fn unregister_sandbox(&self, session_id: &str) {
        let removed = self.health.lock().await.remove(session_id).is_some();
        self.breakers.lock().await.remove(session_id);
        if removed {
            tracing::info!(session_id, "Unregistered sandbox from health monitoring");
            broadcast_event(
                &self.events,
                &SandboxEvent::SandboxUnregistered {
                    session_id: session_id.to_string(),
                },
            );
        }
    }

    pub async fn is_registered(&self, session_id: &str) -> bool {
        self.health.lock().await.contains_key(session_id)
    }

    pub async fn health_of(&self, session_id: &str) -> Option<SandboxHealth> {
        self.health.lock().await.get(session_id).cloned()
    }

    pub async fn breaker_of(&self, session_id: &str) -> Option<CircuitBreaker> {
        self.breakers.lock().await.get(session_id).cloned()
    }

    /// The sandbox currently tracked for a session.
    pub async fn sandbox_id_for(&self, session_id: &str) -> Option<String> {
        self.health
            .lock()
            .await
            .get(session_id)
            .map(|h| h.sandbox_id.clone())
    }

    // ── Probing ──────────────────────────────────────────────────────

    /// Probe every registered session concurrently and wait for all probes.
    pub async fn run_health_checks(&self) {
        let sessions: Vec<String> = self.health.lock().await.keys().cloned().collect();
        futures::future::join_all(sessions.iter().map(|id| self.check_session(id))).await;
    }

    /// Probe one session, unless a probe is already in flight or its
    /// circuit is open. Returns the probe result when a probe ran.
    pub async fn check_session(&self, session_id: &str) -> Option<ProbeResult> {
        let sandbox_id = {
            let mut health = self.health.lock().await;
            let entry = health.get_mut(session_id)?;
            if entry.probe_in_flight {
                tracing::debug!(session_id, "Previous probe still running, skipping");
                return None;
            }
            entry.probe_in_flight = true;
            entry.sandbox_id.clone()
        };

        let allowed = match self.breakers.lock().await.get_mut(session_id) {
            Some(breaker) => breaker.allows_attempt_at(Utc::now()),
            None => true,
        };
        if !allowed {
            tracing::debug!(session_id, "Circuit open, skipping probe");
            if let Some(entry) = self.health.lock().await.get_mut(session_id) {
                entry.probe_in_flight = false;
            }
            return None;
        }

        let probe = self.prober.probe(&sandbox_id).await;
        self.apply_probe(session_id, &sandbox_id, &probe).await;
        Some(probe)
    }

    async fn apply_probe(&self, session_id: &str, sandbox_id: &str, probe: &ProbeResult) {
        let error = probe.error.clone().unwrap_or_default();

        let transition = {
            let mut health = self.health.lock().await;
            let Some(entry) = health.get_mut(session_id) else {
                return;
            };
            entry.probe_in_flight = false;
            if entry.sandbox_id != sandbox_id {
                // Recovery swapped the sandbox while this probe ran.
                return;
            }
            let previous = if probe.success {
                entry.record_success(probe.latency, self.settings.degraded_latency())
            } else {
                entry.record_failure(probe.latency, &error, self.settings.degraded_latency())
            };
            (previous != entry.status).then(|| SandboxEvent::HealthChanged {
                session_id: session_id.to_string(),
                sandbox_id: sandbox_id.to_string(),
                from: previous,
                to: entry.status,
                consecutive_failures: entry.consecutive_failures,
                last_error: entry.last_error.clone(),
            })
        };

        if let Some(event) = transition {
            if let SandboxEvent::HealthChanged { from, to, .. } = &event {
                if to.is_usable() {
                    tracing::info!(session_id, sandbox_id, %from, %to, "Sandbox health changed");
                } else {
                    tracing::warn!(session_id, sandbox_id, %from, %to, error = %error, "Sandbox health degraded");
                }
            }
            broadcast_event(&self.events, &event);
        }

        let (circuit_change, circuit_blocked) = {
            let mut breakers = self.breakers.lock().await;
            match breakers.get_mut(session_id) {
                Some(breaker) => {
                    let change = if probe.success {
                        breaker.record_success()
                    } else {
                        breaker.record_failure()
                    };
                    (change, breaker.is_blocked_at(Utc::now()))
                }
                None => (None, false),
            }
        };
        if let Some(state) = circuit_change {
            if state == CircuitState::Open {
                tracing::warn!(session_id, "Circuit breaker opened");
            } else {
                tracing::info!(session_id, state = %state, "Circuit breaker state changed");
            }
            broadcast_event(
                &self.events,
                &SandboxEvent::CircuitStateChanged {
                    session_id: session_id.to_string(),
                    state,
                },
            );
        }

        if probe.success || circuit_blocked {
            return;
        }

        let should_recover = {
            let mut health = self.health.lock().await;
            match health.get_mut(session_id) {
                Some(entry)
                    if entry.consecutive_failures >= self.settings.auto_recovery_threshold
                        && entry.recovery_attempts < self.settings.max_recovery_attempts
                        && !entry.recovery_in_progress =>
                {
                    entry.recovery_attempts += 1;
                    entry.recovery_in_progress = true;
                    true
                }
                _ => false,
            }
        };

        if should_recover {
            tracing::warn!(
                session_id,
                sandbox_id,
                "Failure threshold reached, queueing automatic recovery"
            );
            let job = RecoveryJob {
                session_id: session_id.to_string(),
                failure: FailureDetails::from_message(error),
            };
            if self.jobs_tx.send(job).is_err() {
                tracing::error!(session_id, "Recovery queue closed, dropping automatic recovery");
                self.finish_recovery_flag(session_id).await;
            }
        }
    }

    // ── Recovery ─────────────────────────────────────────────────────

    /// Recover a session now and wait for the outcome.
    ///
    /// Honours the circuit breaker and refuses to overlap another recovery
    /// for the same session. Counts toward `recovery_attempts` but is not
    /// capped by `max_recovery_attempts`.
    pub async fn trigger_manual_recovery(
        &self,
        session_id: &str,
        failure: FailureDetails,
    ) -> RecoveryResult {
        self.gated_recovery(session_id, failure, RecoveryTrigger::Manual)
            .await
    }

    async fn gated_recovery(
        &self,
        session_id: &str,
        failure: FailureDetails,
        trigger: RecoveryTrigger,
    ) -> RecoveryResult {
        let blocked_until = {
            let mut breakers = self.breakers.lock().await;
            match breakers.get_mut(session_id) {
                Some(breaker) => (!breaker.allows_attempt_at(Utc::now()))
                    .then_some(breaker.next_attempt_time)
                    .flatten(),
                None => None,
            }
        };
        if let Some(until) = blocked_until {
            return gated_result(
                CIRCUIT_OPEN,
                format!(
                    "Circuit breaker open for session {} until {}",
                    session_id,
                    until.to_rfc3339()
                ),
            );
        }

        {
            let mut health = self.health.lock().await;
            if let Some(entry) = health.get_mut(session_id) {
                if entry.recovery_in_progress {
                    return gated_result(
                        RECOVERY_IN_PROGRESS,
                        format!("Recovery already in progress for session {}", session_id),
                    );
                }
                entry.recovery_in_progress = true;
                entry.recovery_attempts += 1;
            }
        }

        self.run_recovery(session_id, failure, trigger).await
    }

    /// Recover every registered session that is not Healthy.
    pub async fn force_recovery_all(&self) -> ForceRecoverySummary {
        let targets: Vec<(String, FailureDetails)> = self
            .health
            .lock()
            .await
            .values()
            .filter(|h| h.status != HealthStatus::Healthy)
            .map(|h| {
                let message = h
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("Forced recovery of {} sandbox", h.status));
                (h.session_id.clone(), FailureDetails::from_message(message))
            })
            .collect();

        tracing::info!(sessions = targets.len(), "Forcing recovery of unhealthy sandboxes");

        let permits = self.recovery_permits.clone();
        let results = futures::future::join_all(targets.into_iter().map(|(session_id, failure)| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = self
                    .gated_recovery(&session_id, failure, RecoveryTrigger::Forced)
                    .await;
                SessionRecovery { session_id, result }
            }
        }))
        .await;

        let successful = results.iter().filter(|r| r.result.success).count();
        ForceRecoverySummary {
            attempted: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        }
    }

    /// Build a context, run the chain and apply the outcome.
    /// The caller has already marked the session `recovery_in_progress`.
    async fn run_recovery(
        &self,
        session_id: &str,
        failure: FailureDetails,
        trigger: RecoveryTrigger,
    ) -> RecoveryResult {
        let hints = {
            let health = self.health.lock().await;
            health
                .get(session_id)
                .map(|h| ContextHints {
                    sandbox_id: Some(h.sandbox_id.clone()),
                    initial_context: h.initial_context.clone(),
                })
                .unwrap_or_default()
        };
        let initial_context = hints.initial_context.clone();

        let ctx = self
            .context_builder
            .build_with_hints(session_id, failure, hints)
            .await;
        broadcast_event(
            &self.events,
            &SandboxEvent::RecoveryStarted {
                session_id: session_id.to_string(),
                trigger,
                failure_kind: ctx.failure_kind,
            },
        );

        let result = self.chain.execute(&ctx).await;
        self.apply_recovery(session_id, &ctx, &result, initial_context)
            .await;

        if let Err(e) = self.store.record_recovery(session_id, trigger, &result).await {
            tracing::warn!(session_id, error = %format!("{:#}", e), "Failed to record recovery event");
        }
        broadcast_event(
            &self.events,
            &SandboxEvent::RecoveryCompleted {
                session_id: session_id.to_string(),
                trigger,
                result: result.clone(),
            },
        );
        result
    }

    async fn apply_recovery(
        &self,
        session_id: &str,
        ctx: &RecoveryContext,
        result: &RecoveryResult,
        initial_context: Option<InitialContext>,
    ) {
        if !result.success {
            self.finish_recovery_flag(session_id).await;
            return;
        }

        if let (Some(new_session), Some(new_sandbox)) =
            (&result.new_session_id, &result.new_sandbox_id)
        {
            tracing::info!(
                old_session_id = session_id,
                new_session_id = %new_session,
                "Moving health tracking to replacement session"
            );
            self.unregister_sandbox(session_id).await;
            let context = InitialContext {
                working_directory: None,
                workspace_id: ctx.workspace_id.clone(),
                user_id: ctx.user_id.clone(),
                metadata: serde_json::json!({ "recovered_from": session_id }),
            };
            self.register_sandbox(new_sandbox, new_session, Some(context))
                .await;
            return;
        }

        let swapped_sandbox = result.new_sandbox_id.clone();
        let tracked = {
            let mut health = self.health.lock().await;
            if let Some(entry) = health.get_mut(session_id) {
                if let Some(new_sandbox) = &swapped_sandbox {
                    entry.sandbox_id = new_sandbox.clone();
                    entry.response_time_ms = 0;
                }
                entry.consecutive_failures = 0;
                entry.status = HealthStatus::Healthy;
                entry.last_recovery = Some(Utc::now());
                entry.recovery_in_progress = false;
                true
            } else if let Some(new_sandbox) = &swapped_sandbox {
                // Manual recovery of a session that was never registered.
                let mut entry = SandboxHealth::new(new_sandbox, session_id, initial_context);
                entry.last_recovery = Some(Utc::now());
                health.insert(session_id.to_string(), entry);
                true
            } else {
                false
            }
        };
        // Breakers only exist alongside a health record.
        if !tracked {
            return;
        }
        {
            let mut breakers = self.breakers.lock().await;
            breakers
                .entry(session_id.to_string())
                .or_insert_with(|| CircuitBreaker::new(self.breaker_policy))
                .reset();
        }

        if swapped_sandbox.is_some() {
            self.check_session(session_id).await;
        }
    }

    async fn finish_recovery_flag(&self, session_id: &str) {
        if let Some(entry) = self.health.lock().await.get_mut(session_id) {
            entry.recovery_in_progress = false;
            entry.last_recovery = Some(Utc::now());
        }
    }

    /// Run every queued automatic recovery inline. Returns how many ran.
    ///
    /// Only useful when the background worker is not running.
    pub async fn process_pending_recoveries(&self) -> usize {
        let mut jobs = Vec::new();
        {
            let mut rx = self.jobs_rx.lock().await;
            let Some(rx) = rx.as_mut() else {
                return 0;
            };
            while let Ok(job) = rx.try_recv() {
                jobs.push(job);
            }
        }
        let count = jobs.len();
        for job in jobs {
            self.run_recovery(&job.session_id, job.failure, RecoveryTrigger::Automatic)
                .await;
        }
        count
    }

    // ── Summary ──────────────────────────────────────────────────────

    pub async fn get_health_status(&self) -> HealthSummary {
        let health: Vec<SandboxHealth> = self.health.lock().await.values().cloned().collect();
        let breakers = self.breakers.lock().await;
        let details = health
            .into_iter()
            .map(|h| SessionHealthDetail {
                circuit_state: breakers
                    .get(&h.session_id)
                    .map(|b| b.state)
                    .unwrap_or_default(),
                health: h,
            })
            .collect();
        HealthSummary::from_details(details)
    }

    // ── Background loops ─────────────────────────────────────────────

    /// Spawn the probe scheduler and the recovery worker.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let monitor = self.clone();
        tasks.push(tokio::spawn(async move { monitor.scheduler_loop().await }));

        if let Some(rx) = self.jobs_rx.lock().await.take() {
            let monitor = self.clone();
            tasks.push(tokio::spawn(async move { monitor.recovery_worker(rx).await }));
        }

        tracing::info!(
            interval_secs = self.settings.check_interval_secs,
            "Health monitor started"
        );
    }

    async fn scheduler_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick is immediate; registration already probed.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let monitor = self.clone();
                    // Not awaited: a stuck probe must not delay the next tick.
                    tokio::spawn(async move { monitor.run_health_checks().await });
                }
            }
        }
        tracing::debug!("Health scheduler stopped");
    }

    async fn recovery_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<RecoveryJob>) {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.recovery_permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let monitor = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                monitor
                    .run_recovery(&job.session_id, job.failure, RecoveryTrigger::Automatic)
                    .await;
            });
        }
        tracing::debug!("Recovery worker stopped");
    }

    /// Stop background loops and clear both tables.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                tracing::warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
        self.health.lock().await.clear();
        self.breakers.lock().await.clear();
        tracing::info!("Health monitor stopped");
    }
}
