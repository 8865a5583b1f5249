//! Runs applicable recovery strategies in priority order until one succeeds.

use std::time::Instant;

use super::models::*;
use super::strategy::RecoveryStrategy;

pub const ALL_FAILED: &str = "all_failed";
pub const CIRCUIT_OPEN: &str = "circuit_open";
pub const RECOVERY_IN_PROGRESS: &str = "recovery_in_progress";

pub struct RecoveryChain {
    strategies: Vec<RecoveryStrategy>,
}

impl RecoveryChain {
    pub fn new(mut strategies: Vec<RecoveryStrategy>) -> Self {
        strategies.sort_by_key(|s| s.priority);
        Self { strategies }
    }

    pub fn strategies(&self) -> &[RecoveryStrategy] {
        &self.strategies
    }

    /// Strategies that accept `kind`, lowest priority first.
    pub fn applicable(&self, kind: FailureKind) -> Vec<&RecoveryStrategy> {
        self.strategies.iter().filter(|s| s.applies_to(kind)).collect()
    }

    /// Execute the chain. Always returns a result; never propagates a
    /// strategy's error, panic or timeout.
    pub async fn execute(&self, ctx: &RecoveryContext) -> RecoveryResult {
        let started = Instant::now();
        let applicable = self.applicable(ctx.failure_kind);
        let mut errors = Vec::new();
        let mut attempted = Vec::new();

        if applicable.is_empty() {
            errors.push(format!(
                "No recovery strategy applies to failure kind {}",
                ctx.failure_kind
            ));
        }

        for strategy in applicable {
            for attempt in 1..=strategy.max_attempts.max(1) {
                attempted.push(strategy.name.to_string());
                tracing::info!(
                    session_id = %ctx.session_id,
                    strategy = strategy.name,
                    attempt,
                    failure_kind = %ctx.failure_kind,
                    "Attempting recovery"
                );

                match run_attempt(strategy, ctx).await {
                    Ok(mut result) => {
                        tracing::info!(
                            session_id = %ctx.session_id,
                            strategy = strategy.name,
                            new_sandbox_id = ?result.new_sandbox_id,
                            "Recovery succeeded"
                        );
                        let mut all_errors = std::mem::take(&mut errors);
                        all_errors.append(&mut result.errors);
                        result.errors = all_errors;
                        result.strategy_used = strategy.name.to_string();
                        result.attempted_strategies = attempted;
                        result.duration_ms = started.elapsed().as_millis() as u64;
                        return result;
                    }
                    Err(message) => {
                        tracing::warn!(
                            session_id = %ctx.session_id,
                            strategy = strategy.name,
                            attempt,
                            error = %message,
                            "Recovery strategy failed"
                        );
                        errors.push(message);
                    }
                }
            }
        }

        tracing::error!(
            session_id = %ctx.session_id,
            attempted = ?attempted,
            "All recovery strategies failed, manual intervention required"
        );
        RecoveryResult {
            success: false,
            new_sandbox_id: None,
            new_session_id: None,
            context_restored: false,
            duration_ms: started.elapsed().as_millis() as u64,
            strategy_used: ALL_FAILED.to_string(),
            errors,
            warnings: vec![format!(
                "Manual intervention required: all recovery strategies failed for session {}",
                ctx.session_id
            )],
            restored_state: RestoredState::lost(),
            attempted_strategies: attempted,
        }
    }
}

/// One isolated, time-bounded strategy attempt.
///
/// Runs on its own task so a panicking procedure surfaces as a `JoinError`
/// instead of unwinding through the chain.
async fn run_attempt(
    strategy: &RecoveryStrategy,
    ctx: &RecoveryContext,
) -> Result<RecoveryResult, String> {
    let procedure = strategy.procedure.clone();
    let owned_ctx = ctx.clone();
    let mut task = tokio::spawn(async move { procedure.recover(&owned_ctx).await });

    match tokio::time::timeout(strategy.timeout, &mut task).await {
        Ok(Ok(Ok(result))) if result.success => Ok(result),
        Ok(Ok(Ok(result))) => Err(format!(
            "{}: {}",
            strategy.name,
            if result.errors.is_empty() {
                "reported failure".to_string()
            } else {
                result.errors.join("; ")
            }
        )),
        Ok(Ok(Err(e))) => Err(format!("{}: {:#}", strategy.name, e)),
        Ok(Err(join_err)) => Err(format!("{}: strategy panicked: {}", strategy.name, join_err)),
        Err(_) => {
            task.abort();
            Err(format!(
                "{}: timed out after {}s",
                strategy.name,
                strategy.timeout.as_secs()
            ))
        }
    }
}

/// Result returned without running the chain, e.g. when the breaker is open.
pub fn gated_result(reason: &str, message: impl Into<String>) -> RecoveryResult {
    RecoveryResult::failed(reason, message)
}
