//! Rebuilds the last-known working state of a session for recovery.

use std::sync::Arc;

use anyhow::Result;

use super::models::*;
use super::store::SessionStore;
use crate::config::LifecycleSection;

/// Infer a failure kind from error text.
///
/// This is a substring heuristic over provider and shell messages, not a
/// precise classifier. Anything unrecognised is `Unknown`, which only the
/// strategies that tolerate missing information accept.
pub fn classify_failure(message: &str) -> FailureKind {
    let msg = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["terminated", "not found", "destroyed", "404", "no such sandbox"]) {
        FailureKind::SandboxTerminated
    } else if has(&[
        "out of memory",
        "oom",
        "quota",
        "no space",
        "limit exceeded",
        "resource exhausted",
    ]) {
        FailureKind::ResourceExhaustion
    } else if has(&["timeout", "timed out", "connection", "unreachable", "refused"]) {
        FailureKind::ConnectionTimeout
    } else if has(&["command", "exit code", "non-zero", "exited with"]) {
        FailureKind::CommandFailure
    } else {
        FailureKind::Unknown
    }
}

/// Information the health monitor already holds about a session.
#[derive(Debug, Clone, Default)]
pub struct ContextHints {
    pub sandbox_id: Option<String>,
    pub initial_context: Option<InitialContext>,
}

pub struct RecoveryContextBuilder {
    store: Arc<dyn SessionStore>,
    lifecycle: LifecycleSection,
}

impl RecoveryContextBuilder {
    pub fn new(store: Arc<dyn SessionStore>, lifecycle: LifecycleSection) -> Self {
        Self { store, lifecycle }
    }

    pub async fn build(&self, session_id: &str, failure: FailureDetails) -> RecoveryContext {
        self.build_with_hints(session_id, failure, ContextHints::default())
            .await
    }

    /// Build a fresh context from the session store.
    ///
    /// Never fails: if any read fails the context degrades to a default
    /// working directory with empty file and requirement lists.
    pub async fn build_with_hints(
        &self,
        session_id: &str,
        failure: FailureDetails,
        hints: ContextHints,
    ) -> RecoveryContext {
        let failure_kind = failure
            .kind
            .unwrap_or_else(|| classify_failure(&failure.message));

        let mut context = match self.load(session_id, &hints).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(
                    session_id,
                    error = %format!("{:#}", e),
                    "Session store unavailable, recovering with minimal context"
                );
                self.minimal(session_id, &hints)
            }
        };

        context.failure_kind = failure_kind;
        context.failure = failure;
        context
    }

    fn default_working_directory(&self, session_id: &str, hints: &ContextHints) -> String {
        hints
            .initial_context
            .as_ref()
            .and_then(|c| c.working_directory.clone())
            .unwrap_or_else(|| self.lifecycle.working_directory_for(session_id))
    }

    fn minimal(&self, session_id: &str, hints: &ContextHints) -> RecoveryContext {
        let initial = hints.initial_context.as_ref();
        RecoveryContext {
            session_id: session_id.to_string(),
            sandbox_id: hints.sandbox_id.clone(),
            workspace_id: initial.and_then(|c| c.workspace_id.clone()),
            user_id: initial.and_then(|c| c.user_id.clone()),
            last_known_state: LastKnownState {
                working_directory: self.default_working_directory(session_id, hints),
                ..LastKnownState::default()
            },
            failure_kind: FailureKind::Unknown,
            failure: FailureDetails::from_message(""),
        }
    }

    async fn load(&self, session_id: &str, hints: &ContextHints) -> Result<RecoveryContext> {
        let session = self.store.get_session(session_id).await?;
        let snapshot = self.store.get_latest_snapshot(session_id).await?;
        let requirements = self.store.get_requirements(session_id).await?;

        let mut context = self.minimal(session_id, hints);
        let state = &mut context.last_known_state;
        state.requirements = requirements;

        if let Some(snapshot) = snapshot {
            let project = snapshot.project_state;
            if !project.working_directory.is_empty() {
                state.working_directory = project.working_directory;
            }
            state.tracked_files = project.tracked_files;
            state.artifacts = project.artifacts;
            state.last_command = project.last_command;
            state.workflow_phase = project.workflow_phase;
        }

        if let Some(session) = session {
            // Session metadata is newer than any snapshot.
            if let Some(cmd) = session.metadata_str("last_command") {
                state.last_command = Some(cmd);
            }
            if let Some(phase) = session.metadata_str("workflow_phase") {
                state.workflow_phase = Some(phase);
            }
            if state.tracked_files.is_empty()
                && let Some(dir) = session.working_directory.clone()
            {
                state.working_directory = dir;
            }
            if context.sandbox_id.is_none() {
                context.sandbox_id = session.sandbox_id.clone();
            }
            if session.workspace_id.is_some() {
                context.workspace_id = session.workspace_id;
            }
            if session.user_id.is_some() {
                context.user_id = session.user_id;
            }
        }

        Ok(context)
    }
}
