use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Session store records ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Ready,
    Error,
    Recovered,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Recovered => "recovered",
            Self::Terminated => "terminated",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            "recovered" => Ok(Self::Recovered),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// A development session as persisted by the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub sandbox_id: Option<String>,
    pub working_directory: Option<String>,
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
    pub status: SessionStatus,
    /// Opaque JSON object; only `last_command` and `workflow_phase` are read here.
    pub metadata: serde_json::Value,
    pub updated_at: String,
}

impl SessionRecord {
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Partial update for a session. Unset fields are left untouched.
///
/// `sandbox_id: Some(None)` clears the stored sandbox id. `metadata` is merged
/// key by key into the existing object.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub sandbox_id: Option<Option<String>>,
    pub working_directory: Option<String>,
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.to_string(), value);
        self
    }
}

/// Working-directory state captured in a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectState {
    pub working_directory: String,
    pub tracked_files: Vec<String>,
    pub last_command: Option<String>,
    pub workflow_phase: Option<String>,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub session_id: String,
    pub project_state: ProjectState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub id: String,
    pub title: String,
    pub status: String,
}

// ── Failure classification ────────────────────────────────────────────

/// Failure kinds used to pick applicable recovery strategies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionTimeout,
    CommandFailure,
    ResourceExhaustion,
    SandboxTerminated,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionTimeout => "connection_timeout",
            Self::CommandFailure => "command_failure",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::SandboxTerminated => "sandbox_terminated",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connection_timeout" => Ok(Self::ConnectionTimeout),
            "command_failure" => Ok(Self::CommandFailure),
            "resource_exhaustion" => Ok(Self::ResourceExhaustion),
            "sandbox_terminated" => Ok(Self::SandboxTerminated),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid failure kind: {}", s)),
        }
    }
}

/// What went wrong, as reported by a probe or by a manual-recovery caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetails {
    /// Explicit kind; when absent it is inferred from `message`.
    #[serde(rename = "failure_type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl FailureDetails {
    pub fn new(kind: Option<FailureKind>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

/// Optional context handed to the health monitor at registration time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialContext {
    pub working_directory: Option<String>,
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: serde_json::Value,
}

// ── Recovery context and results ──────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastKnownState {
    pub working_directory: String,
    pub tracked_files: Vec<String>,
    pub last_command: Option<String>,
    pub workflow_phase: Option<String>,
    pub requirements: Vec<Requirement>,
    pub artifacts: Vec<String>,
}

/// Everything a recovery strategy knows about the session it is repairing.
/// Rebuilt from the session store for every recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub session_id: String,
    pub sandbox_id: Option<String>,
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
    pub last_known_state: LastKnownState,
    pub failure_kind: FailureKind,
    pub failure: FailureDetails,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextIntegrity {
    Full,
    Partial,
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoredState {
    pub files_recovered: usize,
    pub commands_replayed: usize,
    pub context_integrity: ContextIntegrity,
}

impl RestoredState {
    pub fn lost() -> Self {
        Self {
            files_recovered: 0,
            commands_replayed: 0,
            context_integrity: ContextIntegrity::Lost,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub new_sandbox_id: Option<String>,
    /// Set when recovery moved the work to a brand-new session.
    pub new_session_id: Option<String>,
    pub context_restored: bool,
    pub duration_ms: u64,
    pub strategy_used: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub restored_state: RestoredState,
    pub attempted_strategies: Vec<String>,
}

impl RecoveryResult {
    /// A failed result carrying a single error.
    pub fn failed(strategy: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            new_sandbox_id: None,
            new_session_id: None,
            context_restored: false,
            duration_ms: 0,
            strategy_used: strategy.to_string(),
            errors: vec![error.into()],
            warnings: Vec::new(),
            restored_state: RestoredState::lost(),
            attempted_strategies: Vec::new(),
        }
    }
}

/// What caused a recovery run; stored with the audit record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    Automatic,
    Manual,
    Forced,
}

impl RecoveryTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Forced => "forced",
        }
    }
}

/// A persisted recovery audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub id: i64,
    pub session_id: String,
    pub trigger: String,
    pub strategy_used: String,
    pub success: bool,
    pub new_sandbox_id: Option<String>,
    pub new_session_id: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub created_at: String,
}
