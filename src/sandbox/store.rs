//! Session store contract and its SQLite implementation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Keyed persistence for sessions, snapshots, requirements and recovery audit.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Upsert a session, merging `patch.metadata` into the stored object.
    async fn update_session(&self, session_id: &str, patch: SessionPatch) -> Result<()>;

    async fn get_latest_snapshot(&self, session_id: &str) -> Result<Option<Snapshot>>;

    async fn save_snapshot(&self, session_id: &str, state: &ProjectState) -> Result<Snapshot>;

    async fn get_requirements(&self, session_id: &str) -> Result<Vec<Requirement>>;

    async fn record_recovery(
        &self,
        session_id: &str,
        trigger: RecoveryTrigger,
        result: &RecoveryResult,
    ) -> Result<()>;
}

/// Async-safe handle to the session database.
///
/// Runs every call on tokio's blocking pool so SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SessionDb>>,
}

impl DbHandle {
    pub fn new(db: SessionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SessionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, SessionDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct SessionDb {
    conn: Connection,
}

impl SessionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    sandbox_id TEXT,
                    working_directory TEXT,
                    workspace_id TEXT,
                    user_id TEXT,
                    status TEXT NOT NULL DEFAULT 'creating',
                    metadata TEXT NOT NULL DEFAULT '{}',
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    project_state TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS requirements (
                    id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    position INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (session_id, id)
                );

                CREATE TABLE IF NOT EXISTS recovery_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    trigger_kind TEXT NOT NULL,
                    strategy_used TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    new_sandbox_id TEXT,
                    new_session_id TEXT,
                    errors TEXT NOT NULL DEFAULT '[]',
                    warnings TEXT NOT NULL DEFAULT '[]',
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_snapshots_session ON snapshots(session_id, id);
                CREATE INDEX IF NOT EXISTS idx_recovery_events_session ON recovery_events(session_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.conn
            .query_row(
                "SELECT session_id, sandbox_id, working_directory, workspace_id, user_id,
                        status, metadata, updated_at
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query session")?
            .map(|row| -> Result<SessionRecord> {
                let (
                    session_id,
                    sandbox_id,
                    working_directory,
                    workspace_id,
                    user_id,
                    status,
                    metadata,
                    updated_at,
                ) = row;
                let status = status.parse::<SessionStatus>().map_err(|e| anyhow::anyhow!(e))?;
                let metadata = serde_json::from_str(&metadata).context("Corrupt session metadata")?;
                Ok(SessionRecord {
                    session_id,
                    sandbox_id,
                    working_directory,
                    workspace_id,
                    user_id,
                    status,
                    metadata,
                    updated_at,
                })
            })
            .transpose()
    }

    pub fn update_session(&self, session_id: &str, patch: &SessionPatch) -> Result<()> {
        let existing = self.get_session(session_id)?;

        let mut metadata = existing
            .as_ref()
            .and_then(|s| s.metadata.as_object().cloned())
            .unwrap_or_default();
        if let Some(extra) = &patch.metadata {
            for (k, v) in extra {
                metadata.insert(k.clone(), v.clone());
            }
        }
        let metadata = serde_json::Value::Object(metadata).to_string();

        let sandbox_id = match &patch.sandbox_id {
            Some(value) => value.clone(),
            None => existing.as_ref().and_then(|s| s.sandbox_id.clone()),
        };
        let working_directory = patch
            .working_directory
            .clone()
            .or_else(|| existing.as_ref().and_then(|s| s.working_directory.clone()));
        let workspace_id = patch
            .workspace_id
            .clone()
            .or_else(|| existing.as_ref().and_then(|s| s.workspace_id.clone()));
        let user_id = patch
            .user_id
            .clone()
            .or_else(|| existing.as_ref().and_then(|s| s.user_id.clone()));
        let status = patch
            .status
            .or_else(|| existing.as_ref().map(|s| s.status))
            .unwrap_or(SessionStatus::Creating);

        self.conn
            .execute(
                "INSERT INTO sessions
                    (session_id, sandbox_id, working_directory, workspace_id, user_id, status, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
                 ON CONFLICT(session_id) DO UPDATE SET
                    sandbox_id = excluded.sandbox_id,
                    working_directory = excluded.working_directory,
                    workspace_id = excluded.workspace_id,
                    user_id = excluded.user_id,
                    status = excluded.status,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at",
                params![
                    session_id,
                    sandbox_id,
                    working_directory,
                    workspace_id,
                    user_id,
                    status.as_str(),
                    metadata
                ],
            )
            .context("Failed to upsert session")?;
        Ok(())
    }

    pub fn get_latest_snapshot(&self, session_id: &str) -> Result<Option<Snapshot>> {
        self.conn
            .query_row(
                "SELECT id, session_id, project_state, created_at FROM snapshots
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query snapshot")?
            .map(|(id, session_id, state, created_at)| -> Result<Snapshot> {
                Ok(Snapshot {
                    id,
                    session_id,
                    project_state: serde_json::from_str(&state)
                        .context("Corrupt snapshot project state")?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .context("Corrupt snapshot timestamp")?
                        .with_timezone(&Utc),
                })
            })
            .transpose()
    }

    pub fn save_snapshot(&self, session_id: &str, state: &ProjectState) -> Result<Snapshot> {
        let created_at = Utc::now();
        let json = serde_json::to_string(state).context("Failed to serialize project state")?;
        self.conn
            .execute(
                "INSERT INTO snapshots (session_id, project_state, created_at) VALUES (?1, ?2, ?3)",
                params![session_id, json, created_at.to_rfc3339()],
            )
            .context("Failed to insert snapshot")?;
        Ok(Snapshot {
            id: self.conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            project_state: state.clone(),
            created_at,
        })
    }

    pub fn get_requirements(&self, session_id: &str) -> Result<Vec<Requirement>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, status FROM requirements WHERE session_id = ?1 ORDER BY position, id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(Requirement {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    status: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query requirements")?;
        Ok(rows)
    }

    /// Insert or replace a requirement. Requirements are written by the
    /// requirement-gathering workflow; this subsystem only reads them.
    pub fn upsert_requirement(
        &self,
        session_id: &str,
        req: &Requirement,
        position: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO requirements (id, session_id, title, status, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id, id) DO UPDATE SET
                    title = excluded.title, status = excluded.status, position = excluded.position",
                params![req.id, session_id, req.title, req.status, position],
            )
            .context("Failed to upsert requirement")?;
        Ok(())
    }

    pub fn record_recovery(
        &self,
        session_id: &str,
        trigger: RecoveryTrigger,
        result: &RecoveryResult,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO recovery_events
                    (session_id, trigger_kind, strategy_used, success, new_sandbox_id,
                     new_session_id, errors, warnings, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session_id,
                    trigger.as_str(),
                    result.strategy_used,
                    result.success,
                    result.new_sandbox_id,
                    result.new_session_id,
                    serde_json::to_string(&result.errors)?,
                    serde_json::to_string(&result.warnings)?,
                    result.duration_ms as i64
                ],
            )
            .context("Failed to insert recovery event")?;
        Ok(())
    }

    pub fn list_recovery_events(&self, session_id: &str) -> Result<Vec<RecoveryEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, trigger_kind, strategy_used, success, new_sandbox_id,
                    new_session_id, errors, warnings, duration_ms, created_at
             FROM recovery_events WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    RecoveryEvent {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        trigger: row.get(2)?,
                        strategy_used: row.get(3)?,
                        success: row.get(4)?,
                        new_sandbox_id: row.get(5)?,
                        new_session_id: row.get(6)?,
                        errors: Vec::new(),
                        warnings: Vec::new(),
                        duration_ms: row.get::<_, i64>(9)? as u64,
                        created_at: row.get(10)?,
                    },
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query recovery events")?;

        rows.into_iter()
            .map(|(mut event, errors, warnings)| {
                event.errors = serde_json::from_str(&errors)?;
                event.warnings = serde_json::from_str(&warnings)?;
                Ok(event)
            })
            .collect()
    }
}

/// `SessionStore` backed by SQLite.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: DbHandle,
}

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        Ok(Self {
            db: DbHandle::new(SessionDb::new(path)?),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self {
            db: DbHandle::new(SessionDb::new_in_memory()?),
        })
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }

    pub async fn list_recovery_events(&self, session_id: &str) -> Result<Vec<RecoveryEvent>> {
        let id = session_id.to_string();
        self.db.call(move |db| db.list_recovery_events(&id)).await
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let id = session_id.to_string();
        self.db.call(move |db| db.get_session(&id)).await
    }

    async fn update_session(&self, session_id: &str, patch: SessionPatch) -> Result<()> {
        let id = session_id.to_string();
        self.db.call(move |db| db.update_session(&id, &patch)).await
    }

    async fn get_latest_snapshot(&self, session_id: &str) -> Result<Option<Snapshot>> {
        let id = session_id.to_string();
        self.db.call(move |db| db.get_latest_snapshot(&id)).await
    }

    async fn save_snapshot(&self, session_id: &str, state: &ProjectState) -> Result<Snapshot> {
        let id = session_id.to_string();
        let state = state.clone();
        self.db.call(move |db| db.save_snapshot(&id, &state)).await
    }

    async fn get_requirements(&self, session_id: &str) -> Result<Vec<Requirement>> {
        let id = session_id.to_string();
        self.db.call(move |db| db.get_requirements(&id)).await
    }

    async fn record_recovery(
        &self,
        session_id: &str,
        trigger: RecoveryTrigger,
        result: &RecoveryResult,
    ) -> Result<()> {
        let id = session_id.to_string();
        let result = result.clone();
        self.db
            .call(move |db| db.record_recovery(&id, trigger, &result))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteSessionStore {
        SqliteSessionStore::new_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let store = store();
        assert!(store.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_session_upserts() {
        let store = store();
        store
            .update_session(
                "s1",
                SessionPatch {
                    sandbox_id: Some(Some("b1".into())),
                    working_directory: Some("/home/daytona/projects/s1".into()),
                    status: Some(SessionStatus::Ready),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.sandbox_id.as_deref(), Some("b1"));
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(
            session.working_directory.as_deref(),
            Some("/home/daytona/projects/s1")
        );
    }

    #[tokio::test]
    async fn test_update_session_merges_metadata_and_keeps_fields() {
        let store = store();
        store
            .update_session(
                "s1",
                SessionPatch {
                    sandbox_id: Some(Some("b1".into())),
                    ..SessionPatch::default()
                }
                .with_metadata("workflow_phase", serde_json::json!("build")),
            )
            .await
            .unwrap();
        store
            .update_session(
                "s1",
                SessionPatch::default()
                    .with_metadata("last_command", serde_json::json!("npm run dev")),
            )
            .await
            .unwrap();

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.sandbox_id.as_deref(), Some("b1"));
        assert_eq!(session.metadata_str("workflow_phase").as_deref(), Some("build"));
        assert_eq!(session.metadata_str("last_command").as_deref(), Some("npm run dev"));
    }

    #[tokio::test]
    async fn test_update_session_clears_sandbox_id() {
        let store = store();
        store
            .update_session(
                "s1",
                SessionPatch {
                    sandbox_id: Some(Some("b1".into())),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();
        store
            .update_session(
                "s1",
                SessionPatch {
                    sandbox_id: Some(None),
                    status: Some(SessionStatus::Error),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert!(session.sandbox_id.is_none());
        assert_eq!(session.status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_latest_snapshot_wins() {
        let store = store();
        assert!(store.get_latest_snapshot("s1").await.unwrap().is_none());

        let first = ProjectState {
            working_directory: "/w".into(),
            tracked_files: vec!["a.ts".into()],
            ..ProjectState::default()
        };
        let second = ProjectState {
            working_directory: "/w".into(),
            tracked_files: vec!["a.ts".into(), "b.ts".into()],
            workflow_phase: Some("test".into()),
            ..ProjectState::default()
        };
        store.save_snapshot("s1", &first).await.unwrap();
        store.save_snapshot("s1", &second).await.unwrap();
        store.save_snapshot("other", &first).await.unwrap();

        let latest = store.get_latest_snapshot("s1").await.unwrap().unwrap();
        assert_eq!(latest.project_state, second);
        assert_eq!(latest.session_id, "s1");
    }

    #[tokio::test]
    async fn test_requirements_in_position_order() {
        let store = store();
        {
            let db = store.handle().lock_sync().unwrap();
            db.upsert_requirement(
                "s1",
                &Requirement {
                    id: "r2".into(),
                    title: "Login page".into(),
                    status: "pending".into(),
                },
                1,
            )
            .unwrap();
            db.upsert_requirement(
                "s1",
                &Requirement {
                    id: "r1".into(),
                    title: "Landing page".into(),
                    status: "done".into(),
                },
                0,
            )
            .unwrap();
        }

        let reqs = store.get_requirements("s1").await.unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].id, "r1");
        assert_eq!(reqs[1].title, "Login page");
        assert!(store.get_requirements("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_recovery_audit() {
        let store = store();
        let mut result = RecoveryResult::failed("all_failed", "restart_in_place: reconnect failed");
        result.warnings.push("Manual intervention required".into());
        store
            .record_recovery("s1", RecoveryTrigger::Manual, &result)
            .await
            .unwrap();

        let events = store.list_recovery_events("s1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger, "manual");
        assert_eq!(events[0].strategy_used, "all_failed");
        assert!(!events[0].success);
        assert_eq!(events[0].errors.len(), 1);
        assert_eq!(events[0].warnings, vec!["Manual intervention required".to_string()]);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sandbox.db");
        SqliteSessionStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
