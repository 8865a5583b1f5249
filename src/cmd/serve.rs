//! Sandbox service command (`forge-sandbox serve`).

use std::path::{Path, PathBuf};

use anyhow::Result;
use forge_sandbox::config::SandboxSettings;
use forge_sandbox::sandbox::server::{ServerConfig, start_server};
use forge_sandbox::sandbox::store::SqliteSessionStore;

pub async fn cmd_serve(
    project_dir: &Path,
    port: u16,
    init: bool,
    db_path: PathBuf,
    dev: bool,
) -> Result<()> {
    let db_path = if db_path.is_absolute() {
        db_path
    } else {
        project_dir.join(db_path)
    };

    if init {
        SqliteSessionStore::open(&db_path)?;
        println!("Session database initialized at {}", db_path.display());
        return Ok(());
    }

    let settings = SandboxSettings::load(project_dir)?;
    for warning in settings.validate() {
        tracing::warn!("{}", warning);
    }

    start_server(
        ServerConfig {
            port,
            db_path,
            dev_mode: dev,
        },
        settings,
    )
    .await
}
