use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::client::SandboxClient;
use super::daytona::DaytonaClient;
use super::events;
use super::lifecycle::SandboxManager;
use super::monitor::HealthMonitor;
use super::store::{SessionStore, SqliteSessionStore};
use crate::config::SandboxSettings;

/// Configuration for the sandbox service.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3142,
            db_path: PathBuf::from(".forge/sandbox.db"),
            dev_mode: false,
        }
    }
}

/// Wire the monitor and the lifecycle manager around a client and a store.
pub fn build_state(
    client: Arc<dyn SandboxClient>,
    store: Arc<dyn SessionStore>,
    settings: SandboxSettings,
) -> SharedState {
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let monitor = HealthMonitor::new(client.clone(), store.clone(), &settings, ws_tx.clone());
    let manager = SandboxManager::new(client, store, monitor.clone(), settings);
    Arc::new(AppState {
        manager,
        monitor,
        ws_tx,
    })
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: SharedState) -> Router {
    let ws_tx = state.ws_tx.clone();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| events::ws_handler_with_sender(ws_upgrade, ws_tx)),
        )
        .with_state(state)
}

/// Start the sandbox service and block until Ctrl-C.
pub async fn start_server(config: ServerConfig, settings: SandboxSettings) -> Result<()> {
    let store = SqliteSessionStore::open(&config.db_path)
        .context("Failed to initialize session database")?;
    let client = DaytonaClient::new(&settings.provider)?;

    let state = build_state(Arc::new(client), Arc::new(store), settings);
    state.monitor.start().await;
    state.manager.start().await;

    let mut app = build_router(state.clone());

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Forge sandbox service running at http://{}", local_addr);
    tracing::info!(addr = %local_addr, db = %config.db_path.display(), "Sandbox service started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.manager.shutdown().await;
    state.monitor.shutdown().await;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::MockSandboxClient;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let state = build_state(
            Arc::new(MockSandboxClient::new()),
            Arc::new(SqliteSessionStore::new_in_memory().unwrap()),
            SandboxSettings::default(),
        );
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/sandboxes/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = test_router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/nothing-here")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3142);
        assert!(!config.dev_mode);
        assert_eq!(config.db_path, PathBuf::from(".forge/sandbox.db"));
    }
}
