use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::allocator::RetryPolicy;
use super::api::{self, AppState};
use super::db::{AgencyDb, DbHandle};
use super::ws;

/// Configuration for the board server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub busy_timeout: Duration,
    pub slug_policy: RetryPolicy,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            db_path: PathBuf::from(".agency/agency.db"),
            busy_timeout: super::db::DEFAULT_BUSY_TIMEOUT,
            slug_policy: RetryPolicy::default(),
            dev_mode: false,
        }
    }
}

/// Build the full application router with the API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Open the configured database, creating its directory if needed.
pub fn open_database(config: &ServerConfig) -> Result<AgencyDb> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = AgencyDb::open(&config.db_path, config.busy_timeout)
        .context("Failed to initialize agency database")?;
    Ok(db.with_slug_policy(config.slug_policy))
}

/// Start the board server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = open_database(&config)?;
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        ws_tx,
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, db = %config.db_path.display(), dev_mode = config.dev_mode, "agency board listening");
    println!("Agency board running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = AgencyDb::new_in_memory().unwrap();
        let (ws_tx, _) = broadcast::channel(16);
        let state = Arc::new(AppState {
            db: DbHandle::new(db),
            ws_tx,
        });
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
    async fn test_api_create_client_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/clients")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"name": "server-test", "project_key": "SRV"}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let client: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(client["project_key"], "SRV");
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = test_router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = test_router();
        let req = Request::builder()
            .uri("/some/client/route")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_open_database_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            db_path: dir.path().join("nested/agency.db"),
            ..Default::default()
        };
        let db = open_database(&config).unwrap();
        assert!(db.list_clients().unwrap().is_empty());
        assert!(dir.path().join("nested/agency.db").exists());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3141);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.db_path, PathBuf::from(".agency/agency.db"));
        assert_eq!(config.slug_policy, RetryPolicy::default());
        assert!(!config.dev_mode);
    }
}
