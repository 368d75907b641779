use std::fs::{File, OpenOptions};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use axum::{Router, routing::get};
use fs2::FileExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::api::{self, AppState};
use super::control::ControlPlane;
use super::db::AppDb;
use super::ws;
use crate::config::PlatformConfig;

/// Listener options for `bmp serve`.
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1323,
            host: "127.0.0.1".to_string(),
            dev_mode: false,
        }
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the store and wire a control plane for `config`.
pub fn build_control_plane(
    config: &PlatformConfig,
    ws_tx: broadcast::Sender<String>,
) -> Result<Arc<ControlPlane>> {
    config.ensure_directories()?;
    let db = AppDb::new(&config.db_path())
        .with_context(|| format!("Failed to open app store at {}", config.db_path().display()))?;
    ControlPlane::new(config, db, ws_tx)
}

/// The dashboard upstream follows the port actually served, not the file.
fn apply_listener(config: &mut PlatformConfig, server: &ServerConfig) {
    if config.settings.platform.listen_port != server.port {
        tracing::debug!(
            configured = config.settings.platform.listen_port,
            serving = server.port,
            "listen port overridden"
        );
    }
    config.settings.platform.listen_port = server.port;
}

/// Take the exclusive registry lock; held for the life of the returned file.
pub fn acquire_instance_lock(config: &PlatformConfig) -> Result<File> {
    let path = config.lock_path();
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => bail!(
            "Another bmp instance already owns {}",
            config.data_dir.display()
        ),
        Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
    }
}

/// Start the control plane and serve until SIGINT/SIGTERM.
pub async fn start_server(mut config: PlatformConfig, server: ServerConfig) -> Result<()> {
    apply_listener(&mut config, &server);
    for warning in config.settings.validate() {
        tracing::warn!("config: {}", warning);
    }
    config.ensure_directories()?;
    let _lock = acquire_instance_lock(&config)?;

    let (ws_tx, _rx) = broadcast::channel::<String>(1024);
    let control = build_control_plane(&config, ws_tx.clone())?;

    let cancel = CancellationToken::new();
    let telemetry = control.start_telemetry(cancel.clone());
    control
        .restore()
        .await
        .context("Failed to restore apps from the store")?;

    let state = Arc::new(AppState {
        control: control.clone(),
        ws_tx,
    });
    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        data_dir = %config.data_dir.display(),
        base_domain = %config.base_domain(),
        "bmp control plane listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("stopping supervised processes");
    control.shutdown().await;
    cancel.cancel();
    let _ = telemetry.await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler; using Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    tracing::info!("shutdown requested");
}
