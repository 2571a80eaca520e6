//! update-service - local HTTP/SSE front-end for the update engine.

mod config;
mod error;
mod routes;
mod state;

use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    update_engine::logger::init("info")?;

    let config = AppConfig::from_env();
    tracing::info!(
        "Starting update-service v{} on port {} (base dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.port,
        config.engine.base_dir.display()
    );

    let state = Arc::new(AppState::new(config.clone())?);

    // A previous engine run may have died mid-job; reclassify before the UI
    // can observe stale "running" records.
    match state.store.recover_interrupted() {
        Ok(interrupted) if !interrupted.is_empty() => {
            tracing::warn!("Marked {} interrupted job(s) as failed", interrupted.len());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Startup job recovery failed: {}", e),
    }
    if let Err(e) = state.backups.gc_temp() {
        tracing::warn!("Backup temp GC failed: {}", e);
    }

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
