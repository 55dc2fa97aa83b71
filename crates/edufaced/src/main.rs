use anyhow::{Context, Result};
use eduface_core::OnnxBackend;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod engine;
mod error;
mod http;
mod intake;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("edufaced starting");

    let config = config::Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        bind = %config.bind,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        detector = %config.detector_backend,
        metric = %config.distance_metric,
        attendance_db = %config.attendance_db.display(),
        "configuration loaded"
    );

    let backend = OnnxBackend::load(&config.model_dir, config.intra_threads)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(Box::new(backend), config.db_path.clone())?;

    let store = store::Store::open(&config.attendance_db)
        .await
        .with_context(|| format!("failed to open {}", config.attendance_db.display()))?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let app = http::router(http::AppState { config: Arc::new(config), engine, store });

    tracing::info!(addr = %listener.local_addr()?, "edufaced ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("edufaced shutting down");
    Ok(())
}

async fn shutdown_signal() {
    wait_for(tokio::signal::ctrl_c()).await
}

/// Resolves when `signal` fires. If the listener could not be installed this
/// never resolves, so the server keeps running instead of stopping at once.
async fn wait_for(signal: impl std::future::Future<Output = std::io::Result<()>>) {
    if let Err(e) = signal.await {
        tracing::error!(error = %e, "failed to listen for ctrl-c; graceful shutdown disabled");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_resolves_shutdown() {
        let done = tokio::time::timeout(Duration::from_millis(200), wait_for(async { Ok(()) })).await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn test_failed_signal_listener_keeps_serving() {
        let failed = async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler")) };
        let done = tokio::time::timeout(Duration::from_millis(50), wait_for(failed)).await;
        assert!(done.is_err(), "shutdown must not fire when the listener fails");
    }
}
