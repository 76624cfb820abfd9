use anyhow::Result;
use tower_classify_node::{api, config::Config, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info")),
        )
        .init();

    tracing::info!("Starting tower classification node...");

    let config = Config::load()?;
    metrics::init_metrics();
    tracing::info!("✓ Metrics initialized");

    tracing::info!(
        runtime = %config.worker_config.runtime,
        script = %config.worker_config.script_path.display(),
        model = %config.worker_config.model_path.display(),
        max_workers = config.worker_config.max_concurrent_workers,
        timeout_secs = ?config.worker_config.timeout_secs,
        "Worker configuration"
    );

    if !config.worker_config.model_path.exists() {
        tracing::warn!(
            model = %config.worker_config.model_path.display(),
            "Model file not found; classification requests will fail until it is present"
        );
    }

    tokio::fs::create_dir_all(&config.upload_config.scratch_dir).await?;

    let bind_addr = config.bind_addr();
    let app = api::create_router(api::AppState::from_config(config));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
    tracing::info!("🌐 API server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

    tracing::info!("Node shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping server...");
}
