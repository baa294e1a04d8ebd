use anyhow::Result;
use axum::Router;
use sfs_store::{config, routes, services::storage_service::StorageService};
use std::io::ErrorKind;
use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting sfs-store with config: {:?}", cfg);

    // --- Open metadata store (runs the schema check and upgrade) ---
    let storage = StorageService::open(cfg.store.clone()).await?;
    let background = storage.spawn_background();

    let app: Router = routes::routes::routes().with_state(storage.clone());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = signal::ctrl_c().await {
                tracing::warn!("failed to listen for shutdown signal: {}", err);
            }
        })
        .await?;

    tracing::info!("Shutting down");
    storage.shutdown().await;
    for task in background {
        if let Err(err) = task.await {
            tracing::warn!("background task ended abnormally: {}", err);
        }
    }
    Ok(())
}
