use anyhow::Result;
use clap::Parser;
use pollcast_kv::{MemoryKv, SharedKv};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pollcast=info,tower_http=debug")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    ensure_data_dirs(&config);

    let db = pollcast_db::create_pool(&config.database.url, config.database.max_connections).await?;
    pollcast_db::run_migrations(&db).await?;

    let kv: SharedKv = Arc::new(MemoryKv::new());
    let services = pollcast_core::Services::start(db, kv, config.service_config()).await?;

    let app = pollcast_api::router(services.clone()).merge(pollcast_ws::router(services.hub.clone()));

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        address = %config.server.bind_address,
        database = %config.database.url,
        "pollcast listening"
    );

    // Live connections would otherwise hold graceful shutdown open forever.
    let hub = services.hub.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down...");
        hub.close_all();
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    services.shutdown().await;
    Ok(())
}

/// Ensure the database directory exists before the pool opens the file.
fn ensure_data_dirs(config: &config::Config) {
    if let Some(db_path) = config
        .database
        .url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
                }
            }
        }
    }
}
