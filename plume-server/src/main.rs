use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use plume_server::{config::Args, routes::router, DiffusersModel};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let model = Arc::new(DiffusersModel::new(&args.model_name, args.adapter_config()));
    let app = router(Arc::clone(&model));

    // --- Start the server, readiness stays false until the model is loaded ---
    let bind_address = args.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("started server on {}", listener.local_addr()?);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    // A model that fails to load ends the process before it reports ready.
    model.load().await?;

    server.await.context("server task panicked")??;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
