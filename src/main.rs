use std::sync::Arc;

use anyhow::Context;
use aronachat::{app, config::Config, db::Store, rooms::{feed, ConnectionRegistry}, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("aronachat=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let store = Store::connect(&config.database_url, config.feed_capacity)
        .await
        .with_context(|| format!("opening message store at {}", config.database_url))?;
    let registry = ConnectionRegistry::new();

    // subscribed before the first accept, so no write goes unbroadcast
    feed::spawn(&store, registry.clone())
        .await
        .context("subscribing to the message change feed")?;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server started");

    let state = AppState {
        store,
        registry,
        config: Arc::new(config),
    };
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
