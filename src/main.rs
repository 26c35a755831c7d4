use std::sync::Arc;

use retroboard::{config::Config, hub::Hub, store::SqliteStore, AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DB_MAX_CONNECTIONS: u32 = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "retroboard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store = SqliteStore::connect(&config.database_url, DB_MAX_CONNECTIONS).await?;
    let stale = store.reset_presence().await?;
    if stale > 0 {
        info!(stale, "cleared presence from a previous run");
    }

    let (hub, _hub_task) = Hub::spawn(config.hub_queue);
    let state = AppState::new(Arc::new(store), hub, config.limits);
    let app = retroboard::router(state, &config);

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
