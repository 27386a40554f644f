mod auth;
mod config;
mod dto;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use df_core::Coordinator;
use df_db::{MemoryStore, PgStore, Store};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env()?;

    // Records
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => {
            tracing::warn!("DATABASE_URL not set, records are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // Compute gateway, absent in demo mode
    let gateway = df_infra::build_gateway();
    if gateway.is_none() {
        tracing::warn!("no compute gateway configured, running in demo mode");
    }

    let coordinator = Coordinator::new(store, gateway, config.core.clone());
    let resumed = coordinator.reconciler().resume().await?;
    tracing::info!(resumed, "reconciler ready");

    let state = AppState {
        coordinator: coordinator.clone(),
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    tracing::info!(addr = %config.listen_addr, "starting deskfleet API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    coordinator.reconciler().shutdown().await;
    tracing::info!("background work stopped");
    Ok(())
}
