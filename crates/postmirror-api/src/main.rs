mod auth;
mod config;
mod error;
mod routes;
mod scheduler;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("postmirror_api=info".parse().expect("valid directive"))
                .add_directive("postmirror_core=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting postmirror-api with config: {:?}", config);

    let state = AppState::from_config(config).await?;
    let bind_addr = state.config.bind_addr.clone();
    let scheduler = state
        .config
        .sync_interval
        .map(|interval| scheduler::spawn(Arc::clone(&state.sync), interval));
    if let Some(interval) = state.config.sync_interval {
        tracing::info!(interval_secs = interval.as_secs(), "Sync scheduler enabled");
    }
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("postmirror-api listening on {}", bind_addr);
    let served = axum::serve(listener, router).await;
    if let Some(handle) = scheduler {
        handle.abort();
    }
    served?;
    Ok(())
}
