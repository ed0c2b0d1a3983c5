mod admin;
mod auth;
mod config;
mod edits;
mod error;
mod nutrition;
mod rate_limit;
mod records;
mod routes;
mod supabase;
mod xero;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // production injects the environment directly
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("larder_api=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting larder-api with config: {:?}", config);

    let state = AppState::from_config(config).await?;
    edits::spawn_session_reaper(state.clone());
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("larder-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
