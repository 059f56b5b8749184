mod config;
mod database;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod utils;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;
use tower_cookies::CookieManagerLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::database::Database;
use crate::middleware::auth::AppState;
use crate::routes::create_routes;
use crate::services::provider::ProviderClient;
use crate::services::scheduler::{run_scheduler, TickContext};
use crate::services::sender::choose_sender;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lettercast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    let regional_offset = config.regional_offset()?;

    // Initialize database and run migrations
    let database = Database::new(&config.database_url).await?;
    database.migrate().await?;

    // Provider client and delivery strategy
    let provider = Arc::new(ProviderClient::new(
        &config.provider_base_url,
        &config.provider_api_key,
    )?);
    let sender = choose_sender(provider.clone(), config.clone());

    // Background scheduler: sequences, A/B phases, scheduled campaigns
    let tick_ctx = TickContext {
        pool: database.pool.clone(),
        config: config.clone(),
        sender,
        regional_offset,
    };
    tokio::spawn(async move {
        run_scheduler(tick_ctx).await;
    });

    let state = AppState {
        db_pool: database.pool.clone(),
        config: config.clone(),
        provider,
    };

    // Build the application
    let app = Router::new()
        .merge(create_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CookieManagerLayer::new())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .into_inner(),
        )
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
