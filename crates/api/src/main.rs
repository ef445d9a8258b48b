//! freelancedesk API Server

use std::net::SocketAddr;

use freelancedesk_api::{routes::cors_layer, AppState, Config};
use freelancedesk_billing::{create_pool, BillingService, PgWorkStore};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing, LOG_JSON=true for structured output
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,freelancedesk_api=debug,freelancedesk_billing=debug".into());
    let json_logs = std::env::var("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }

    let config = Config::from_env()?;
    tracing::info!(bind_address = %config.bind_address, "Configuration loaded");

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    PgWorkStore::new(pool.clone()).migrate().await?;
    tracing::info!("Database migrations applied");

    let billing = BillingService::from_env(pool)?;
    tracing::info!("Billing service initialized");

    let cors = cors_layer(&config);
    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(config, billing);

    let app = freelancedesk_api::create_router(state)
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
