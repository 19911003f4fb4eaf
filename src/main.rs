use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use outreach_engine::bootstrap::build_engine;
use outreach_engine::config::Config;
use outreach_engine::handlers::{self, AppState};
use outreach_engine::scheduler::{Scheduler, SystemClock};

/// Loads configuration, wires the engine, starts the cadence loops and serves
/// the HTTP API.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outreach_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    if config.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET not set; webhook and cadence routes are unauthenticated");
    }

    let engine = build_engine(&config).await?;
    let scheduler = Arc::new(Scheduler::new(engine.clone(), Arc::new(SystemClock)));

    if config.scheduler_enabled {
        let handles = scheduler.clone().spawn();
        tracing::info!("Scheduler started ({} cadences)", handles.len());
    } else {
        tracing::warn!("Scheduler disabled; cadences run only on manual trigger");
    }

    let app_state = Arc::new(AppState {
        engine,
        scheduler,
        webhook_secret: config.webhook_secret.clone(),
    });
    let app = handlers::router(app_state, true)?;

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Peer addresses feed the rate limiter and consent provenance.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
