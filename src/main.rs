use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_relay::{config::AppConfig, cors_layer, router, state::AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    match dotenv {
        Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
        // A missing .env is normal
        Err(dotenvy::Error::Io(_)) => {}
        Err(e) => tracing::warn!("Ignoring malformed .env: {}", e),
    }

    tracing::info!("Starting agent relay...");

    let config = AppConfig::from_env();
    let state = Arc::new(AppState::from_config(&config)?);

    let app = router(state)
        .layer(cors_layer(config.allowed_origin.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Interrupt received, shutting down");
}

/// `RUST_LOG` wins; otherwise debug for this crate and the HTTP trace layer
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "agent_relay=debug,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
