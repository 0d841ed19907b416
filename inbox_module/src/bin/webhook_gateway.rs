#[path = "webhook_gateway/handlers.rs"]
mod handlers;
#[path = "webhook_gateway/state.rs"]
mod state;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inbox_module::{Inbox, InboxConfig};

use handlers::{health, receive_webhook, verify_webhook};
use state::GatewayState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = InboxConfig::from_env()?;
    let gateway = config.gateway.clone();
    if config.app_secret.is_none() {
        tracing::warn!("WEBHOOK_APP_SECRET is not set; every webhook will be rejected");
    }

    let inbox = task::spawn_blocking(move || Inbox::open(config, false))
        .await
        .map_err(|err| -> Box<dyn std::error::Error + Send + Sync> { err.into() })??;
    info!(
        "webhook gateway db={} backend={:?}",
        inbox.db.path().display(),
        inbox.config.queue_backend
    );

    let state = Arc::new(GatewayState {
        pipeline: inbox.pipeline.clone(),
        verify_token: gateway.verify_token.clone(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhooks/:platform", get(verify_webhook).post(receive_webhook))
        .with_state(state)
        .layer(DefaultBodyLimit::max(gateway.max_body_bytes))
        .layer(TraceLayer::new_for_http());

    let addr: std::net::SocketAddr = format!("{}:{}", gateway.host, gateway.port).parse()?;
    info!("webhook gateway listening on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
