//! Read-only HTTP status endpoint, built with the `serve` feature.

use crate::config::ServeConfig;
use crate::health::HealthSnapshot;
use tokio::sync::watch;

#[derive(Clone)]
struct AppState {
    snapshot: watch::Receiver<HealthSnapshot>,
}

pub fn router(snapshot: watch::Receiver<HealthSnapshot>) -> axum::Router {
    use axum::routing::get;
    use tower_http::cors::CorsLayer;

    axum::Router::new()
        .route("/api/health", get(health))
        .route("/api/state", get(api_state))
        .with_state(AppState { snapshot })
        .layer(CorsLayer::permissive())
}

pub async fn run(
    config: &ServeConfig,
    snapshot: watch::Receiver<HealthSnapshot>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("serve listening on {local_addr}");

    axum::serve(listener, router(snapshot)).await?;
    Ok(())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"ok": true}))
}

async fn api_state(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<HealthSnapshot> {
    axum::Json(state.snapshot.borrow().clone())
}
