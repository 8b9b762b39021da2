//! Out-of-band HTTP liveness endpoint

use axum::Router;
use axum::http::{Method, StatusCode};
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub const DEFAULT_HEALTH_PORT: u16 = 3002;

/// Router exposing `GET /health`
pub fn router() -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "Server is running")
}

pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    info!("Health endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router()).await
}
