//! Minimal operational HTTP surface: `/health` and `/metrics`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::lifecycle::{HealthChecker, HealthStatus, Metrics};

#[derive(Clone)]
struct AppState {
    health: Arc<HealthChecker>,
    metrics: Arc<Metrics>,
}

pub async fn serve(
    host: &str,
    port: u16,
    health: Arc<HealthChecker>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .with_state(AppState { health, metrics });

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind health server {addr}"))?;
    log::info!("http.listening addr={addr}");
    axum::serve(listener, app).await.context("health server")?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check_all();
    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    let avg_latency_ms = snapshot.avg_latency_ms();
    let success_rate = snapshot.success_rate();
    let body = serde_json::json!({
        "metrics": snapshot,
        "avg_latency_ms": avg_latency_ms,
        "success_rate": success_rate,
    });
    Json(body)
}
