//! HTTP health endpoints: `/health` (aggregate JSON), `/ready`, `/live`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::hypervisor::Hypervisor;

pub struct HealthState<H> {
    pub hypervisor: Arc<H>,
    pub version: &'static str,
    pub started_at: Instant,
    pub heartbeat_ok: Arc<AtomicBool>,
}

impl<H> Clone for HealthState<H> {
    fn clone(&self) -> Self {
        Self {
            hypervisor: self.hypervisor.clone(),
            version: self.version,
            started_at: self.started_at,
            heartbeat_ok: self.heartbeat_ok.clone(),
        }
    }
}

pub fn router<H: Hypervisor>(state: HealthState<H>) -> Router {
    Router::new()
        .route("/health", get(health::<H>))
        .route("/ready", get(ready::<H>))
        .route("/live", get(live))
        .with_state(state)
}

async fn health<H: Hypervisor>(State(state): State<HealthState<H>>) -> impl IntoResponse {
    let hypervisor_check = match state.hypervisor.ping().await {
        Ok(()) => json!({ "status": "up" }),
        Err(e) => json!({ "status": "down", "message": e.to_string() }),
    };
    let healthy = hypervisor_check["status"] == "up";

    let tasks = tokio::runtime::Handle::current().metrics().num_alive_tasks();
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "version": state.version,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "checks": {
            "hypervisor": hypervisor_check,
        },
        "metrics": {
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "tasks": tasks,
            "heartbeat_ok": state.heartbeat_ok.load(Ordering::Relaxed),
        },
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn ready<H: Hypervisor>(State(state): State<HealthState<H>>) -> impl IntoResponse {
    match state.hypervisor.ping().await {
        Ok(()) => (StatusCode::OK, "READY"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "NOT READY"),
    }
}

async fn live() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
