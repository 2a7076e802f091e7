//! Health and metrics endpoints for the Call Controller.
//!
//! - `GET /health` - liveness (process is running)
//! - `GET /ready` - readiness (registry reachable, not shutting down)
//! - `GET /metrics` - Prometheus text format, when a recorder handle is supplied

use axum::{extract::State, http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags shared between `main` and the probes.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Called when shutdown begins so load balancers stop routing sockets here.
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProbeState {
    health: Arc<HealthState>,
    prometheus: Option<PrometheusHandle>,
}

/// Build the probe router. `/metrics` is only mounted when `prometheus` is set.
pub fn health_router(health: Arc<HealthState>, prometheus: Option<PrometheusHandle>) -> Router {
    let mounts_metrics = prometheus.is_some();
    let router = Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler));
    let router = if mounts_metrics {
        router.route("/metrics", get(metrics_handler))
    } else {
        router
    };
    router.with_state(ProbeState { health, prometheus })
}

async fn liveness_handler(State(state): State<ProbeState>) -> StatusCode {
    if state.health.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<ProbeState>) -> StatusCode {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler(State(state): State<ProbeState>) -> (StatusCode, String) {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
