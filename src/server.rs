//! HTTP surface: decisions, usage reporting, health and metrics.

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    aggregator::RateAggregator,
    metrics::Metrics,
    request::{Request, RouteTable},
};

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<RateAggregator>,
    pub routes: Arc<RouteTable>,
    pub metrics: Arc<Metrics>,
}

/// Request attributes as sent by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestPayload {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub remote_addr: String,
    pub user: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

fn default_method() -> String {
    Method::GET.to_string()
}

impl RequestPayload {
    pub fn into_request(self) -> Result<Request, String> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| format!("invalid method '{}'", self.method))?;

        let mut request = Request::new(method, self.path).with_remote_addr(self.remote_addr);
        if let Some(user) = self.user {
            request = request.with_user(user);
        }
        for role in self.roles {
            request = request.with_role(role);
        }
        for (name, value) in &self.headers {
            request = request.with_header(name, value);
        }
        Ok(request)
    }
}

/// A finished request and how long the upstream took.
#[derive(Debug, Clone, Deserialize)]
pub struct UsagePayload {
    #[serde(flatten)]
    pub request: RequestPayload,
    pub elapsed_ms: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/decide", post(decide))
        .route("/usage", post(usage))
        .with_state(state)
}

/// Bind `addr` and serve until the listener fails.
pub async fn serve(state: AppState, addr: SocketAddr) -> crate::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn decide(State(state): State<AppState>, Json(payload): Json<RequestPayload>) -> Response {
    let request = match payload.into_request() {
        Ok(request) => request,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    let route = state.routes.resolve(&request.path);
    let decision = state.aggregator.decide_route(&request, route).await;

    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    (status, Json(decision)).into_response()
}

async fn usage(State(state): State<AppState>, Json(payload): Json<UsagePayload>) -> Response {
    let elapsed = Duration::from_millis(payload.elapsed_ms);
    let request = match payload.request.into_request() {
        Ok(request) => request,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    let route = state.routes.resolve(&request.path);
    let decision = state.aggregator.record_usage(&request, route, elapsed).await;
    Json(decision).into_response()
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.aggregator.limiter().store().health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
