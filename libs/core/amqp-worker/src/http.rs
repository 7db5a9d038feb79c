//! HTTP handlers for AMQP workers.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Prometheus metrics (`/metrics`)
//! - Open delivery snapshot (`GET /deliveries`)
//! - Completion callback (`POST /deliveries/complete`)

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::delivery::{CORRELATION_HEADER, CorrelationId, Outcome};
use crate::metrics;
use crate::pool::PoolStatus;
use crate::registry::DeliverySnapshot;
use crate::resolver::{AckResolver, Resolution};
use crate::worker::AmqpWorker;

/// Shared state for the admin endpoints.
#[derive(Clone)]
pub struct AdminState {
    pub resolver: AckResolver,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl AdminState {
    pub fn new(
        resolver: AckResolver,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }

    pub fn from_worker(
        worker: &AmqpWorker,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self::new(worker.resolver().clone(), app_name, app_version)
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Body of `GET /deliveries`.
#[derive(Debug, Serialize)]
pub struct DeliveriesResponse {
    pub open: usize,
    pub deliveries: Vec<DeliverySnapshot>,
    pub pool: PoolStatus,
}

/// Body of `POST /deliveries/complete`.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
    pub resolution: Resolution,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready while the pool's current generation is live.
pub async fn ready_handler(
    State(state): State<AdminState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let pool = state.resolver.pool();

    if pool.is_live() {
        Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": {
                    "broker": "ok",
                    "generation": pool.current_generation()
                }
            })),
        ))
    } else {
        let status = pool.status();
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "broker": if status.reconnecting { "reconnecting" } else { "disconnected" },
                    "generation": status.generation
                }
            })),
        ))
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// List open deliveries, oldest first, with the pool status.
///
/// `GET /deliveries`
pub async fn deliveries_handler(State(state): State<AdminState>) -> Json<DeliveriesResponse> {
    let deliveries = state.resolver.registry().snapshot();
    Json(DeliveriesResponse {
        open: deliveries.len(),
        deliveries,
        pool: state.resolver.pool().status(),
    })
}

/// Completion callback from the remote executor.
///
/// The correlation ID comes back in the `X-RabbitMQ-Delivery-Tag` header.
/// Repeated or unknown callbacks are answered with 200 and `unknown`.
///
/// `POST /deliveries/complete`
pub async fn complete_handler(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, (StatusCode, Json<Value>)> {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(CorrelationId::from)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("missing {CORRELATION_HEADER} header")
                })),
            )
        })?;

    let resolution = state
        .resolver
        .resolve(&correlation_id, request.outcome)
        .await;

    Ok(Json(CompletionResponse {
        correlation_id,
        outcome: request.outcome,
        resolution,
    }))
}

/// Create the admin router with every endpoint.
pub fn admin_router(state: AdminState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        // Health endpoints
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        // Delivery endpoints
        .route("/deliveries", get(deliveries_handler))
        .route("/deliveries/complete", post(complete_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            name: "scan-worker".to_string(),
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"name\":\"scan-worker\""));
    }

    #[test]
    fn test_completion_request_parsing() {
        let request: CompletionRequest =
            serde_json::from_str(r#"{"outcome":"retryable_failure"}"#).unwrap();
        assert_eq!(request.outcome, Outcome::RetryableFailure);

        assert!(serde_json::from_str::<CompletionRequest>(r#"{"outcome":"maybe"}"#).is_err());
    }
}
