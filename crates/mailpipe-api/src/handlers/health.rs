//! Liveness, detailed health and metrics

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use mailpipe_core::HealthStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::auth::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// GET /health
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn ok(detail: Option<Value>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail,
            error: None,
        }
    }

    fn failed(status: HealthStatus, error: impl ToString) -> Self {
        Self {
            status,
            detail: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedHealth {
    pub status: HealthStatus,
    pub database: ComponentHealth,
    pub provider: ComponentHealth,
    pub queue: ComponentHealth,
    pub delivery: ComponentHealth,
}

fn severity(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Critical => 2,
    }
}

/// GET /health/detailed
pub async fn detailed_health(State(state): State<Arc<AppState>>) -> Response {
    let pipeline = &state.pipeline;

    let database = match &state.db_pool {
        Some(pool) => match pool.health_check().await {
            Ok(()) => ComponentHealth::ok(None),
            Err(e) => ComponentHealth::failed(HealthStatus::Critical, e),
        },
        None => ComponentHealth::ok(Some(json!({ "backend": "memory" }))),
    };

    let adapter = pipeline.worker.provider();
    let provider = match tokio::time::timeout(PROBE_TIMEOUT, adapter.health_check()).await {
        Ok(Ok(())) => ComponentHealth::ok(Some(json!({ "name": adapter.name() }))),
        Ok(Err(e)) => ComponentHealth::failed(HealthStatus::Degraded, e),
        Err(_) => ComponentHealth::failed(HealthStatus::Degraded, "provider probe timed out"),
    };

    let queue = match pipeline.queue.stats().await {
        Ok(stats) => ComponentHealth::ok(serde_json::to_value(stats).ok()),
        Err(e) => ComponentHealth::failed(HealthStatus::Critical, e),
    };

    let delivery = match pipeline.orchestrator().health().await {
        Ok(report) => ComponentHealth {
            status: report.status,
            detail: serde_json::to_value(&report).ok(),
            error: None,
        },
        Err(e) => ComponentHealth::failed(HealthStatus::Critical, e),
    };

    let status = [&database, &provider, &queue, &delivery]
        .iter()
        .map(|c| c.status)
        .max_by_key(|s| severity(*s))
        .unwrap_or(HealthStatus::Healthy);

    let code = match status {
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (
        code,
        Json(DetailedHealth {
            status,
            database,
            provider,
            queue,
            delivery,
        }),
    )
        .into_response()
}

/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
