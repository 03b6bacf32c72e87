//! Business event intake

use axum::{extract::State, Json};
use mailpipe_core::TriggerReport;
use mailpipe_storage::models::{TriggerEvent, TriggerType};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub trigger: TriggerType,
    pub event: TriggerEvent,
}

/// POST /api/v1/automations/trigger
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<Json<TriggerReport>> {
    let report = state
        .pipeline
        .automations
        .trigger_automation(req.trigger, req.event)
        .await?;
    Ok(Json(report))
}
