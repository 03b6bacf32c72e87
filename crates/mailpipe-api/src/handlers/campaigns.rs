//! Campaign send controls and A/B evaluation

use axum::{
    extract::{Path, State},
    Json,
};
use mailpipe_common::types::{AbTestId, CampaignId};
use mailpipe_core::campaign::AbTestResult;
use mailpipe_core::{PauseReport, SendReport};
use std::sync::Arc;

use crate::auth::AppState;
use crate::error::ApiResult;

/// POST /api/v1/campaigns/:id/send
pub async fn send_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<Json<SendReport>> {
    Ok(Json(state.pipeline.campaigns.send_campaign(id).await?))
}

/// POST /api/v1/campaigns/:id/pause
pub async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<Json<PauseReport>> {
    Ok(Json(state.pipeline.campaigns.pause_campaign(id).await?))
}

/// POST /api/v1/campaigns/:id/resume
pub async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<Json<PauseReport>> {
    Ok(Json(state.pipeline.campaigns.resume_campaign(id).await?))
}

/// POST /api/v1/ab-tests/:id/evaluate
pub async fn evaluate_ab_test(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AbTestId>,
) -> ApiResult<Json<AbTestResult>> {
    Ok(Json(state.pipeline.campaigns.evaluate_ab_test(id).await?))
}
