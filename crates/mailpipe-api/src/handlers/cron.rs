//! Scheduler trigger

use axum::{extract::State, http::StatusCode, Json};
use mailpipe_core::CronReport;
use std::sync::Arc;

use crate::auth::AppState;

/// POST /api/v1/cron/run
///
/// Runs every maintenance job once. A critical run answers 500 so
/// external schedulers alert on it; the body is the report either way.
pub async fn run(State(state): State<Arc<AppState>>) -> (StatusCode, Json<CronReport>) {
    let report = state.pipeline.orchestrator().run().await;
    let status = if report.is_critical() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}
