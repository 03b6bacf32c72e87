//! Transactional message endpoints

use axum::{extract::State, http::StatusCode, Json};
use mailpipe_common::types::MessageId;
use mailpipe_storage::models::{NewMessage, QueueStats};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::auth::AppState;
use crate::error::ApiResult;

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub message_id: MessageId,
    pub status: String,
}

/// POST /api/v1/messages
///
/// Queues one transactional message. Suppressed or unsubscribed
/// recipients are rejected with 409.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let message_id = state.pipeline.queue.enqueue_transactional(input).await?;
    info!(message_id = %message_id, "Transactional message accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            message_id,
            status: "queued".into(),
        }),
    ))
}

/// GET /api/v1/messages/stats
pub async fn queue_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.pipeline.queue.stats().await?))
}
