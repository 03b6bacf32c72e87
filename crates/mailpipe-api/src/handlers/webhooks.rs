//! Provider delivery webhooks

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use mailpipe_common::Error;
use mailpipe_core::tracking::signing::verify_hex;
use mailpipe_core::{ProviderWebhook, WebhookOutcome};
use std::sync::Arc;
use tracing::warn;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// POST /webhooks/provider
///
/// With `provider.webhook_secret` set the raw body must carry a hex
/// HMAC-SHA256 signature in `X-Webhook-Signature`.
pub async fn provider_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookOutcome>> {
    if let Some(secret) = state
        .pipeline
        .config
        .provider
        .webhook_secret
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_hex(secret, &body, signature.trim()) {
            warn!("Rejected provider webhook with a bad signature");
            return Err(Error::Unauthorized("invalid webhook signature".into()).into());
        }
    }

    let webhook: ProviderWebhook = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid webhook payload: {}", e)))?;

    Ok(Json(state.pipeline.webhooks.process(webhook).await?))
}
