//! Open pixel, click redirect, unsubscribe and conversion endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use mailpipe_core::tracking::EventDetails;
use mailpipe_core::RecordOutcome;
use mailpipe_storage::models::TrackingEventType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

/// 1x1 transparent GIF
const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xff, 0xff,
    0xff, 0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

const UNSUBSCRIBED_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Unsubscribed</title></head>\
<body><p>You have been unsubscribed and will no longer receive these emails.</p></body></html>";

fn request_details(headers: &HeaderMap) -> EventDetails {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let ip_address = value("x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| value("x-real-ip"));

    EventDetails {
        user_agent: value(header::USER_AGENT.as_str()),
        ip_address,
        ..Default::default()
    }
}

/// Only absolute http(s) targets are redirected to
fn redirect_target(url: Option<&str>) -> Option<HeaderValue> {
    let url = url?.trim();
    let lower = url.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return None;
    }
    HeaderValue::from_str(url).ok()
}

fn pixel() -> Response {
    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, private"),
        ],
        PIXEL_GIF,
    )
        .into_response()
}

/// GET /track/open/:tracking_id
///
/// Always answers with the pixel; unknown ids are ignored.
pub async fn track_open(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let recorded = state
        .pipeline
        .tracking
        .record_event(&tracking_id, TrackingEventType::Opened, request_details(&headers))
        .await;
    if let Err(e) = recorded {
        warn!(tracking_id = %tracking_id, error = %e, "Failed to record open");
    }
    pixel()
}

#[derive(Debug, Deserialize)]
pub struct ClickParams {
    pub url: Option<String>,
    pub lid: Option<i32>,
    pub s: Option<String>,
}

/// GET /track/click/:tracking_id?url=..&lid=..[&s=..]
///
/// Redirects only for a known delivery, and only to a signed target when a
/// tracking secret is configured.
pub async fn track_click(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
    Query(params): Query<ClickParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let url = params.url.as_deref().unwrap_or_default();
    let location = redirect_target(Some(url))
        .ok_or_else(|| ApiError::BadRequest("Missing or invalid redirect url".into()))?;

    let details = EventDetails {
        link_id: params.lid,
        ..request_details(&headers)
    };
    state
        .pipeline
        .tracking
        .record_click(&tracking_id, url, params.s.as_deref(), details)
        .await
        .map_err(|e| {
            warn!(tracking_id = %tracking_id, error = %e, "Refusing click redirect");
            ApiError::from(e)
        })?;

    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeParams {
    pub t: String,
    pub e: String,
    pub s: Option<String>,
}

/// GET /unsubscribe?t=..&e=..[&s=..]
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UnsubscribeParams>,
    headers: HeaderMap,
) -> ApiResult<Html<&'static str>> {
    state
        .pipeline
        .tracking
        .unsubscribe(
            &params.t,
            &params.e,
            params.s.as_deref(),
            request_details(&headers),
        )
        .await?;
    Ok(Html(UNSUBSCRIBED_PAGE))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversionResponse {
    pub tracking_id: String,
    pub outcome: RecordOutcome,
}

/// POST /api/v1/conversions/:tracking_id
pub async fn record_conversion(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<ConversionResponse>> {
    let outcome = state
        .pipeline
        .tracking
        .record_conversion(&tracking_id, request_details(&headers))
        .await?;
    Ok(Json(ConversionResponse {
        tracking_id,
        outcome,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_redirect_target_rejects_non_http() {
        assert!(redirect_target(Some("https://shop.example.com/a?b=c")).is_some());
        assert!(redirect_target(Some("HTTP://shop.example.com")).is_some());
        assert!(redirect_target(Some("javascript:alert(1)")).is_none());
        assert!(redirect_target(Some("//evil.example.com")).is_none());
        assert!(redirect_target(None).is_none());
    }

    #[test]
    fn test_request_details_uses_first_forwarded_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));

        let details = request_details(&headers);
        assert_eq!(details.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(details.user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[test]
    fn test_pixel_is_a_gif() {
        assert_eq!(&PIXEL_GIF[..6], b"GIF89a");
        assert_eq!(PIXEL_GIF.len(), 43);
    }
}
