//! Shared state and request authentication

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use mailpipe_core::Pipeline;
use mailpipe_storage::DatabasePool;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    /// Present with the postgres backend; probed by the detailed health check
    pub db_pool: Option<DatabasePool>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, db_pool: Option<DatabasePool>) -> Arc<Self> {
        Arc::new(Self { pipeline, db_pool })
    }
}

/// Extract a key from `Authorization: Bearer ..` or `X-API-Key`
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(auth) = headers.get("authorization") {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.trim());
            }
        }
    }

    headers.get("x-api-key").and_then(|key| key.to_str().ok())
}

fn hash_key(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Compare digests so timing does not depend on the common prefix
fn keys_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (hash_key(presented), hash_key(expected));
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn check_key(headers: &HeaderMap, expected: Option<&str>, path: &str) -> Result<(), StatusCode> {
    let Some(expected) = expected.filter(|k| !k.is_empty()) else {
        return Ok(());
    };
    match extract_api_key(headers) {
        Some(presented) if keys_match(presented, expected) => Ok(()),
        Some(_) => {
            warn!("Invalid key in request to {}", path);
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing key in request to {}", path);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// `/api/v1` guard: `server.api_key`
pub async fn api_key_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    check_key(
        request.headers(),
        state.pipeline.config.server.api_key.as_deref(),
        request.uri().path(),
    )?;
    Ok(next.run(request).await)
}

/// Cron trigger guard: `cron.secret`
pub async fn cron_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    check_key(
        request.headers(),
        state.pipeline.config.cron.secret.as_deref(),
        request.uri().path(),
    )?;
    Ok(next.run(request).await)
}
