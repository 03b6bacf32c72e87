//! API routes

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{api_key_middleware, cron_auth_middleware, AppState};
use crate::handlers::{automations, campaigns, cron, health, messages, tracking, webhooks};

/// Create the HTTP router
pub fn create_router(state: Arc<AppState>) -> Router {
    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health_check))
        .route("/detailed", get(health::detailed_health));

    // Recipient-facing tracking routes (no auth required)
    let tracking_routes = Router::new()
        .route("/track/open/:tracking_id", get(tracking::track_open))
        .route("/track/click/:tracking_id", get(tracking::track_click))
        .route("/unsubscribe", get(tracking::unsubscribe))
        .route("/webhooks/provider", post(webhooks::provider_webhook));

    let message_routes = Router::new()
        .route("/", post(messages::send_message))
        .route("/stats", get(messages::queue_stats));

    let campaign_routes = Router::new()
        .route("/:campaign_id/send", post(campaigns::send_campaign))
        .route("/:campaign_id/pause", post(campaigns::pause_campaign))
        .route("/:campaign_id/resume", post(campaigns::resume_campaign));

    // API v1 routes with authentication
    let api_v1 = Router::new()
        .nest("/messages", message_routes)
        .nest("/campaigns", campaign_routes)
        .route("/automations/trigger", post(automations::trigger))
        .route("/ab-tests/:ab_test_id/evaluate", post(campaigns::evaluate_ab_test))
        .route("/conversions/:tracking_id", post(tracking::record_conversion))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ));

    // Scheduler trigger, guarded by the cron secret instead of the API key
    let cron_routes = Router::new()
        .route("/run", post(cron::run))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cron_auth_middleware,
        ));

    Router::new()
        .nest("/health", health_routes)
        .route("/metrics", get(health::metrics))
        .merge(tracking_routes)
        .nest("/api/v1/cron", cron_routes)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum_test::TestServer;
    use chrono::Utc;
    use mailpipe_common::{Config, ManualClock};
    use mailpipe_core::provider::{EmailProvider, OutboundEmail, ProviderError, SentEmail};
    use mailpipe_core::tracking::click_payload;
    use mailpipe_core::tracking::signing::sign_hex;
    use mailpipe_core::{CronReport, Pipeline, WebhookOutcome};
    use mailpipe_storage::models::{DeliveryLog, QueueStats};
    use mailpipe_storage::{MemoryStore, Repositories};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    struct AcceptAll;

    #[async_trait]
    impl EmailProvider for AcceptAll {
        async fn send(&self, _email: &OutboundEmail) -> Result<SentEmail, ProviderError> {
            Ok(SentEmail {
                provider_message_id: Some("accepted".into()),
            })
        }

        fn name(&self) -> &'static str {
            "accept-all"
        }
    }

    fn server_with(config: Config) -> (TestServer, Pipeline) {
        let pipeline = Pipeline::new(
            config,
            Repositories::memory(MemoryStore::new()),
            Arc::new(AcceptAll),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap();
        let app = create_router(AppState::new(pipeline.clone(), None));
        (TestServer::new(app).unwrap(), pipeline)
    }

    fn server() -> (TestServer, Pipeline) {
        server_with(Config::default())
    }

    fn bearer(token: &str) -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        )
    }

    fn transactional() -> Value {
        json!({
            "to_address": "ann@example.com",
            "subject": "Your receipt",
            "text_body": "Thanks for your order"
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (server, _) = server();

        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["status"], "healthy");

        let response = server.get("/health/detailed").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<Value>();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["provider"]["detail"]["name"], "accept-all");
        assert_eq!(body["database"]["detail"]["backend"], "memory");
    }

    #[tokio::test]
    async fn test_send_message_and_stats() {
        let (server, _) = server();

        let response = server.post("/api/v1/messages").json(&transactional()).await;
        assert_eq!(response.status_code(), StatusCode::ACCEPTED);
        assert_eq!(response.json::<Value>()["status"], "queued");

        let stats = server.get("/api/v1/messages/stats").await.json::<QueueStats>();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_send_message_validation_and_suppression() {
        let (server, pipeline) = server();

        let response = server
            .post("/api/v1/messages")
            .json(&json!({ "to_address": "not-an-address", "subject": "Hi", "text_body": "x" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.json::<Value>()["error"], "VALIDATION_ERROR");

        pipeline
            .repos
            .subscribers
            .add_suppression("ann@example.com", "complaint", Utc::now())
            .await
            .unwrap();
        let response = server.post("/api/v1/messages").json(&transactional()).await;
        assert_eq!(response.status_code(), StatusCode::CONFLICT);
        assert_eq!(response.json::<Value>()["error"], "RECIPIENT_SUPPRESSED");
    }

    #[tokio::test]
    async fn test_api_key_guard() {
        let mut config = Config::default();
        config.server.api_key = Some("k3y".into());
        let (server, _) = server_with(config);

        let response = server.post("/api/v1/messages").json(&transactional()).await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

        let (name, value) = bearer("k3y");
        let response = server
            .post("/api/v1/messages")
            .add_header(name, value)
            .json(&transactional())
            .await;
        assert_eq!(response.status_code(), StatusCode::ACCEPTED);

        // Recipient-facing routes stay open
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    async fn delivered(pipeline: &Pipeline, tracking_id: &str) {
        pipeline
            .repos
            .tracking
            .insert_delivery_log(&DeliveryLog {
                id: uuid::Uuid::now_v7(),
                message_id: uuid::Uuid::now_v7(),
                tracking_id: tracking_id.into(),
                to_address: "ann@example.com".into(),
                campaign_id: None,
                automation_id: None,
                ab_test_id: None,
                ab_variant: None,
                provider_message_id: None,
                sent_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_pixel_and_click_redirect() {
        let (server, pipeline) = server();
        delivered(&pipeline, "trk").await;

        let response = server.get("/track/open/unknown").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("content-type"), "image/gif");

        let response = server
            .get("/track/click/trk")
            .add_query_param("url", "https://shop.example.com/sale")
            .add_query_param("lid", 2)
            .await;
        assert_eq!(response.status_code(), StatusCode::FOUND);
        assert_eq!(response.header("location"), "https://shop.example.com/sale");

        let response = server
            .get("/track/click/trk")
            .add_query_param("url", "javascript:alert(1)")
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_click_redirect_refused_for_unknown_or_unsigned() {
        let mut config = Config::default();
        config.tracking.secret = Some("track-secret".into());
        let (server, pipeline) = server_with(config);
        delivered(&pipeline, "trk").await;

        let response = server
            .get("/track/click/unknown")
            .add_query_param("url", "https://evil.example.com")
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

        let response = server
            .get("/track/click/trk")
            .add_query_param("url", "https://evil.example.com")
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

        let target = "https://shop.example.com/sale";
        let signature = sign_hex("track-secret", click_payload("unknown", target).as_bytes());
        let response = server
            .get("/track/click/unknown")
            .add_query_param("url", target)
            .add_query_param("s", &signature)
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

        let signature = sign_hex("track-secret", click_payload("trk", target).as_bytes());
        let response = server
            .get("/track/click/trk")
            .add_query_param("url", target)
            .add_query_param("s", &signature)
            .await;
        assert_eq!(response.status_code(), StatusCode::FOUND);
        assert_eq!(response.header("location"), target);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_delivery() {
        let (server, _) = server();

        let response = server
            .get("/unsubscribe")
            .add_query_param("t", "missing")
            .add_query_param("e", "ann@example.com")
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_provider_webhook_signature() {
        let mut config = Config::default();
        config.provider.webhook_secret = Some("hook-secret".into());
        let (server, pipeline) = server_with(config);

        let body = serde_json::to_vec(&json!({
            "type": "bounced",
            "email": "bob@example.com",
            "message_id": "prov-1"
        }))
        .unwrap();

        let response = server
            .post("/webhooks/provider")
            .add_header(
                HeaderName::from_static("x-webhook-signature"),
                HeaderValue::from_static("00"),
            )
            .bytes(body.clone().into())
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

        let signature = sign_hex("hook-secret", &body);
        let response = server
            .post("/webhooks/provider")
            .add_header(
                HeaderName::from_static("x-webhook-signature"),
                HeaderValue::from_str(&signature).unwrap(),
            )
            .bytes(body.into())
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(response.json::<WebhookOutcome>().suppressed);

        assert!(pipeline
            .repos
            .subscribers
            .is_suppressed("bob@example.com")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_provider_webhook_rejects_garbage() {
        let (server, _) = server();

        let response = server
            .post("/webhooks/provider")
            .bytes(b"not json".to_vec().into())
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_campaign_and_ab_test() {
        let (server, _) = server();
        let id = uuid::Uuid::new_v4();

        let response = server.post(&format!("/api/v1/campaigns/{}/send", id)).await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

        let response = server.post(&format!("/api/v1/ab-tests/{}/evaluate", id)).await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trigger_rejects_invalid_email() {
        let (server, _) = server();

        let response = server
            .post("/api/v1/automations/trigger")
            .json(&json!({ "trigger": "welcome", "event": { "email": "nope" } }))
            .await;
        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = server
            .post("/api/v1/automations/trigger")
            .json(&json!({ "trigger": "welcome", "event": { "email": "ann@example.com" } }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cron_run_and_secret() {
        let mut config = Config::default();
        config.cron.secret = Some("tick".into());
        let (server, _) = server_with(config);

        server.post("/api/v1/messages").json(&transactional()).await;

        let response = server.post("/api/v1/cron/run").await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

        let (name, value) = bearer("tick");
        let response = server.post("/api/v1/cron/run").add_header(name, value).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let report = response.json::<CronReport>();
        assert_eq!(report.jobs.len(), 5);
        assert!(report.jobs.iter().all(|j| j.success));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let (server, _) = server();
        server.post("/api/v1/messages").json(&transactional()).await;

        let response = server.get("/metrics").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(response.text().contains("mailpipe_messages_enqueued_total"));
    }
}
