//! Provider webhook event repository

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use crate::models::{WebhookEvent, WebhookEventType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailpipe_common::{Error, Result};
use sqlx::types::Json;
use uuid::Uuid;

/// Webhook repository trait
#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn insert(
        &self,
        event_type: WebhookEventType,
        email: &str,
        provider_message_id: Option<&str>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent>;

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Remove processed events older than `cutoff`
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Database webhook repository
pub struct DbWebhookRepository {
    pool: DatabasePool,
}

impl DbWebhookRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookRepository for DbWebhookRepository {
    async fn insert(
        &self,
        event_type: WebhookEventType,
        email: &str,
        provider_message_id: Option<&str>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent> {
        sqlx::query_as::<_, WebhookEvent>(
            r#"
            INSERT INTO webhook_events (id, event_type, email, provider_message_id, payload, processed, created_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event_type.as_str())
        .bind(email)
        .bind(provider_message_id)
        .bind(Json(payload))
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE webhook_events SET processed = TRUE, processed_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM webhook_events WHERE processed = TRUE AND created_at < $1")
                .bind(cutoff)
                .execute(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WebhookRepository for MemoryStore {
    async fn insert(
        &self,
        event_type: WebhookEventType,
        email: &str,
        provider_message_id: Option<&str>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent> {
        let event = WebhookEvent {
            id: Uuid::now_v7(),
            event_type,
            email: email.to_string(),
            provider_message_id: provider_message_id.map(str::to_string),
            payload: Json(payload),
            processed: false,
            processed_at: None,
            created_at: now,
        };
        self.state().webhooks.push(event.clone());
        Ok(event)
    }

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(event) = self.state().webhooks.iter_mut().find(|e| e.id == id) {
            event.processed = true;
            event.processed_at = Some(now);
        }
        Ok(())
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let before = state.webhooks.len();
        state
            .webhooks
            .retain(|e| !(e.processed && e.created_at < cutoff));
        Ok((before - state.webhooks.len()) as u64)
    }
}
