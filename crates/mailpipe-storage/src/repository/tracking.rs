//! Delivery log and tracking event repository

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use crate::models::{DeliveryLog, TrackingEvent, TrackingEventType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailpipe_common::{Error, Result};

/// Tracking repository trait
#[async_trait]
pub trait TrackingRepository: Send + Sync {
    async fn insert_delivery_log(&self, log: &DeliveryLog) -> Result<()>;

    async fn get_delivery_log(&self, tracking_id: &str) -> Result<Option<DeliveryLog>>;

    async fn find_delivery_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryLog>>;

    async fn insert_event(&self, event: &TrackingEvent) -> Result<()>;

    async fn has_event(&self, tracking_id: &str, event_type: TrackingEventType) -> Result<bool>;

    async fn list_events(&self, tracking_id: &str) -> Result<Vec<TrackingEvent>>;

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn delete_delivery_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Database tracking repository
pub struct DbTrackingRepository {
    pool: DatabasePool,
}

impl DbTrackingRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackingRepository for DbTrackingRepository {
    async fn insert_delivery_log(&self, log: &DeliveryLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_logs (
                id, message_id, tracking_id, to_address, campaign_id, automation_id,
                ab_test_id, ab_variant, provider_message_id, sent_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tracking_id) DO NOTHING
            "#,
        )
        .bind(log.id)
        .bind(log.message_id)
        .bind(&log.tracking_id)
        .bind(&log.to_address)
        .bind(log.campaign_id)
        .bind(log.automation_id)
        .bind(log.ab_test_id)
        .bind(&log.ab_variant)
        .bind(&log.provider_message_id)
        .bind(log.sent_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_delivery_log(&self, tracking_id: &str) -> Result<Option<DeliveryLog>> {
        sqlx::query_as::<_, DeliveryLog>("SELECT * FROM delivery_logs WHERE tracking_id = $1")
            .bind(tracking_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_delivery_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryLog>> {
        sqlx::query_as::<_, DeliveryLog>(
            "SELECT * FROM delivery_logs WHERE provider_message_id = $1 ORDER BY sent_at DESC LIMIT 1",
        )
        .bind(provider_message_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn insert_event(&self, event: &TrackingEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracking_events (
                id, tracking_id, message_id, campaign_id, automation_id, event_type,
                link_url, link_id, device_type, email_client, user_agent, ip_address, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(event.id)
        .bind(&event.tracking_id)
        .bind(event.message_id)
        .bind(event.campaign_id)
        .bind(event.automation_id)
        .bind(event.event_type.as_str())
        .bind(&event.link_url)
        .bind(event.link_id)
        .bind(event.device_type.as_str())
        .bind(event.email_client.as_str())
        .bind(&event.user_agent)
        .bind(&event.ip_address)
        .bind(event.created_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn has_event(&self, tracking_id: &str, event_type: TrackingEventType) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM tracking_events WHERE tracking_id = $1 AND event_type = $2)",
        )
        .bind(tracking_id)
        .bind(event_type.as_str())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.0)
    }

    async fn list_events(&self, tracking_id: &str) -> Result<Vec<TrackingEvent>> {
        sqlx::query_as::<_, TrackingEvent>(
            "SELECT * FROM tracking_events WHERE tracking_id = $1 ORDER BY created_at ASC",
        )
        .bind(tracking_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tracking_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn delete_delivery_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delivery_logs WHERE sent_at < $1")
            .bind(cutoff)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TrackingRepository for MemoryStore {
    async fn insert_delivery_log(&self, log: &DeliveryLog) -> Result<()> {
        self.state()
            .delivery_logs
            .entry(log.tracking_id.clone())
            .or_insert_with(|| log.clone());
        Ok(())
    }

    async fn get_delivery_log(&self, tracking_id: &str) -> Result<Option<DeliveryLog>> {
        Ok(self.state().delivery_logs.get(tracking_id).cloned())
    }

    async fn find_delivery_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryLog>> {
        Ok(self
            .state()
            .delivery_logs
            .values()
            .filter(|l| l.provider_message_id.as_deref() == Some(provider_message_id))
            .max_by_key(|l| l.sent_at)
            .cloned())
    }

    async fn insert_event(&self, event: &TrackingEvent) -> Result<()> {
        self.state().tracking_events.push(event.clone());
        Ok(())
    }

    async fn has_event(&self, tracking_id: &str, event_type: TrackingEventType) -> Result<bool> {
        Ok(self
            .state()
            .tracking_events
            .iter()
            .any(|e| e.tracking_id == tracking_id && e.event_type == event_type))
    }

    async fn list_events(&self, tracking_id: &str) -> Result<Vec<TrackingEvent>> {
        Ok(self
            .state()
            .tracking_events
            .iter()
            .filter(|e| e.tracking_id == tracking_id)
            .cloned()
            .collect())
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let before = state.tracking_events.len();
        state.tracking_events.retain(|e| e.created_at >= cutoff);
        Ok((before - state.tracking_events.len()) as u64)
    }

    async fn delete_delivery_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let before = state.delivery_logs.len();
        state.delivery_logs.retain(|_, l| l.sent_at >= cutoff);
        Ok((before - state.delivery_logs.len()) as u64)
    }
}
