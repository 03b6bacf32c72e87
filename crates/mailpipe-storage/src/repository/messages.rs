//! Outbound message queue repository

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use crate::models::{MessageStatus, NewMessage, QueueStats, QueuedMessage, TransitionError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailpipe_common::types::{CampaignId, MessageId};
use mailpipe_common::{Error, Result};
use sqlx::types::Json;
use std::collections::HashMap;
use uuid::Uuid;

const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Message queue repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert(&self, input: NewMessage, now: DateTime<Utc>) -> Result<QueuedMessage>;

    /// Insert all messages or none
    async fn insert_batch(&self, inputs: Vec<NewMessage>, now: DateTime<Utc>) -> Result<u64>;

    async fn get(&self, id: MessageId) -> Result<Option<QueuedMessage>>;

    /// Move up to `limit` due pending messages to processing and return them,
    /// highest priority first, then oldest schedule
    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>>;

    async fn mark_sent(
        &self,
        id: MessageId,
        provider_message_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Count the attempt and put the message back to pending until `next_retry_at`
    async fn schedule_retry(
        &self,
        id: MessageId,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Terminal failure. `count_attempt` is false for configuration errors.
    async fn mark_failed(
        &self,
        id: MessageId,
        error: &str,
        count_attempt: bool,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Revive failed messages below the attempt ceiling whose retry time has passed
    async fn requeue_failed(&self, attempt_ceiling: i32, now: DateTime<Utc>) -> Result<u64>;

    async fn cancel_for_campaign(
        &self,
        campaign_id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Revert only messages cancelled with `reason`
    async fn resume_for_campaign(
        &self,
        campaign_id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn count_failed_since(&self, since: DateTime<Utc>) -> Result<i64>;

    async fn count_errors_since(&self, since: DateTime<Utc>) -> Result<i64>;

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Delivery results are only recorded against rows still in processing
fn ensure_settled(id: MessageId, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        return Err(Error::InvalidTransition(format!(
            "message {} is not processing",
            id
        )));
    }
    Ok(())
}

fn settle(
    messages: &mut HashMap<MessageId, QueuedMessage>,
    id: MessageId,
    next: MessageStatus,
) -> Result<&mut QueuedMessage> {
    let m = messages
        .get_mut(&id)
        .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;
    if m.status != MessageStatus::Processing {
        return Err(TransitionError {
            kind: "message",
            from: m.status.as_str(),
            to: next.as_str(),
        }
        .into());
    }
    m.status = m.status.transition(next)?;
    Ok(m)
}

fn build_message(input: NewMessage, now: DateTime<Utc>) -> QueuedMessage {
    QueuedMessage {
        id: Uuid::now_v7(),
        to_address: input.to_address,
        from_address: input.from_address,
        from_name: input.from_name,
        reply_to: input.reply_to,
        subject: input.subject,
        html_body: input.html_body,
        text_body: input.text_body,
        campaign_id: input.campaign_id,
        automation_id: input.automation_id,
        template_id: input.template_id,
        subscriber_id: input.subscriber_id,
        priority: input.priority,
        status: MessageStatus::Pending,
        scheduled_at: input.scheduled_at.unwrap_or(now),
        attempts: 0,
        max_attempts: input.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        next_retry_at: None,
        last_attempt_at: None,
        provider_message_id: None,
        error_message: None,
        cancel_reason: None,
        metadata: Json(input.metadata),
        sent_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn sort_claimed(messages: &mut [QueuedMessage]) {
    messages.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.scheduled_at.cmp(&b.scheduled_at))
            .then(a.created_at.cmp(&b.created_at))
    });
}

/// Database message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const INSERT_SQL: &str = r#"
    INSERT INTO email_queue (
        id, to_address, from_address, from_name, reply_to, subject, html_body, text_body,
        campaign_id, automation_id, template_id, subscriber_id, priority, status,
        scheduled_at, attempts, max_attempts, metadata, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 0, $16, $17, $18, $18)
    RETURNING *
"#;

fn bind_insert<'q>(
    m: &'q QueuedMessage,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, QueuedMessage, sqlx::postgres::PgArguments> {
    sqlx::query_as::<_, QueuedMessage>(INSERT_SQL)
        .bind(m.id)
        .bind(&m.to_address)
        .bind(&m.from_address)
        .bind(&m.from_name)
        .bind(&m.reply_to)
        .bind(&m.subject)
        .bind(&m.html_body)
        .bind(&m.text_body)
        .bind(m.campaign_id)
        .bind(m.automation_id)
        .bind(m.template_id)
        .bind(m.subscriber_id)
        .bind(m.priority)
        .bind(m.status.as_str())
        .bind(m.scheduled_at)
        .bind(m.max_attempts)
        .bind(&m.metadata)
        .bind(m.created_at)
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn insert(&self, input: NewMessage, now: DateTime<Utc>) -> Result<QueuedMessage> {
        let message = build_message(input, now);
        bind_insert(&message)
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn insert_batch(&self, inputs: Vec<NewMessage>, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut count = 0u64;
        for input in inputs {
            let message = build_message(input, now);
            bind_insert(&message)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            count += 1;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count)
    }

    async fn get(&self, id: MessageId) -> Result<Option<QueuedMessage>> {
        sqlx::query_as::<_, QueuedMessage>("SELECT * FROM email_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>> {
        let mut claimed = sqlx::query_as::<_, QueuedMessage>(
            r#"
            UPDATE email_queue SET
                status = 'processing',
                last_attempt_at = $2,
                updated_at = $2
            WHERE id IN (
                SELECT id FROM email_queue
                WHERE status = 'pending'
                  AND scheduled_at <= $2
                  AND (next_retry_at IS NULL OR next_retry_at <= $2)
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(limit)
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sort_claimed(&mut claimed);
        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: MessageId,
        provider_message_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue SET
                status = 'sent',
                attempts = attempts + 1,
                provider_message_id = $2,
                error_message = NULL,
                next_retry_at = NULL,
                sent_at = $3,
                updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        ensure_settled(id, result.rows_affected())
    }

    async fn schedule_retry(
        &self,
        id: MessageId,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue SET
                status = 'pending',
                attempts = attempts + 1,
                error_message = $2,
                next_retry_at = $3,
                updated_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        ensure_settled(id, result.rows_affected())
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        error: &str,
        count_attempt: bool,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue SET
                status = 'failed',
                attempts = CASE WHEN $3 THEN attempts + 1 ELSE attempts END,
                error_message = $2,
                next_retry_at = $4,
                updated_at = $5
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(count_attempt)
        .bind(next_retry_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        ensure_settled(id, result.rows_affected())
    }

    async fn requeue_failed(&self, attempt_ceiling: i32, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue SET
                status = 'pending',
                max_attempts = GREATEST(max_attempts, attempts + 1),
                updated_at = $2
            WHERE status = 'failed'
              AND attempts < $1
              AND next_retry_at <= $2
            "#,
        )
        .bind(attempt_ceiling)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn cancel_for_campaign(
        &self,
        campaign_id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue SET
                status = 'cancelled',
                cancel_reason = $2,
                updated_at = $3
            WHERE campaign_id = $1 AND status = 'pending'
            "#,
        )
        .bind(campaign_id)
        .bind(reason)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn resume_for_campaign(
        &self,
        campaign_id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue SET
                status = 'pending',
                cancel_reason = NULL,
                updated_at = $3
            WHERE campaign_id = $1 AND status = 'cancelled' AND cancel_reason = $2
            "#,
        )
        .bind(campaign_id)
        .bind(reason)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM email_queue GROUP BY status")
                .fetch_all(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<MessageStatus>() {
                Ok(MessageStatus::Pending) => stats.pending = count,
                Ok(MessageStatus::Processing) => stats.processing = count,
                Ok(MessageStatus::Sent) => stats.sent = count,
                Ok(MessageStatus::Failed) => stats.failed = count,
                Ok(MessageStatus::Cancelled) => stats.cancelled = count,
                Err(e) => tracing::warn!(error = %e, "Ignoring unknown queue status"),
            }
        }
        Ok(stats)
    }

    async fn count_failed_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM email_queue WHERE status = 'failed' AND updated_at >= $1",
        )
        .bind(since)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }

    async fn count_errors_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM email_queue WHERE error_message IS NOT NULL AND updated_at >= $1",
        )
        .bind(since)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM email_queue
            WHERE status IN ('sent', 'failed', 'cancelled') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn insert(&self, input: NewMessage, now: DateTime<Utc>) -> Result<QueuedMessage> {
        let message = build_message(input, now);
        self.state().messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn insert_batch(&self, inputs: Vec<NewMessage>, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        MemoryStore::check_batch(&state, &inputs)?;

        let mut count = 0u64;
        for input in inputs {
            let message = build_message(input, now);
            state.messages.insert(message.id, message);
            count += 1;
        }
        Ok(count)
    }

    async fn get(&self, id: MessageId) -> Result<Option<QueuedMessage>> {
        Ok(self.state().messages.get(&id).cloned())
    }

    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>> {
        let mut state = self.state();
        let mut due: Vec<QueuedMessage> = state
            .messages
            .values()
            .filter(|m| {
                m.status == MessageStatus::Pending
                    && m.scheduled_at <= now
                    && m.next_retry_at.map_or(true, |t| t <= now)
            })
            .cloned()
            .collect();

        sort_claimed(&mut due);
        due.truncate(limit.max(0) as usize);

        for message in due.iter_mut() {
            message.status = message.status.transition(MessageStatus::Processing)?;
            message.last_attempt_at = Some(now);
            message.updated_at = now;
            state.messages.insert(message.id, message.clone());
        }
        Ok(due)
    }

    async fn mark_sent(
        &self,
        id: MessageId,
        provider_message_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let m = settle(&mut state.messages, id, MessageStatus::Sent)?;
        m.attempts += 1;
        m.provider_message_id = provider_message_id.map(str::to_string);
        m.error_message = None;
        m.next_retry_at = None;
        m.sent_at = Some(now);
        m.updated_at = now;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: MessageId,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let m = settle(&mut state.messages, id, MessageStatus::Pending)?;
        m.attempts += 1;
        m.error_message = Some(error.to_string());
        m.next_retry_at = Some(next_retry_at);
        m.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        error: &str,
        count_attempt: bool,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let m = settle(&mut state.messages, id, MessageStatus::Failed)?;
        if count_attempt {
            m.attempts += 1;
        }
        m.error_message = Some(error.to_string());
        m.next_retry_at = next_retry_at;
        m.updated_at = now;
        Ok(())
    }

    async fn requeue_failed(&self, attempt_ceiling: i32, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let mut count = 0;
        for m in state.messages.values_mut() {
            if m.status == MessageStatus::Failed
                && m.attempts < attempt_ceiling
                && m.next_retry_at.map_or(false, |t| t <= now)
            {
                m.status = m.status.transition(MessageStatus::Pending)?;
                m.max_attempts = m.max_attempts.max(m.attempts + 1);
                m.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel_for_campaign(
        &self,
        campaign_id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state();
        let mut count = 0;
        for m in state.messages.values_mut() {
            if m.campaign_id == Some(campaign_id) && m.status == MessageStatus::Pending {
                m.status = m.status.transition(MessageStatus::Cancelled)?;
                m.cancel_reason = Some(reason.to_string());
                m.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn resume_for_campaign(
        &self,
        campaign_id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state();
        let mut count = 0;
        for m in state.messages.values_mut() {
            if m.campaign_id == Some(campaign_id)
                && m.status == MessageStatus::Cancelled
                && m.cancel_reason.as_deref() == Some(reason)
            {
                m.status = m.status.transition(MessageStatus::Pending)?;
                m.cancel_reason = None;
                m.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state();
        let mut stats = QueueStats::default();
        for m in state.messages.values() {
            match m.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Sent => stats.sent += 1,
                MessageStatus::Failed => stats.failed += 1,
                MessageStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn count_failed_since(&self, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .state()
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Failed && m.updated_at >= since)
            .count() as i64)
    }

    async fn count_errors_since(&self, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .state()
            .messages
            .values()
            .filter(|m| m.error_message.is_some() && m.updated_at >= since)
            .count() as i64)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let before = state.messages.len();
        state
            .messages
            .retain(|_, m| !(m.status.is_terminal() && m.updated_at < cutoff));
        Ok((before - state.messages.len()) as u64)
    }
}
