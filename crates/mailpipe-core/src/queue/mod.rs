//! Outbound message queue
//!
//! [`MessageQueue`] is the write side (enqueue, pause/resume, retry sweep);
//! [`QueueWorker`] claims due messages and hands them to the provider.

mod worker;

pub use worker::{ProcessReport, QueueWorker};
pub(crate) use worker::LIST_UNSUBSCRIBE_KEY;

use crate::eligibility::{Eligibility, EligibilityGate};
use crate::metrics::Metrics;
use chrono::Duration;
use mailpipe_common::config::QueueConfig;
use mailpipe_common::types::{CampaignId, EmailAddress, MessageId};
use mailpipe_common::{Clock, Error, Result};
use mailpipe_storage::models::{NewMessage, QueueStats};
use mailpipe_storage::MessageRepository;
use std::sync::Arc;
use tracing::{debug, info};

/// Cancel reason stamped on messages held back by a paused campaign
pub const PAUSE_REASON: &str = "campaign_paused";

/// Calculate exponential backoff delay
pub fn calculate_backoff(attempts: i32) -> Duration {
    // Base: 1 minute, max: 4 hours
    let exponent = attempts.clamp(0, 16) as u32;
    let minutes = std::cmp::min(2_i64.pow(exponent), 240);
    Duration::minutes(minutes)
}

fn source_label(input: &NewMessage) -> &'static str {
    if input.campaign_id.is_some() {
        "campaign"
    } else if input.automation_id.is_some() {
        "automation"
    } else {
        "transactional"
    }
}

/// Write side of the queue
#[derive(Clone)]
pub struct MessageQueue {
    messages: Arc<dyn MessageRepository>,
    gate: EligibilityGate,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    config: QueueConfig,
}

impl MessageQueue {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        gate: EligibilityGate,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: QueueConfig,
    ) -> Self {
        Self {
            messages,
            gate,
            clock,
            metrics,
            config,
        }
    }

    fn validate(&self, input: &mut NewMessage) -> Result<()> {
        let address = input.to_address.trim();
        if EmailAddress::parse(address).is_none() {
            return Err(Error::Validation(format!(
                "Invalid recipient address: {}",
                input.to_address
            )));
        }
        input.to_address = address.to_string();

        if input.subject.trim().is_empty() {
            return Err(Error::Validation("Subject must not be empty".into()));
        }

        let has_body = |body: &Option<String>| body.as_deref().is_some_and(|b| !b.trim().is_empty());
        if !has_body(&input.html_body) && !has_body(&input.text_body) {
            return Err(Error::Validation(
                "Message needs an HTML or text body".into(),
            ));
        }

        match input.max_attempts {
            Some(n) if n < 1 => {
                return Err(Error::Validation("max_attempts must be at least 1".into()))
            }
            None => input.max_attempts = Some(self.config.max_attempts),
            _ => {}
        }
        Ok(())
    }

    /// Validate and insert one pending message
    pub async fn enqueue(&self, mut input: NewMessage) -> Result<MessageId> {
        self.validate(&mut input)?;
        let source = source_label(&input);

        let message = self.messages.insert(input, self.clock.now()).await?;
        self.metrics.messages_enqueued.with_label_values(&[source]).inc();

        debug!(
            message_id = %message.id,
            to = %message.to_address,
            priority = message.priority,
            "Enqueued message"
        );
        Ok(message.id)
    }

    /// Immediate send for a single recipient; checked against suppression
    /// and subscriber status first
    pub async fn enqueue_transactional(&self, mut input: NewMessage) -> Result<MessageId> {
        if input.priority == 0 {
            input.priority = self.config.transactional_priority;
        }

        if let Eligibility::Rejected(reason) = self.gate.check_recipient(&input.to_address).await? {
            info!(to = %input.to_address, reason = %reason, "Transactional send rejected");
            return Err(Error::Suppressed(reason.to_string()));
        }

        self.enqueue(input).await
    }

    /// Insert many messages without per-message suppression checks.
    /// The batch is all-or-nothing.
    pub async fn enqueue_batch(&self, inputs: Vec<NewMessage>) -> Result<u64> {
        if inputs.is_empty() {
            return Ok(0);
        }

        let mut validated = Vec::with_capacity(inputs.len());
        for mut input in inputs {
            self.validate(&mut input)?;
            validated.push(input);
        }
        let source = source_label(&validated[0]);

        let inserted = self
            .messages
            .insert_batch(validated, self.clock.now())
            .await?;
        self.metrics
            .messages_enqueued
            .with_label_values(&[source])
            .inc_by(inserted);
        Ok(inserted)
    }

    /// Hold back every pending message of a campaign
    pub async fn cancel_for_campaign(&self, campaign_id: CampaignId) -> Result<u64> {
        let cancelled = self
            .messages
            .cancel_for_campaign(campaign_id, PAUSE_REASON, self.clock.now())
            .await?;
        info!(campaign_id = %campaign_id, cancelled, "Cancelled pending campaign messages");
        Ok(cancelled)
    }

    /// Release messages held back by [`cancel_for_campaign`](Self::cancel_for_campaign)
    pub async fn resume_for_campaign(&self, campaign_id: CampaignId) -> Result<u64> {
        let resumed = self
            .messages
            .resume_for_campaign(campaign_id, PAUSE_REASON, self.clock.now())
            .await?;
        info!(campaign_id = %campaign_id, resumed, "Resumed campaign messages");
        Ok(resumed)
    }

    /// Flip failed messages below the retry ceiling back to pending
    pub async fn retry_failed_emails(&self) -> Result<u64> {
        let requeued = self
            .messages
            .requeue_failed(self.config.retry_ceiling, self.clock.now())
            .await?;
        if requeued > 0 {
            info!(requeued, "Requeued failed messages");
        }
        Ok(requeued)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.messages.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailpipe_common::ManualClock;
    use mailpipe_storage::models::MessageStatus;
    use mailpipe_storage::{MemoryStore, SubscriberRepository};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn queue(store: &MemoryStore, clock: &ManualClock) -> MessageQueue {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let gate = EligibilityGate::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            clock.clone(),
        );
        MessageQueue::new(
            Arc::new(store.clone()),
            gate,
            clock,
            Metrics::new().unwrap(),
            QueueConfig::default(),
        )
    }

    fn message(to: &str) -> NewMessage {
        NewMessage {
            to_address: to.into(),
            subject: "Hello".into(),
            text_body: Some("Hi".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(0), Duration::minutes(1));
        assert_eq!(calculate_backoff(1), Duration::minutes(2));
        assert_eq!(calculate_backoff(2), Duration::minutes(4));
        assert_eq!(calculate_backoff(3), Duration::minutes(8));
        assert_eq!(calculate_backoff(10), Duration::minutes(240)); // Max capped at 4 hours
        assert_eq!(calculate_backoff(99), Duration::minutes(240));
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let id = queue(&store, &clock).enqueue(message(" ann@example.com ")).await.unwrap();

        let stored = store.messages().into_iter().find(|m| m.id == id).unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.to_address, "ann@example.com");
        assert_eq!(stored.scheduled_at, clock.now());
        assert_eq!(stored.max_attempts, 3);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let queue = queue(&store, &clock);

        assert!(matches!(
            queue.enqueue(message("not-an-address")).await,
            Err(Error::Validation(_))
        ));

        let mut no_subject = message("a@example.com");
        no_subject.subject = "  ".into();
        assert!(matches!(queue.enqueue(no_subject).await, Err(Error::Validation(_))));

        let mut no_body = message("a@example.com");
        no_body.text_body = None;
        assert!(matches!(queue.enqueue(no_body).await, Err(Error::Validation(_))));

        let mut zero_attempts = message("a@example.com");
        zero_attempts.max_attempts = Some(0);
        assert!(matches!(queue.enqueue(zero_attempts).await, Err(Error::Validation(_))));

        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_transactional_send_rejects_suppressed() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        store
            .add_suppression("blocked@example.com", "bounce", clock.now())
            .await
            .unwrap();

        let queue = queue(&store, &clock);
        let err = queue
            .enqueue_transactional(message("blocked@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Suppressed(ref reason) if reason == "suppressed"));

        let id = queue
            .enqueue_transactional(message("ok@example.com"))
            .await
            .unwrap();
        let stored = store.messages().into_iter().find(|m| m.id == id).unwrap();
        assert_eq!(stored.priority, 10);
    }

    #[tokio::test]
    async fn test_batch_skips_suppression_checks() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        store
            .add_suppression("blocked@example.com", "bounce", clock.now())
            .await
            .unwrap();

        let inserted = queue(&store, &clock)
            .enqueue_batch(vec![message("blocked@example.com"), message("b@example.com")])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume_only_touch_paused_rows() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let queue = queue(&store, &clock);
        let campaign_id = Uuid::now_v7();

        let mut inputs = Vec::new();
        for to in ["a@example.com", "b@example.com"] {
            let mut m = message(to);
            m.campaign_id = Some(campaign_id);
            inputs.push(m);
        }
        queue.enqueue_batch(inputs).await.unwrap();
        queue.enqueue(message("other@example.com")).await.unwrap();

        assert_eq!(queue.cancel_for_campaign(campaign_id).await.unwrap(), 2);
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.pending, stats.cancelled), (1, 2));

        assert_eq!(queue.resume_for_campaign(campaign_id).await.unwrap(), 2);
        assert_eq!(queue.stats().await.unwrap().pending, 3);
    }
}
