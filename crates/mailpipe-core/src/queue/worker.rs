//! Queue Worker - claims due messages and delivers them through the provider

use super::calculate_backoff;
use crate::metrics::Metrics;
use crate::provider::{EmailProvider, OutboundEmail, ProviderError};
use mailpipe_common::config::{ProviderConfig, QueueConfig};
use mailpipe_common::{Clock, Result};
use mailpipe_storage::models::{DeliveryLog, QueuedMessage};
use mailpipe_storage::{MessageRepository, TrackingRepository};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Metadata key carrying the `List-Unsubscribe` value
pub(crate) const LIST_UNSUBSCRIBE_KEY: &str = "list_unsubscribe";

/// Aggregate result of one queue pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub retried: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Retried,
    Failed,
}

/// Queue worker
#[derive(Clone)]
pub struct QueueWorker {
    messages: Arc<dyn MessageRepository>,
    tracking: Arc<dyn TrackingRepository>,
    provider: Arc<dyn EmailProvider>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    queue_config: QueueConfig,
    provider_config: ProviderConfig,
}

impl QueueWorker {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        tracking: Arc<dyn TrackingRepository>,
        provider: Arc<dyn EmailProvider>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        queue_config: QueueConfig,
        provider_config: ProviderConfig,
    ) -> Self {
        Self {
            messages,
            tracking,
            provider,
            clock,
            metrics,
            queue_config,
            provider_config,
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmailProvider> {
        &self.provider
    }

    /// Claim up to `limit` due messages and deliver them
    pub async fn process_queue(&self, limit: i64) -> Result<ProcessReport> {
        let claimed = self.messages.claim_due(limit, self.clock.now()).await?;
        let mut report = ProcessReport {
            processed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        debug!(count = claimed.len(), "Claimed queued messages");

        let semaphore = Arc::new(Semaphore::new(self.queue_config.concurrency.max(1)));
        let mut handles = Vec::with_capacity(claimed.len());

        for message in claimed {
            let permit = semaphore.clone().acquire_owned().await.ok();
            let worker = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let message_id = message.id;
                (message_id, worker.deliver(message).await)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((_, Ok(Delivery::Sent))) => report.sent += 1,
                Ok((_, Ok(Delivery::Retried))) => report.retried += 1,
                Ok((_, Ok(Delivery::Failed))) => report.failed += 1,
                Ok((message_id, Err(e))) => {
                    error!(message_id = %message_id, "Failed to record delivery result: {}", e);
                }
                Err(e) => error!("Delivery task panicked: {}", e),
            }
        }

        info!(
            processed = report.processed,
            sent = report.sent,
            failed = report.failed,
            retried = report.retried,
            "Queue pass finished"
        );
        Ok(report)
    }

    fn outbound(&self, message: &QueuedMessage) -> OutboundEmail {
        OutboundEmail {
            message_id: message.id,
            to: message.to_address.clone(),
            from_address: message
                .from_address
                .clone()
                .unwrap_or_else(|| self.provider_config.from_address.clone()),
            from_name: message
                .from_name
                .clone()
                .or_else(|| self.provider_config.from_name.clone()),
            reply_to: message
                .reply_to
                .clone()
                .or_else(|| self.provider_config.reply_to.clone()),
            subject: message.subject.clone(),
            html_body: message.html_body.clone(),
            text_body: message.text_body.clone(),
            list_unsubscribe: message
                .metadata
                .extra
                .get(LIST_UNSUBSCRIBE_KEY)
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }

    async fn deliver(&self, message: QueuedMessage) -> Result<Delivery> {
        let email = self.outbound(&message);
        let timeout = Duration::from_secs(self.provider_config.timeout_secs.max(1));

        let result = match tokio::time::timeout(timeout, self.provider.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "provider timed out after {}s",
                timeout.as_secs()
            ))),
        };

        let now = self.clock.now();
        match result {
            Ok(sent) => {
                self.messages
                    .mark_sent(message.id, sent.provider_message_id.as_deref(), now)
                    .await?;

                let log = DeliveryLog {
                    id: Uuid::now_v7(),
                    message_id: message.id,
                    tracking_id: message
                        .tracking_id()
                        .map(str::to_string)
                        .unwrap_or_else(|| message.id.to_string()),
                    to_address: message.to_address.clone(),
                    campaign_id: message.campaign_id,
                    automation_id: message.automation_id,
                    ab_test_id: message.metadata.ab_test_id,
                    ab_variant: message.metadata.ab_variant.map(|v| v.to_string()),
                    provider_message_id: sent.provider_message_id,
                    sent_at: now,
                };
                self.tracking.insert_delivery_log(&log).await?;
                self.metrics.messages_sent.inc();

                debug!(message_id = %message.id, to = %message.to_address, "Message sent");
                Ok(Delivery::Sent)
            }
            Err(ProviderError::Transient(reason)) => {
                let attempts = message.attempts + 1;
                let next_retry_at = now + calculate_backoff(attempts);

                if attempts < message.max_attempts {
                    self.messages
                        .schedule_retry(message.id, &reason, next_retry_at, now)
                        .await?;
                    self.metrics.messages_retried.inc();
                    warn!(
                        message_id = %message.id,
                        attempts,
                        next_retry_at = %next_retry_at,
                        "Transient delivery failure, will retry: {}",
                        reason
                    );
                    Ok(Delivery::Retried)
                } else {
                    self.messages
                        .mark_failed(message.id, &reason, true, Some(next_retry_at), now)
                        .await?;
                    self.metrics.messages_failed.inc();
                    warn!(message_id = %message.id, attempts, "Delivery attempts exhausted: {}", reason);
                    Ok(Delivery::Failed)
                }
            }
            Err(ProviderError::Permanent(reason)) => {
                self.messages
                    .mark_failed(message.id, &reason, true, None, now)
                    .await?;
                self.metrics.messages_failed.inc();
                warn!(message_id = %message.id, to = %message.to_address, "Permanent delivery failure: {}", reason);
                Ok(Delivery::Failed)
            }
            Err(ProviderError::Configuration(reason)) => {
                self.messages
                    .mark_failed(message.id, &reason, false, None, now)
                    .await?;
                self.metrics.messages_failed.inc();
                error!(message_id = %message.id, provider = self.provider.name(), "Provider misconfigured: {}", reason);
                Ok(Delivery::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SentEmail;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use mailpipe_common::ManualClock;
    use mailpipe_storage::models::{MessageMetadata, MessageStatus, NewMessage};
    use mailpipe_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted results, then succeeds
    #[derive(Default)]
    struct ScriptedProvider {
        script: Mutex<VecDeque<std::result::Result<(), ProviderError>>>,
        sent: Mutex<Vec<OutboundEmail>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn with(results: Vec<std::result::Result<(), ProviderError>>) -> Self {
            Self {
                script: Mutex::new(results.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl EmailProvider for ScriptedProvider {
        async fn send(&self, email: &OutboundEmail) -> std::result::Result<SentEmail, ProviderError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            next?;
            self.sent.lock().unwrap().push(email.clone());
            Ok(SentEmail {
                provider_message_id: Some(format!("prov-{}", email.message_id)),
            })
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn worker(store: &MemoryStore, clock: &ManualClock, provider: Arc<ScriptedProvider>) -> QueueWorker {
        QueueWorker::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            provider,
            Arc::new(clock.clone()),
            Metrics::new().unwrap(),
            QueueConfig::default(),
            ProviderConfig::default(),
        )
    }

    async fn enqueue(store: &MemoryStore, clock: &ManualClock, to: &str, priority: i32) -> Uuid {
        store
            .insert(
                NewMessage {
                    to_address: to.into(),
                    subject: "Hi".into(),
                    text_body: Some("Hi".into()),
                    priority,
                    metadata: MessageMetadata {
                        tracking_id: Some(format!("trk-{}", to)),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                clock.now(),
            )
            .await
            .unwrap()
            .id
    }

    fn stored(store: &MemoryStore, id: Uuid) -> QueuedMessage {
        store.messages().into_iter().find(|m| m.id == id).unwrap()
    }

    #[tokio::test]
    async fn test_success_writes_delivery_log() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let id = enqueue(&store, &clock, "a@example.com", 0).await;

        let report = worker(&store, &clock, Arc::new(ScriptedProvider::default()))
            .process_queue(50)
            .await
            .unwrap();
        assert_eq!(
            report,
            ProcessReport {
                processed: 1,
                sent: 1,
                failed: 0,
                retried: 0
            }
        );

        let message = stored(&store, id);
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.attempts, 1);
        assert_eq!(message.sent_at, Some(clock.now()));
        assert_eq!(message.provider_message_id, Some(format!("prov-{}", id)));

        let logs = store.delivery_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].tracking_id, "trk-a@example.com");
    }

    #[tokio::test]
    async fn test_fail_fail_succeed_ends_sent_with_three_attempts() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let id = enqueue(&store, &clock, "a@example.com", 0).await;
        let provider = Arc::new(ScriptedProvider::with(vec![
            Err(ProviderError::Transient("421 busy".into())),
            Err(ProviderError::Transient("421 busy".into())),
        ]));
        let worker = worker(&store, &clock, provider);

        assert_eq!(worker.process_queue(50).await.unwrap().retried, 1);
        let message = stored(&store, id);
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.attempts, 1);
        assert_eq!(
            message.next_retry_at,
            Some(clock.now() + ChronoDuration::minutes(2))
        );

        // Not due yet
        assert_eq!(worker.process_queue(50).await.unwrap().processed, 0);

        clock.advance(ChronoDuration::minutes(2));
        assert_eq!(worker.process_queue(50).await.unwrap().retried, 1);
        assert_eq!(stored(&store, id).attempts, 2);

        clock.advance(ChronoDuration::minutes(4));
        assert_eq!(worker.process_queue(50).await.unwrap().sent, 1);

        let message = stored(&store, id);
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.attempts, 3);
        assert!(message.attempts <= message.max_attempts);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_attempts() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let id = enqueue(&store, &clock, "a@example.com", 0).await;
        let provider = Arc::new(ScriptedProvider::with(vec![
            Err(ProviderError::Transient("timeout".into()));
            3
        ]));
        let worker = worker(&store, &clock, provider);

        for _ in 0..3 {
            worker.process_queue(50).await.unwrap();
            clock.advance(ChronoDuration::hours(1));
        }

        let message = stored(&store, id);
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.attempts, 3);
        assert_eq!(message.max_attempts, 3);
        assert_eq!(message.error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let id = enqueue(&store, &clock, "a@example.com", 0).await;
        let provider = Arc::new(ScriptedProvider::with(vec![Err(ProviderError::Permanent(
            "550 user unknown".into(),
        ))]));

        let report = worker(&store, &clock, provider).process_queue(50).await.unwrap();
        assert_eq!(report.failed, 1);

        let message = stored(&store, id);
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.attempts, 1);
        assert_eq!(message.next_retry_at, None);
        assert_eq!(message.error_message.as_deref(), Some("550 user unknown"));
    }

    #[tokio::test]
    async fn test_configuration_failure_keeps_attempts() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let id = enqueue(&store, &clock, "a@example.com", 0).await;
        let provider = Arc::new(ScriptedProvider::with(vec![Err(
            ProviderError::Configuration("bad api key".into()),
        )]));

        worker(&store, &clock, provider).process_queue(50).await.unwrap();

        let message = stored(&store, id);
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.attempts, 0);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        enqueue(&store, &clock, "low@example.com", 0).await;
        enqueue(&store, &clock, "high@example.com", 10).await;
        let provider = Arc::new(ScriptedProvider::default());

        worker(&store, &clock, provider.clone()).process_queue(1).await.unwrap();

        let sent = provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "high@example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let id = enqueue(&store, &clock, "a@example.com", 0).await;
        let provider = Arc::new(ScriptedProvider {
            delay: Some(Duration::from_secs(120)),
            ..Default::default()
        });

        let report = worker(&store, &clock, provider).process_queue(50).await.unwrap();
        assert_eq!(report.retried, 1);
        assert!(stored(&store, id)
            .error_message
            .unwrap_or_default()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_list_unsubscribe_from_metadata() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let mut metadata = MessageMetadata::default();
        metadata.extra.insert(
            LIST_UNSUBSCRIBE_KEY.into(),
            serde_json::json!("<https://t.example.com/unsubscribe?t=x>"),
        );
        store
            .insert(
                NewMessage {
                    to_address: "a@example.com".into(),
                    subject: "Hi".into(),
                    text_body: Some("Hi".into()),
                    metadata,
                    ..Default::default()
                },
                clock.now(),
            )
            .await
            .unwrap();
        let provider = Arc::new(ScriptedProvider::default());

        worker(&store, &clock, provider.clone()).process_queue(50).await.unwrap();

        let sent = provider.sent.lock().unwrap();
        assert_eq!(
            sent[0].list_unsubscribe.as_deref(),
            Some("<https://t.example.com/unsubscribe?t=x>")
        );
        assert_eq!(sent[0].from_address, "noreply@localhost.localdomain");
    }
}
