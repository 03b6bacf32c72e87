//! Cron Orchestrator - one bounded maintenance run per invocation

use crate::automation::AutomationEngine;
use crate::campaign::CampaignService;
use crate::metrics::Metrics;
use crate::queue::{MessageQueue, QueueWorker};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use mailpipe_common::config::{CronConfig, RetentionConfig};
use mailpipe_common::types::checked_sub_days;
use mailpipe_common::{Clock, Result};
use mailpipe_storage::Repositories;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Overall pipeline health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// Classify from last-hour counts and this run's job failures
    pub fn evaluate(
        failed_last_hour: u64,
        errors_last_hour: u64,
        failed_jobs: usize,
        total_jobs: usize,
        thresholds: &CronConfig,
    ) -> Self {
        if failed_last_hour >= thresholds.critical_failed_threshold
            || (total_jobs > 0 && failed_jobs * 2 > total_jobs)
        {
            HealthStatus::Critical
        } else if failed_last_hour >= thresholds.degraded_failed_threshold
            || errors_last_hour >= thresholds.error_threshold
            || failed_jobs > 0
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub failed_last_hour: u64,
    pub errors_last_hour: u64,
    pub failed_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job: String,
    pub success: bool,
    pub details: Value,
    pub duration_ms: u64,
}

/// Outcome of one orchestrator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobResult>,
    pub health: HealthReport,
}

impl CronReport {
    pub fn is_critical(&self) -> bool {
        self.health.status == HealthStatus::Critical
    }
}

/// Runs queue delivery, retries, delayed automations, A/B evaluation
/// and retention cleanup, in that order
#[derive(Clone)]
pub struct Orchestrator {
    worker: QueueWorker,
    queue: MessageQueue,
    automations: AutomationEngine,
    campaigns: CampaignService,
    repos: Repositories,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    cron: CronConfig,
    retention: RetentionConfig,
    queue_batch_size: i64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker: QueueWorker,
        queue: MessageQueue,
        automations: AutomationEngine,
        campaigns: CampaignService,
        repos: Repositories,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        cron: CronConfig,
        retention: RetentionConfig,
        queue_batch_size: i64,
    ) -> Self {
        Self {
            worker,
            queue,
            automations,
            campaigns,
            repos,
            clock,
            metrics,
            cron,
            retention,
            queue_batch_size,
        }
    }

    pub async fn run(&self) -> CronReport {
        let started_at = self.clock.now();
        info!("Cron run started");

        let jobs = vec![
            self.run_job("process_queue", self.process_queue()).await,
            self.run_job("retry_failed_emails", self.retry_failed_emails()).await,
            self.run_job(
                "process_scheduled_automations",
                self.process_scheduled_automations(),
            )
            .await,
            self.run_job("evaluate_ab_tests", self.evaluate_ab_tests()).await,
            self.run_job("cleanup_old_data", self.cleanup_old_data()).await,
        ];

        let failed_jobs = jobs.iter().filter(|j| !j.success).count();
        let health = match self.assess(failed_jobs, jobs.len()).await {
            Ok(health) => health,
            Err(e) => {
                error!(error = %e, "Health check failed");
                HealthReport {
                    status: HealthStatus::Critical,
                    failed_last_hour: 0,
                    errors_last_hour: 0,
                    failed_jobs,
                    error: Some(e.to_string()),
                }
            }
        };

        let finished_at = self.clock.now();
        info!(
            failed_jobs,
            status = ?health.status,
            "Cron run finished"
        );
        CronReport {
            started_at,
            finished_at,
            jobs,
            health,
        }
    }

    /// Health from the last hour of queue activity alone
    pub async fn health(&self) -> Result<HealthReport> {
        self.assess(0, 0).await
    }

    async fn assess(&self, failed_jobs: usize, total_jobs: usize) -> Result<HealthReport> {
        let since = self.clock.now() - Duration::hours(1);
        let failed = self.repos.messages.count_failed_since(since).await?.max(0) as u64;
        let errors = self.repos.messages.count_errors_since(since).await?.max(0) as u64;
        Ok(HealthReport {
            status: HealthStatus::evaluate(failed, errors, failed_jobs, total_jobs, &self.cron),
            failed_last_hour: failed,
            errors_last_hour: errors,
            failed_jobs,
            error: None,
        })
    }

    async fn run_job<F>(&self, name: &str, job: F) -> JobResult
    where
        F: Future<Output = anyhow::Result<Value>>,
    {
        let start = Instant::now();
        let outcome = job.await;
        let elapsed = start.elapsed();
        self.metrics
            .cron_job_duration
            .with_label_values(&[name])
            .observe(elapsed.as_secs_f64());

        let (success, details) = match outcome {
            Ok(details) => (true, details),
            Err(e) => {
                self.metrics.cron_job_failures.with_label_values(&[name]).inc();
                warn!(job = name, error = %format!("{:#}", e), "Cron job failed");
                (false, json!({ "error": format!("{:#}", e) }))
            }
        };

        JobResult {
            job: name.to_string(),
            success,
            details,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    async fn process_queue(&self) -> anyhow::Result<Value> {
        let report = self
            .worker
            .process_queue(self.queue_batch_size)
            .await
            .context("processing queue")?;
        Ok(serde_json::to_value(report)?)
    }

    async fn retry_failed_emails(&self) -> anyhow::Result<Value> {
        let requeued = self
            .queue
            .retry_failed_emails()
            .await
            .context("requeueing failed messages")?;
        Ok(json!({ "requeued": requeued }))
    }

    async fn process_scheduled_automations(&self) -> anyhow::Result<Value> {
        let report = self
            .automations
            .process_scheduled_automations(self.cron.automation_batch_size)
            .await
            .context("processing delayed automations")?;
        Ok(serde_json::to_value(report)?)
    }

    async fn evaluate_ab_tests(&self) -> anyhow::Result<Value> {
        if !self.cron.evaluate_ab_tests {
            return Ok(json!({ "skipped": true }));
        }
        let results = self
            .campaigns
            .evaluate_due_ab_tests()
            .await
            .context("evaluating A/B tests")?;
        Ok(json!({ "completed": results }))
    }

    async fn cleanup_old_data(&self) -> anyhow::Result<Value> {
        let now = self.clock.now();
        // Windows reaching past the earliest representable time keep everything
        let cutoff = |days: i64| checked_sub_days(now, days).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let queue_cutoff = cutoff(self.retention.queue_days);
        let tracking_cutoff = cutoff(self.retention.tracking_days);
        let webhook_cutoff = cutoff(self.retention.webhook_days);

        let messages = self
            .repos
            .messages
            .delete_terminal_before(queue_cutoff)
            .await
            .context("deleting old queue rows")?;
        let events = self
            .repos
            .tracking
            .delete_events_before(tracking_cutoff)
            .await
            .context("deleting old tracking events")?;
        let delivery_logs = self
            .repos
            .tracking
            .delete_delivery_logs_before(tracking_cutoff)
            .await
            .context("deleting old delivery logs")?;
        let webhooks = self
            .repos
            .webhooks
            .delete_processed_before(webhook_cutoff)
            .await
            .context("deleting old webhook events")?;

        Ok(json!({
            "messages": messages,
            "tracking_events": events,
            "delivery_logs": delivery_logs,
            "webhook_events": webhooks,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{EmailProvider, OutboundEmail, ProviderError, SentEmail};
    use crate::services::Pipeline;
    use async_trait::async_trait;
    use mailpipe_common::types::{CampaignId, MessageId};
    use mailpipe_common::{Config, Error, ManualClock};
    use mailpipe_storage::models::{MessageStatus, NewMessage, QueueStats, QueuedMessage};
    use mailpipe_storage::{MemoryStore, MessageRepository};
    use pretty_assertions::assert_eq;

    struct AcceptAll;

    #[async_trait]
    impl EmailProvider for AcceptAll {
        async fn send(&self, _email: &OutboundEmail) -> std::result::Result<SentEmail, ProviderError> {
            Ok(SentEmail {
                provider_message_id: Some("accepted".into()),
            })
        }

        fn name(&self) -> &'static str {
            "accept-all"
        }
    }

    fn pipeline(store: &MemoryStore, clock: &ManualClock) -> Pipeline {
        Pipeline::new(
            Config::default(),
            Repositories::memory(store.clone()),
            Arc::new(AcceptAll),
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    /// Message store whose retry requeue is down
    struct RequeueUnavailable(MemoryStore);

    #[async_trait]
    impl MessageRepository for RequeueUnavailable {
        async fn insert(&self, input: NewMessage, now: DateTime<Utc>) -> Result<QueuedMessage> {
            self.0.insert(input, now).await
        }

        async fn insert_batch(&self, inputs: Vec<NewMessage>, now: DateTime<Utc>) -> Result<u64> {
            self.0.insert_batch(inputs, now).await
        }

        async fn get(&self, id: MessageId) -> Result<Option<QueuedMessage>> {
            MessageRepository::get(&self.0, id).await
        }

        async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>> {
            self.0.claim_due(limit, now).await
        }

        async fn mark_sent(
            &self,
            id: MessageId,
            provider_message_id: Option<&str>,
            now: DateTime<Utc>,
        ) -> Result<()> {
            self.0.mark_sent(id, provider_message_id, now).await
        }

        async fn schedule_retry(
            &self,
            id: MessageId,
            error: &str,
            next_retry_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<()> {
            self.0.schedule_retry(id, error, next_retry_at, now).await
        }

        async fn mark_failed(
            &self,
            id: MessageId,
            error: &str,
            count_attempt: bool,
            next_retry_at: Option<DateTime<Utc>>,
            now: DateTime<Utc>,
        ) -> Result<()> {
            self.0
                .mark_failed(id, error, count_attempt, next_retry_at, now)
                .await
        }

        async fn requeue_failed(&self, _attempt_ceiling: i32, _now: DateTime<Utc>) -> Result<u64> {
            Err(Error::Database("connection reset".into()))
        }

        async fn cancel_for_campaign(
            &self,
            campaign_id: CampaignId,
            reason: &str,
            now: DateTime<Utc>,
        ) -> Result<u64> {
            self.0.cancel_for_campaign(campaign_id, reason, now).await
        }

        async fn resume_for_campaign(
            &self,
            campaign_id: CampaignId,
            reason: &str,
            now: DateTime<Utc>,
        ) -> Result<u64> {
            self.0.resume_for_campaign(campaign_id, reason, now).await
        }

        async fn stats(&self) -> Result<QueueStats> {
            self.0.stats().await
        }

        async fn count_failed_since(&self, since: DateTime<Utc>) -> Result<i64> {
            self.0.count_failed_since(since).await
        }

        async fn count_errors_since(&self, since: DateTime<Utc>) -> Result<i64> {
            self.0.count_errors_since(since).await
        }

        async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.0.delete_terminal_before(cutoff).await
        }
    }

    #[test]
    fn test_health_thresholds() {
        let t = CronConfig::default();
        assert_eq!(HealthStatus::evaluate(0, 0, 0, 5, &t), HealthStatus::Healthy);
        assert_eq!(HealthStatus::evaluate(10, 0, 0, 5, &t), HealthStatus::Degraded);
        assert_eq!(HealthStatus::evaluate(0, 25, 0, 5, &t), HealthStatus::Degraded);
        assert_eq!(HealthStatus::evaluate(0, 0, 1, 5, &t), HealthStatus::Degraded);
        assert_eq!(HealthStatus::evaluate(50, 0, 0, 5, &t), HealthStatus::Critical);
        assert_eq!(HealthStatus::evaluate(0, 0, 3, 5, &t), HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_run_executes_jobs_in_order() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let pipeline = pipeline(&store, &clock);
        pipeline
            .queue
            .enqueue(NewMessage {
                to_address: "ann@example.com".into(),
                subject: "Hi".into(),
                text_body: Some("Hello".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = pipeline.orchestrator().run().await;

        let names: Vec<_> = report.jobs.iter().map(|j| j.job.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "process_queue",
                "retry_failed_emails",
                "process_scheduled_automations",
                "evaluate_ab_tests",
                "cleanup_old_data",
            ]
        );
        assert!(report.jobs.iter().all(|j| j.success));
        assert_eq!(report.jobs[0].details["sent"], 1);
        assert_eq!(report.health.status, HealthStatus::Healthy);
        assert!(!report.is_critical());
        assert_eq!(store.messages()[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_stop_later_jobs() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let mut repos = Repositories::memory(store.clone());
        repos.messages = Arc::new(RequeueUnavailable(store.clone()));
        let pipeline = Pipeline::new(
            Config::default(),
            repos,
            Arc::new(AcceptAll),
            Arc::new(clock.clone()),
        )
        .unwrap();
        pipeline
            .queue
            .enqueue(NewMessage {
                to_address: "ann@example.com".into(),
                subject: "Hi".into(),
                text_body: Some("Hello".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = pipeline.orchestrator().run().await;

        assert_eq!(report.jobs.len(), 5);
        let retry = &report.jobs[1];
        assert_eq!(retry.job, "retry_failed_emails");
        assert!(!retry.success);
        let error = retry.details["error"].as_str().unwrap();
        assert!(error.contains("requeueing failed messages"));
        assert!(error.contains("connection reset"));

        assert!(report.jobs[0].success);
        assert!(report.jobs[2..].iter().all(|j| j.success));
        assert_eq!(report.jobs[4].job, "cleanup_old_data");

        assert_eq!(report.health.failed_jobs, 1);
        assert_eq!(report.health.status, HealthStatus::Degraded);
        assert_eq!(
            pipeline
                .metrics
                .cron_job_failures
                .with_label_values(&["retry_failed_emails"])
                .get(),
            1
        );
        assert_eq!(store.messages()[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let pipeline = pipeline(&store, &clock);
        pipeline
            .queue
            .enqueue(NewMessage {
                to_address: "ann@example.com".into(),
                subject: "Hi".into(),
                text_body: Some("Hello".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let orchestrator = pipeline.orchestrator();
        orchestrator.run().await;
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.delivery_logs().len(), 1);

        clock.advance(Duration::days(31));
        let report = orchestrator.run().await;
        let cleanup = &report.jobs[4].details;
        assert_eq!(cleanup["messages"], 1);
        assert_eq!(cleanup["delivery_logs"], 0);
        assert!(store.messages().is_empty());

        let again = orchestrator.run().await;
        assert_eq!(again.jobs[4].details["messages"], 0);

        clock.advance(Duration::days(60));
        let later = orchestrator.run().await;
        assert_eq!(later.jobs[4].details["delivery_logs"], 1);
        assert!(store.delivery_logs().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_retention_keeps_everything() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let mut config = Config::default();
        config.retention.queue_days = i64::MAX;
        let pipeline = Pipeline::new(
            config,
            Repositories::memory(store.clone()),
            Arc::new(AcceptAll),
            Arc::new(clock.clone()),
        )
        .unwrap();
        pipeline
            .queue
            .enqueue(NewMessage {
                to_address: "ann@example.com".into(),
                subject: "Hi".into(),
                text_body: Some("Hello".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        pipeline.orchestrator().run().await;
        clock.advance(Duration::days(400));
        let report = pipeline.orchestrator().run().await;
        assert!(report.jobs[4].success);
        assert_eq!(report.jobs[4].details["messages"], 0);
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_standalone_health_counts_recent_failures() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let pipeline = pipeline(&store, &clock);

        let health = pipeline.orchestrator().health().await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!((health.failed_last_hour, health.errors_last_hour), (0, 0));
    }
}
