//! Campaign fan-out, pause/resume and A/B tests

mod fanout;

pub use ab_test::{assign_variant, pick_winner, variant_score, AbTestResult};

use crate::queue::MessageQueue;
use crate::tracking::{TrackingInjector, TrackingOptions};
use fanout::{resolve_recipients, MessageBuilder, VariantPlan};
use mailpipe_common::types::{AbTestId, CampaignId};
use mailpipe_common::{Clock, Error};
use mailpipe_storage::models::{
    AbTest, AbTestStatus, Campaign, CampaignSendSummary, CampaignStatus, NewMessage, Variant,
};
use mailpipe_storage::{CampaignRepository, SubscriberRepository};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{info, warn};

/// Campaign operation errors
#[derive(ThisError, Debug)]
pub enum CampaignError {
    #[error("Campaign not found: {0}")]
    NotFound(CampaignId),

    #[error("Campaign {0} was already sent")]
    AlreadySent(CampaignId),

    #[error("Campaign {id} is {status}")]
    InvalidStatus { id: CampaignId, status: CampaignStatus },

    #[error("Campaign {0} has no eligible recipients")]
    NoRecipients(CampaignId),

    #[error("A/B test not found: {0}")]
    AbTestNotFound(AbTestId),

    #[error(transparent)]
    Store(#[from] Error),
}

impl From<CampaignError> for Error {
    fn from(err: CampaignError) -> Self {
        match err {
            CampaignError::NotFound(_) | CampaignError::AbTestNotFound(_) => {
                Error::NotFound(err.to_string())
            }
            CampaignError::AlreadySent(_) | CampaignError::InvalidStatus { .. } => {
                Error::InvalidTransition(err.to_string())
            }
            CampaignError::NoRecipients(_) => Error::Validation(err.to_string()),
            CampaignError::Store(e) => e,
        }
    }
}

/// Result of one campaign send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReport {
    pub campaign_id: CampaignId,
    pub status: CampaignStatus,
    pub total_recipients: usize,
    pub queued: u64,
    pub suppressed: usize,
    pub invalid: usize,
    pub failed_batches: usize,
    pub failed_recipients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_test_id: Option<AbTestId>,
    pub variant_a: u64,
    pub variant_b: u64,
}

/// Result of a pause or resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseReport {
    pub campaign_id: CampaignId,
    pub status: CampaignStatus,
    pub messages: u64,
}

/// Everything resolved before the first batch is queued
struct PreparedSend {
    campaign: Campaign,
    ab_test: Option<AbTest>,
    messages: Vec<NewMessage>,
    suppressed: usize,
    invalid: usize,
}

/// Campaign service
#[derive(Clone)]
pub struct CampaignService {
    campaigns: Arc<dyn CampaignRepository>,
    subscribers: Arc<dyn SubscriberRepository>,
    queue: MessageQueue,
    injector: TrackingInjector,
    tracking_options: TrackingOptions,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    priority: i32,
}

impl CampaignService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        subscribers: Arc<dyn SubscriberRepository>,
        queue: MessageQueue,
        injector: TrackingInjector,
        tracking_options: TrackingOptions,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        priority: i32,
    ) -> Self {
        Self {
            campaigns,
            subscribers,
            queue,
            injector,
            tracking_options,
            clock,
            batch_size: batch_size.max(1),
            priority,
        }
    }

    async fn load(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        self.campaigns
            .get(id)
            .await?
            .ok_or(CampaignError::NotFound(id))
    }

    /// Fan a campaign out to its audience.
    ///
    /// Recipients are queued in batches; a failed batch is logged and
    /// skipped. The campaign ends `sent` when anything was queued and
    /// `failed` otherwise. Errors before the first batch put it back to
    /// `draft`.
    pub async fn send_campaign(&self, id: CampaignId) -> Result<SendReport, CampaignError> {
        let campaign = self.load(id).await?;
        match campaign.status {
            CampaignStatus::Sent | CampaignStatus::Sending => {
                return Err(CampaignError::AlreadySent(id))
            }
            CampaignStatus::Paused => {
                return Err(CampaignError::InvalidStatus {
                    id,
                    status: campaign.status,
                })
            }
            CampaignStatus::Draft | CampaignStatus::Failed => {}
        }

        if !self.campaigns.begin_sending(id, self.clock.now()).await? {
            return Err(CampaignError::AlreadySent(id));
        }
        info!(campaign_id = %id, name = %campaign.name, "Campaign send started");

        let prepared = match self.prepare(campaign).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.revert_to_draft(id).await;
                return Err(e);
            }
        };

        self.deliver(prepared).await
    }

    async fn revert_to_draft(&self, id: CampaignId) {
        let reverted = self
            .campaigns
            .compare_and_set_status(id, CampaignStatus::Sending, CampaignStatus::Draft, self.clock.now())
            .await;
        if let Err(e) = reverted {
            warn!(campaign_id = %id, error = %e, "Failed to revert campaign to draft");
        }
    }

    async fn prepare(&self, campaign: Campaign) -> Result<PreparedSend, CampaignError> {
        let audience = resolve_recipients(self.subscribers.as_ref(), &campaign.target_audience).await?;
        if audience.recipients.is_empty() {
            return Err(CampaignError::NoRecipients(campaign.id));
        }

        let now = self.clock.now();
        let ab_test = match campaign.ab_test_id {
            Some(test_id) => Some(
                self.campaigns
                    .get_ab_test(test_id)
                    .await?
                    .ok_or(CampaignError::AbTestNotFound(test_id))?,
            ),
            None => None,
        };

        let options = TrackingOptions {
            track_opens: self.tracking_options.track_opens && campaign.track_opens,
            track_clicks: self.tracking_options.track_clicks && campaign.track_clicks,
            include_unsubscribe: self.tracking_options.include_unsubscribe,
        };
        let builder = MessageBuilder {
            campaign: &campaign,
            plan: VariantPlan::for_test(ab_test.as_ref()),
            injector: &self.injector,
            options,
            priority: self.priority,
            now,
        };
        let messages = audience
            .recipients
            .iter()
            .enumerate()
            .map(|(i, r)| builder.build(i, r))
            .collect::<mailpipe_common::Result<Vec<_>>>()?;

        if let Some(test) = ab_test.as_ref().filter(|t| t.status == AbTestStatus::Draft) {
            self.campaigns.start_ab_test(test.id, now).await?;
        }

        Ok(PreparedSend {
            campaign,
            ab_test,
            messages,
            suppressed: audience.suppressed,
            invalid: audience.invalid,
        })
    }

    async fn deliver(&self, prepared: PreparedSend) -> Result<SendReport, CampaignError> {
        let PreparedSend {
            campaign,
            ab_test,
            messages,
            suppressed,
            invalid,
        } = prepared;
        let total = messages.len();

        let mut queued = 0u64;
        let mut failed_batches = 0usize;
        let mut failed_recipients = 0usize;
        let (mut variant_a, mut variant_b) = (0u64, 0u64);

        for chunk in messages.chunks(self.batch_size) {
            match self.queue.enqueue_batch(chunk.to_vec()).await {
                Ok(inserted) => {
                    queued += inserted;
                    for message in chunk {
                        match message.metadata.ab_variant {
                            Some(Variant::A) => variant_a += 1,
                            Some(Variant::B) => variant_b += 1,
                            None => {}
                        }
                    }
                }
                Err(e) => {
                    failed_batches += 1;
                    failed_recipients += chunk.len();
                    warn!(
                        campaign_id = %campaign.id,
                        batch_size = chunk.len(),
                        error = %e,
                        "Campaign batch failed"
                    );
                }
            }
        }

        let status = if queued > 0 {
            CampaignStatus::Sent
        } else {
            CampaignStatus::Failed
        };
        let summary = CampaignSendSummary {
            status,
            total_recipients: total as i32,
            sent_count: queued as i32,
            sent_at: self.clock.now(),
        };
        self.campaigns.record_send(campaign.id, &summary).await?;

        let ab_test_id = ab_test
            .as_ref()
            .filter(|t| t.status != AbTestStatus::Completed)
            .map(|t| t.id);
        if let Some(test_id) = ab_test_id {
            for (variant, count) in [(Variant::A, variant_a), (Variant::B, variant_b)] {
                if count > 0 {
                    self.campaigns
                        .add_variant_sent(test_id, variant, count as i32)
                        .await?;
                }
            }
        }

        info!(
            campaign_id = %campaign.id,
            status = %status,
            total,
            queued,
            suppressed,
            invalid,
            failed_batches,
            "Campaign send finished"
        );

        Ok(SendReport {
            campaign_id: campaign.id,
            status,
            total_recipients: total,
            queued,
            suppressed,
            invalid,
            failed_batches,
            failed_recipients,
            ab_test_id,
            variant_a,
            variant_b,
        })
    }

    /// Hold back every pending message of a sending or sent campaign
    pub async fn pause_campaign(&self, id: CampaignId) -> Result<PauseReport, CampaignError> {
        let campaign = self.load(id).await?;
        let now = self.clock.now();

        let paused = match campaign.status {
            CampaignStatus::Sending | CampaignStatus::Sent => {
                self.campaigns
                    .compare_and_set_status(id, campaign.status, CampaignStatus::Paused, now)
                    .await?
            }
            _ => false,
        };
        if !paused {
            return Err(CampaignError::InvalidStatus {
                id,
                status: campaign.status,
            });
        }

        let messages = self.queue.cancel_for_campaign(id).await?;
        info!(campaign_id = %id, messages, "Campaign paused");
        Ok(PauseReport {
            campaign_id: id,
            status: CampaignStatus::Paused,
            messages,
        })
    }

    /// Release a paused campaign's held messages
    pub async fn resume_campaign(&self, id: CampaignId) -> Result<PauseReport, CampaignError> {
        let campaign = self.load(id).await?;
        let resumed = self
            .campaigns
            .compare_and_set_status(id, CampaignStatus::Paused, CampaignStatus::Sent, self.clock.now())
            .await?;
        if !resumed {
            return Err(CampaignError::InvalidStatus {
                id,
                status: campaign.status,
            });
        }

        let messages = self.queue.resume_for_campaign(id).await?;
        info!(campaign_id = %id, messages, "Campaign resumed");
        Ok(PauseReport {
            campaign_id: id,
            status: CampaignStatus::Sent,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::EligibilityGate;
    use crate::metrics::Metrics;
    use chrono::Utc;
    use mailpipe_common::config::QueueConfig;
    use mailpipe_common::ManualClock;
    use mailpipe_storage::models::{
        AbTestType, MessageStatus, NewAbTest, NewCampaign, NewSubscriber, TargetAudience,
        VariantContent, WinnerCriteria,
    };
    use mailpipe_storage::{MemoryStore, Repositories};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: MemoryStore,
        repos: Repositories,
        service: CampaignService,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let store = MemoryStore::new();
        let repos = Repositories::memory(store.clone());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let gate = EligibilityGate::new(
            repos.subscribers.clone(),
            repos.automations.clone(),
            clock.clone(),
        );
        let queue = MessageQueue::new(
            repos.messages.clone(),
            gate,
            clock.clone(),
            Metrics::new().unwrap(),
            QueueConfig::default(),
        );
        let service = CampaignService::new(
            repos.campaigns.clone(),
            repos.subscribers.clone(),
            queue,
            TrackingInjector::new("https://t.example.com", None),
            TrackingOptions::default(),
            clock,
            batch_size,
            1,
        );
        Fixture {
            store,
            repos,
            service,
        }
    }

    fn list(n: usize) -> TargetAudience {
        TargetAudience::List {
            emails: (0..n).map(|i| format!("user{}@example.com", i)).collect(),
        }
    }

    async fn campaign(fx: &Fixture, audience: TargetAudience) -> Campaign {
        fx.repos
            .campaigns
            .create(NewCampaign {
                name: "Spring sale".into(),
                subject: "Hi {{first_name}}".into(),
                html_body: Some(r#"<p>Sale <a href="https://shop.example.com">shop</a></p>"#.into()),
                text_body: Some("Sale for {{email}}".into()),
                target_audience: audience,
                track_opens: true,
                track_clicks: true,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn status(fx: &Fixture, id: CampaignId) -> CampaignStatus {
        fx.repos.campaigns.get(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_segment_send_queues_personalised_messages() {
        let fx = fixture(100);
        for (email, name) in [("ann@example.com", "Ann Lee"), ("bob@example.com", "Bob Ray")] {
            fx.repos
                .subscribers
                .upsert(
                    NewSubscriber {
                        email: email.into(),
                        name: Some(name.into()),
                        tags: vec!["vip".into()],
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        let c = campaign(&fx, TargetAudience::Segment { tag: "vip".into() }).await;

        let report = fx.service.send_campaign(c.id).await.unwrap();
        assert_eq!(report.status, CampaignStatus::Sent);
        assert_eq!((report.total_recipients, report.queued), (2, 2));

        let messages = fx.store.messages();
        let ann = messages.iter().find(|m| m.to_address == "ann@example.com").unwrap();
        assert_eq!(ann.subject, "Hi Ann");
        assert_eq!(ann.priority, 1);
        assert_eq!(ann.campaign_id, Some(c.id));
        assert!(ann.subscriber_id.is_some());
        let tid = ann.tracking_id().unwrap();
        let html = ann.html_body.as_deref().unwrap();
        assert!(html.contains(&format!("/track/open/{}", tid)));
        assert!(html.contains(&format!("/track/click/{}", tid)));

        let stored = fx.repos.campaigns.get(c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Sent);
        assert_eq!((stored.total_recipients, stored.sent_count), (2, 2));
        assert!(stored.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_resend_is_rejected() {
        let fx = fixture(100);
        let c = campaign(&fx, list(3)).await;
        fx.service.send_campaign(c.id).await.unwrap();

        let err = fx.service.send_campaign(c.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::AlreadySent(id) if id == c.id));
        assert_eq!(fx.store.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_no_recipients_reverts_to_draft() {
        let fx = fixture(100);
        fx.repos
            .subscribers
            .add_suppression("only@example.com", "bounce", Utc::now())
            .await
            .unwrap();
        let c = campaign(
            &fx,
            TargetAudience::List {
                emails: vec!["only@example.com".into()],
            },
        )
        .await;

        let err = fx.service.send_campaign(c.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::NoRecipients(_)));
        assert_eq!(status(&fx, c.id).await, CampaignStatus::Draft);
        assert!(matches!(Error::from(err), Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_send() {
        let fx = fixture(2);
        fx.store.fail_batches_containing("user2@example.com");
        let c = campaign(&fx, list(5)).await;

        let report = fx.service.send_campaign(c.id).await.unwrap();
        assert_eq!(report.queued, 3);
        assert_eq!((report.failed_batches, report.failed_recipients), (1, 2));
        assert_eq!(report.status, CampaignStatus::Sent);

        let stored = fx.repos.campaigns.get(c.id).await.unwrap().unwrap();
        assert_eq!((stored.total_recipients, stored.sent_count), (5, 3));
    }

    #[tokio::test]
    async fn test_malformed_subscriber_does_not_sink_its_batch() {
        let fx = fixture(100);
        for email in [
            "ann@example.com",
            "bob@example.com",
            "carol@localhost",
            "dan@example.com",
            "eve@example.com",
        ] {
            fx.repos
                .subscribers
                .upsert(
                    NewSubscriber {
                        email: email.into(),
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        let c = campaign(&fx, TargetAudience::All).await;

        let report = fx.service.send_campaign(c.id).await.unwrap();
        assert_eq!(report.status, CampaignStatus::Sent);
        assert_eq!((report.total_recipients, report.queued), (4, 4));
        assert_eq!(report.invalid, 1);
        assert_eq!((report.failed_batches, report.failed_recipients), (0, 0));
        assert!(fx
            .store
            .messages()
            .iter()
            .all(|m| m.to_address != "carol@localhost"));
    }

    #[tokio::test]
    async fn test_every_batch_failing_marks_campaign_failed() {
        let fx = fixture(10);
        fx.store.fail_batches_containing("user0@example.com");
        let c = campaign(&fx, list(4)).await;

        let report = fx.service.send_campaign(c.id).await.unwrap();
        assert_eq!(report.queued, 0);
        assert_eq!(status(&fx, c.id).await, CampaignStatus::Failed);

        // failed campaigns can be sent again
        let retry = fx.service.send_campaign(c.id).await.unwrap();
        assert_eq!(retry.queued, 0);
    }

    async fn ab_campaign(fx: &Fixture, n: usize, split: i32) -> (Campaign, AbTestId) {
        let c = campaign(fx, list(n)).await;
        let test = fx
            .repos
            .campaigns
            .create_ab_test(NewAbTest {
                campaign_id: c.id,
                test_type: AbTestType::Subject,
                variant_a: VariantContent {
                    subject: Some("Subject A".into()),
                    ..Default::default()
                },
                variant_b: VariantContent {
                    subject: Some("Subject B".into()),
                    ..Default::default()
                },
                split_percentage: split,
                winner_criteria: WinnerCriteria::OpenRate,
                test_duration_hours: 24,
            })
            .await
            .unwrap();
        fx.repos.campaigns.link_ab_test(c.id, test.id).await.unwrap();
        (c, test.id)
    }

    #[tokio::test]
    async fn test_ab_split_is_deterministic() {
        let fx = fixture(50);
        let (c, test_id) = ab_campaign(&fx, 200, 30).await;

        let report = fx.service.send_campaign(c.id).await.unwrap();
        assert_eq!((report.variant_a, report.variant_b), (60, 140));
        assert_eq!(report.ab_test_id, Some(test_id));

        let messages = fx.store.messages();
        let subject_a = messages.iter().filter(|m| m.subject == "Subject A").count();
        assert_eq!(subject_a, 60);
        assert!(messages
            .iter()
            .all(|m| m.metadata.ab_test_id == Some(test_id) && m.metadata.ab_variant.is_some()));

        let test = fx.repos.campaigns.get_ab_test(test_id).await.unwrap().unwrap();
        assert_eq!(test.status, AbTestStatus::Running);
        assert_eq!((test.variant_a_sent, test.variant_b_sent), (60, 140));
    }

    #[tokio::test]
    async fn test_completed_test_sends_winner_to_everyone() {
        let fx = fixture(50);
        let (c, test_id) = ab_campaign(&fx, 10, 50).await;
        fx.repos
            .campaigns
            .complete_ab_test(test_id, Variant::B, Utc::now())
            .await
            .unwrap();

        let report = fx.service.send_campaign(c.id).await.unwrap();
        assert_eq!(report.queued, 10);
        assert_eq!(report.ab_test_id, None);
        assert!(fx.store.messages().iter().all(|m| m.subject == "Subject B"));
    }

    #[tokio::test]
    async fn test_out_of_range_send_delay_reverts_to_draft() {
        let fx = fixture(50);
        let c = campaign(&fx, list(4)).await;
        let test = fx
            .repos
            .campaigns
            .create_ab_test(NewAbTest {
                campaign_id: c.id,
                test_type: AbTestType::SendTime,
                variant_a: VariantContent::default(),
                variant_b: VariantContent {
                    send_delay_hours: Some(i64::MAX),
                    ..Default::default()
                },
                split_percentage: 50,
                winner_criteria: WinnerCriteria::OpenRate,
                test_duration_hours: 24,
            })
            .await
            .unwrap();
        fx.repos.campaigns.link_ab_test(c.id, test.id).await.unwrap();

        let err = fx.service.send_campaign(c.id).await.unwrap_err();
        assert!(matches!(Error::from(err), Error::Validation(_)));
        assert_eq!(status(&fx, c.id).await, CampaignStatus::Draft);
        assert!(fx.store.messages().is_empty());
        let test = fx.repos.campaigns.get_ab_test(test.id).await.unwrap().unwrap();
        assert_eq!(test.status, AbTestStatus::Draft);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let fx = fixture(100);
        let c = campaign(&fx, list(3)).await;

        let err = fx.service.pause_campaign(c.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::InvalidStatus { status: CampaignStatus::Draft, .. }));

        fx.service.send_campaign(c.id).await.unwrap();
        let paused = fx.service.pause_campaign(c.id).await.unwrap();
        assert_eq!(paused.messages, 3);
        assert_eq!(status(&fx, c.id).await, CampaignStatus::Paused);
        assert!(fx
            .store
            .messages()
            .iter()
            .all(|m| m.status == MessageStatus::Cancelled));

        assert!(matches!(
            fx.service.send_campaign(c.id).await,
            Err(CampaignError::InvalidStatus { .. })
        ));

        let resumed = fx.service.resume_campaign(c.id).await.unwrap();
        assert_eq!(resumed.messages, 3);
        assert_eq!(status(&fx, c.id).await, CampaignStatus::Sent);
        assert!(fx
            .store
            .messages()
            .iter()
            .all(|m| m.status == MessageStatus::Pending));

        assert!(fx.service.resume_campaign(c.id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_campaign() {
        let fx = fixture(100);
        let err = fx.service.send_campaign(uuid::Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(Error::from(err), Error::NotFound(_)));
    }
}
