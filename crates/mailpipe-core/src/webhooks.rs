//! Provider delivery notifications (bounces and complaints)

use mailpipe_common::types::{CampaignId, EmailAddress};
use mailpipe_common::{Clock, Error, Result};
use mailpipe_storage::models::{CampaignCounter, SubscriberStatus, WebhookEventType};
use mailpipe_storage::{
    CampaignRepository, SubscriberRepository, TrackingRepository, WebhookRepository,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Notification body posted by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderWebhook {
    #[serde(rename = "type", alias = "event")]
    pub event_type: WebhookEventType,
    pub email: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// What processing a notification did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookOutcome {
    pub id: Uuid,
    pub event_type: WebhookEventType,
    pub suppressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
}

/// Stores provider notifications and applies them to subscribers
#[derive(Clone)]
pub struct WebhookProcessor {
    webhooks: Arc<dyn WebhookRepository>,
    subscribers: Arc<dyn SubscriberRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    tracking: Arc<dyn TrackingRepository>,
    clock: Arc<dyn Clock>,
}

impl WebhookProcessor {
    pub fn new(
        webhooks: Arc<dyn WebhookRepository>,
        subscribers: Arc<dyn SubscriberRepository>,
        campaigns: Arc<dyn CampaignRepository>,
        tracking: Arc<dyn TrackingRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            webhooks,
            subscribers,
            campaigns,
            tracking,
            clock,
        }
    }

    pub async fn process(&self, webhook: ProviderWebhook) -> Result<WebhookOutcome> {
        let email = webhook.email.trim();
        if EmailAddress::parse(email).is_none() {
            return Err(Error::Validation(format!("Invalid address: {}", webhook.email)));
        }

        let now = self.clock.now();
        let event = self
            .webhooks
            .insert(
                webhook.event_type,
                email,
                webhook.message_id.as_deref(),
                webhook.payload,
                now,
            )
            .await?;

        let (status, reason) = match webhook.event_type {
            WebhookEventType::Delivered => (None, None),
            WebhookEventType::Bounced => (Some(SubscriberStatus::Bounced), Some("bounce")),
            WebhookEventType::Complained => (Some(SubscriberStatus::Complained), Some("complaint")),
        };

        if let Some(status) = status {
            self.subscribers.set_status(email, status, now).await?;
        }
        if let Some(reason) = reason {
            self.subscribers.add_suppression(email, reason, now).await?;
            info!(email = %email, reason, "Address suppressed by provider notification");
        }

        let mut campaign_id = None;
        if webhook.event_type == WebhookEventType::Bounced {
            if let Some(provider_id) = webhook.message_id.as_deref() {
                let delivery = self.tracking.find_delivery_by_provider_id(provider_id).await?;
                campaign_id = delivery.and_then(|d| d.campaign_id);
                if let Some(id) = campaign_id {
                    self.campaigns
                        .increment_counter(id, CampaignCounter::Bounce)
                        .await?;
                }
            }
        }

        self.webhooks.mark_processed(event.id, now).await?;
        debug!(id = %event.id, event_type = %event.event_type, "Processed provider webhook");

        Ok(WebhookOutcome {
            id: event.id,
            event_type: event.event_type,
            suppressed: reason.is_some(),
            campaign_id,
        })
    }
}
