//! Tracking event ingestion

use super::html::{click_payload, unsubscribe_payload};
use super::signing::verify_hex;
use super::user_agent;
use crate::metrics::Metrics;
use mailpipe_common::types::normalize_email;
use mailpipe_common::{Clock, Error, Result};
use mailpipe_storage::models::{
    AutomationCounter, CampaignCounter, DeliveryLog, SubscriberStatus, TrackingEvent,
    TrackingEventType, VariantCounter,
};
use mailpipe_storage::{
    AutomationRepository, CampaignRepository, SubscriberRepository, TrackingRepository,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Request details attached to an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDetails {
    pub link_url: Option<String>,
    pub link_id: Option<i32>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// What happened to an incoming event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Stored and counted
    Recorded,
    /// Stored; counters were already bumped for this tracking id
    Repeated,
    /// No delivery with that tracking id
    NotFound,
}

/// Tracking ingestion service
#[derive(Clone)]
pub struct TrackingService {
    tracking: Arc<dyn TrackingRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    automations: Arc<dyn AutomationRepository>,
    subscribers: Arc<dyn SubscriberRepository>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    secret: Option<String>,
}

impl TrackingService {
    pub fn new(
        tracking: Arc<dyn TrackingRepository>,
        campaigns: Arc<dyn CampaignRepository>,
        automations: Arc<dyn AutomationRepository>,
        subscribers: Arc<dyn SubscriberRepository>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        secret: Option<String>,
    ) -> Self {
        Self {
            tracking,
            campaigns,
            automations,
            subscribers,
            clock,
            metrics,
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Append a tracking event and bump the matching counters.
    ///
    /// Opens, unsubscribes and conversions count once per tracking id;
    /// every click counts.
    pub async fn record_event(
        &self,
        tracking_id: &str,
        event_type: TrackingEventType,
        details: EventDetails,
    ) -> Result<RecordOutcome> {
        let Some(delivery) = self.tracking.get_delivery_log(tracking_id).await? else {
            debug!(tracking_id = %tracking_id, event = %event_type, "Ignoring event for unknown tracking id");
            return Ok(RecordOutcome::NotFound);
        };

        let first = match event_type {
            TrackingEventType::Clicked => true,
            _ => !self.tracking.has_event(tracking_id, event_type).await?,
        };

        let (device_type, email_client) = user_agent::classify(details.user_agent.as_deref());
        let event = TrackingEvent {
            id: Uuid::now_v7(),
            tracking_id: tracking_id.to_string(),
            message_id: Some(delivery.message_id),
            campaign_id: delivery.campaign_id,
            automation_id: delivery.automation_id,
            event_type,
            link_url: details.link_url,
            link_id: details.link_id,
            device_type,
            email_client,
            user_agent: details.user_agent,
            ip_address: details.ip_address,
            created_at: self.clock.now(),
        };
        self.tracking.insert_event(&event).await?;
        self.metrics
            .tracking_events
            .with_label_values(&[event_type.as_str()])
            .inc();

        if event_type == TrackingEventType::Unsubscribed {
            self.unsubscribe_address(&delivery.to_address).await?;
        }

        if !first {
            return Ok(RecordOutcome::Repeated);
        }

        self.bump_counters(&delivery, event_type).await?;
        debug!(
            tracking_id = %tracking_id,
            event = %event_type,
            device = %device_type,
            client = %email_client,
            "Recorded tracking event"
        );
        Ok(RecordOutcome::Recorded)
    }

    async fn bump_counters(&self, delivery: &DeliveryLog, event_type: TrackingEventType) -> Result<()> {
        if let Some(campaign_id) = delivery.campaign_id {
            let counter = match event_type {
                TrackingEventType::Opened => Some(CampaignCounter::Open),
                TrackingEventType::Clicked => Some(CampaignCounter::Click),
                TrackingEventType::Unsubscribed => Some(CampaignCounter::Unsubscribe),
                TrackingEventType::Converted => None,
            };
            if let Some(counter) = counter {
                self.campaigns.increment_counter(campaign_id, counter).await?;
            }
        }

        if let (Some(ab_test_id), Some(variant)) = (delivery.ab_test_id, delivery.variant()) {
            let counter = match event_type {
                TrackingEventType::Opened => Some(VariantCounter::Open),
                TrackingEventType::Clicked => Some(VariantCounter::Click),
                TrackingEventType::Converted => Some(VariantCounter::Conversion),
                TrackingEventType::Unsubscribed => None,
            };
            if let Some(counter) = counter {
                self.campaigns
                    .increment_variant_counter(ab_test_id, variant, counter)
                    .await?;
            }
        }

        if let Some(automation_id) = delivery.automation_id {
            let counter = match event_type {
                TrackingEventType::Opened => Some(AutomationCounter::Opened),
                TrackingEventType::Clicked => Some(AutomationCounter::Clicked),
                _ => None,
            };
            if let Some(counter) = counter {
                self.automations.increment_counter(automation_id, counter).await?;
            }
        }
        Ok(())
    }

    async fn unsubscribe_address(&self, email: &str) -> Result<()> {
        let updated = self
            .subscribers
            .set_status(email, SubscriberStatus::Unsubscribed, self.clock.now())
            .await?;
        if !updated {
            // No subscriber row (list or transactional recipient)
            self.subscribers
                .add_suppression(email, "unsubscribed", self.clock.now())
                .await?;
        }
        Ok(())
    }

    /// Handle an unsubscribe link click.
    ///
    /// With a signing secret the signature over `tracking_id:email` must
    /// verify. Without one, the tracking id must belong to a delivery to
    /// that address.
    pub async fn unsubscribe(
        &self,
        tracking_id: &str,
        email: &str,
        signature: Option<&str>,
        details: EventDetails,
    ) -> Result<RecordOutcome> {
        let email = normalize_email(email);

        let signed = match (&self.secret, signature) {
            (Some(secret), Some(sig)) => {
                if !verify_hex(secret, unsubscribe_payload(tracking_id, &email).as_bytes(), sig) {
                    return Err(Error::Unauthorized("invalid unsubscribe signature".into()));
                }
                true
            }
            (Some(_), None) => {
                return Err(Error::Unauthorized("missing unsubscribe signature".into()))
            }
            (None, _) => false,
        };

        let delivery = self.tracking.get_delivery_log(tracking_id).await?;
        match delivery {
            Some(log) if normalize_email(&log.to_address) == email => {
                let outcome = self
                    .record_event(tracking_id, TrackingEventType::Unsubscribed, details)
                    .await?;
                info!(tracking_id = %tracking_id, email = %email, "Recipient unsubscribed");
                Ok(outcome)
            }
            _ if signed => {
                self.unsubscribe_address(&email).await?;
                info!(email = %email, "Recipient unsubscribed without a matching delivery");
                Ok(RecordOutcome::NotFound)
            }
            _ => Err(Error::NotFound(format!(
                "No delivery {} for {}",
                tracking_id, email
            ))),
        }
    }

    /// Record a tracked link click ahead of the redirect.
    ///
    /// With a signing secret the signature over `tracking_id:url` must
    /// verify. Clicks for unknown tracking ids are rejected.
    pub async fn record_click(
        &self,
        tracking_id: &str,
        url: &str,
        signature: Option<&str>,
        details: EventDetails,
    ) -> Result<RecordOutcome> {
        if let Some(secret) = &self.secret {
            let signature =
                signature.ok_or_else(|| Error::Unauthorized("missing click signature".into()))?;
            if !verify_hex(secret, click_payload(tracking_id, url).as_bytes(), signature) {
                return Err(Error::Unauthorized("invalid click signature".into()));
            }
        }

        let details = EventDetails {
            link_url: Some(url.to_string()),
            ..details
        };
        match self
            .record_event(tracking_id, TrackingEventType::Clicked, details)
            .await?
        {
            RecordOutcome::NotFound => Err(Error::NotFound(format!("No delivery {}", tracking_id))),
            outcome => Ok(outcome),
        }
    }

    pub async fn record_conversion(
        &self,
        tracking_id: &str,
        details: EventDetails,
    ) -> Result<RecordOutcome> {
        self.record_event(tracking_id, TrackingEventType::Converted, details)
            .await
    }
}
