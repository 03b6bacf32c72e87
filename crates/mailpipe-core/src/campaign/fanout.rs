//! Recipient resolution and per-recipient message building

use super::ab_test::assign_variant;
use crate::queue::LIST_UNSUBSCRIBE_KEY;
use crate::template::{render, TemplateVariables};
use crate::tracking::{new_tracking_id, TrackingInjector, TrackingOptions};
use chrono::{DateTime, Utc};
use mailpipe_common::types::{checked_add_hours, normalize_email, EmailAddress, SubscriberId};
use mailpipe_common::{Error, Result};
use mailpipe_storage::models::{
    AbTest, AbTestStatus, AbTestType, Campaign, MessageMetadata, NewMessage, TargetAudience,
    Variant, VariantContent,
};
use mailpipe_storage::SubscriberRepository;
use std::collections::HashSet;
use tracing::warn;

/// One resolved recipient
#[derive(Debug, Clone)]
pub(crate) struct Recipient {
    pub email: String,
    pub subscriber_id: Option<SubscriberId>,
    pub vars: TemplateVariables,
}

/// Recipients for a campaign, invalid and suppressed addresses removed
pub(crate) struct ResolvedAudience {
    pub recipients: Vec<Recipient>,
    pub invalid: usize,
    pub suppressed: usize,
}

pub(crate) async fn resolve_recipients(
    subscribers: &dyn SubscriberRepository,
    audience: &TargetAudience,
) -> Result<ResolvedAudience> {
    let candidates: Vec<Recipient> = match audience {
        TargetAudience::List { emails } => emails
            .iter()
            .map(|e| e.trim())
            .map(|e| Recipient {
                email: e.to_string(),
                subscriber_id: None,
                vars: TemplateVariables::for_address(e),
            })
            .collect(),
        TargetAudience::Segment { tag } => subscribers
            .list_active(Some(tag))
            .await?
            .iter()
            .map(subscriber_recipient)
            .collect(),
        TargetAudience::All => subscribers
            .list_active(None)
            .await?
            .iter()
            .map(subscriber_recipient)
            .collect(),
    };

    // One malformed address would fail the whole batch it lands in
    let mut invalid = 0;
    let mut seen = HashSet::new();
    let candidates: Vec<Recipient> = candidates
        .into_iter()
        .filter(|r| {
            let valid = EmailAddress::parse(&r.email).is_some();
            if !valid {
                invalid += 1;
                warn!(email = %r.email, subscriber_id = ?r.subscriber_id, "Skipping invalid recipient address");
            }
            valid
        })
        .filter(|r| seen.insert(normalize_email(&r.email)))
        .collect();

    let emails: Vec<String> = candidates.iter().map(|r| r.email.clone()).collect();
    let suppressed: HashSet<String> = subscribers
        .suppressed_among(&emails)
        .await?
        .into_iter()
        .collect();

    let total = candidates.len();
    let recipients: Vec<Recipient> = candidates
        .into_iter()
        .filter(|r| !suppressed.contains(&normalize_email(&r.email)))
        .collect();

    Ok(ResolvedAudience {
        suppressed: total - recipients.len(),
        invalid,
        recipients,
    })
}

fn subscriber_recipient(subscriber: &mailpipe_storage::models::Subscriber) -> Recipient {
    Recipient {
        email: subscriber.email.clone(),
        subscriber_id: Some(subscriber.id),
        vars: TemplateVariables::from_subscriber(subscriber),
    }
}

/// Unrendered content of one send
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Content {
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub from_name: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Content {
    pub fn from_campaign(campaign: &Campaign) -> Self {
        Self {
            subject: campaign.subject.clone(),
            html_body: campaign.html_body.clone(),
            text_body: campaign.text_body.clone(),
            from_name: campaign.from_name.clone(),
            scheduled_at: None,
        }
    }

    /// Overlay the part of the variant the test varies
    pub fn with_variant(
        mut self,
        test_type: AbTestType,
        variant: &VariantContent,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        match test_type {
            AbTestType::Subject => {
                if let Some(subject) = &variant.subject {
                    self.subject = subject.clone();
                }
            }
            AbTestType::Content => {
                if variant.html_body.is_some() {
                    self.html_body = variant.html_body.clone();
                }
                if variant.text_body.is_some() {
                    self.text_body = variant.text_body.clone();
                }
            }
            AbTestType::FromName => {
                if variant.from_name.is_some() {
                    self.from_name = variant.from_name.clone();
                }
            }
            AbTestType::SendTime => {
                if let Some(hours) = variant.send_delay_hours.filter(|h| *h > 0) {
                    let at = checked_add_hours(now, hours).ok_or_else(|| {
                        Error::Validation(format!("send_delay_hours {} is out of range", hours))
                    })?;
                    self.scheduled_at = Some(at);
                }
            }
        }
        Ok(self)
    }
}

/// How variants are handed out for this send
pub(crate) enum VariantPlan<'a> {
    None,
    /// Running test: split by recipient index
    Split(&'a AbTest),
    /// Completed test: everyone gets the winner
    Winner(&'a AbTest, Variant),
}

impl<'a> VariantPlan<'a> {
    pub fn for_test(test: Option<&'a AbTest>) -> Self {
        match test {
            None => VariantPlan::None,
            Some(t) if t.status == AbTestStatus::Completed => {
                VariantPlan::Winner(t, t.winner_variant().unwrap_or(Variant::A))
            }
            Some(t) => VariantPlan::Split(t),
        }
    }
}

/// Builds the queued message for each recipient
pub(crate) struct MessageBuilder<'a> {
    pub campaign: &'a Campaign,
    pub plan: VariantPlan<'a>,
    pub injector: &'a TrackingInjector,
    pub options: TrackingOptions,
    pub priority: i32,
    pub now: DateTime<Utc>,
}

impl MessageBuilder<'_> {
    pub fn build(&self, index: usize, recipient: &Recipient) -> Result<NewMessage> {
        let base = Content::from_campaign(self.campaign);
        let (content, tagged) = match &self.plan {
            VariantPlan::None => (base, None),
            VariantPlan::Split(test) => {
                let variant = assign_variant(index, test.split_percentage);
                (
                    base.with_variant(test.test_type, test.content(variant), self.now)?,
                    Some((test.id, variant)),
                )
            }
            VariantPlan::Winner(test, variant) => (
                base.with_variant(test.test_type, test.content(*variant), self.now)?,
                None,
            ),
        };

        let tracking_id = new_tracking_id();
        let vars = &recipient.vars;
        let html_body = content.html_body.as_deref().map(|html| {
            self.injector.prepare_email_for_tracking(
                &render(html, vars),
                &tracking_id,
                &recipient.email,
                self.options,
            )
        });

        let mut metadata = MessageMetadata {
            tracking_id: Some(tracking_id.clone()),
            ab_test_id: tagged.map(|(id, _)| id),
            ab_variant: tagged.map(|(_, v)| v),
            ..Default::default()
        };
        metadata.extra.insert(
            LIST_UNSUBSCRIBE_KEY.to_string(),
            self.injector
                .list_unsubscribe_header(&tracking_id, &recipient.email)
                .into(),
        );

        Ok(NewMessage {
            to_address: recipient.email.clone(),
            from_address: self.campaign.from_address.clone(),
            from_name: content.from_name,
            reply_to: self.campaign.reply_to.clone(),
            subject: render(&content.subject, vars),
            html_body,
            text_body: content.text_body.as_deref().map(|text| render(text, vars)),
            campaign_id: Some(self.campaign.id),
            subscriber_id: recipient.subscriber_id,
            priority: self.priority,
            scheduled_at: content.scheduled_at,
            metadata,
            ..Default::default()
        })
    }
}
