//! Database models

use chrono::{DateTime, Utc};
use mailpipe_common::types::{
    AbTestId, AutomationId, CampaignId, ExecutionId, MessageId, SubscriberId, TemplateId, UserId,
};
use serde::{Deserialize, Serialize};
pub use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Error returned when a stored text value does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Rejected status change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot move {kind} from {from} to {to}")]
pub struct TransitionError {
    pub kind: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

impl From<TransitionError> for mailpipe_common::Error {
    fn from(e: TransitionError) -> Self {
        mailpipe_common::Error::InvalidTransition(e.to_string())
    }
}

/// Implements the text mapping shared by every enum stored in a TEXT column.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseEnumError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Queued message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

text_enum!(MessageStatus, "message status", {
    Pending => "pending",
    Processing => "processing",
    Sent => "sent",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl MessageStatus {
    /// Whether the message has left the delivery path
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor.
    ///
    /// Backward edges are limited to retry (processing/failed -> pending) and
    /// campaign resume (cancelled -> pending).
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Sent)
                | (Processing, Pending)
                | (Processing, Failed)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }

    pub fn transition(self, next: MessageStatus) -> Result<MessageStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                kind: "message",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// A/B variant label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
}

text_enum!(Variant, "variant", {
    A => "A",
    B => "B",
});

/// Structured message metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_variant: Option<Variant>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_test_id: Option<AbTestId>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Queued outbound message
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub to_address: String,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub automation_id: Option<AutomationId>,
    pub template_id: Option<TemplateId>,
    pub subscriber_id: Option<SubscriberId>,
    pub priority: i32,
    #[sqlx(try_from = "String")]
    pub status: MessageStatus,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub cancel_reason: Option<String>,
    pub metadata: Json<MessageMetadata>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn tracking_id(&self) -> Option<&str> {
        self.metadata.tracking_id.as_deref()
    }
}

/// Enqueue input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMessage {
    pub to_address: String,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub automation_id: Option<AutomationId>,
    pub template_id: Option<TemplateId>,
    pub subscriber_id: Option<SubscriberId>,
    #[serde(default)]
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

/// Message counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.sent + self.failed + self.cancelled
    }
}

/// One successful provider hand-off
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub message_id: MessageId,
    pub tracking_id: String,
    pub to_address: String,
    pub campaign_id: Option<CampaignId>,
    pub automation_id: Option<AutomationId>,
    pub ab_test_id: Option<AbTestId>,
    pub ab_variant: Option<String>,
    pub provider_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl DeliveryLog {
    pub fn variant(&self) -> Option<Variant> {
        self.ab_variant.as_deref().and_then(|v| v.parse().ok())
    }
}

// ---------------------------------------------------------------------------
// Automations
// ---------------------------------------------------------------------------

/// Business event that may start an automation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Welcome,
    AbandonedCart,
    OrderPlaced,
    OrderShipped,
    OrderDelivered,
    InactiveUser,
    ReviewRequest,
}

text_enum!(TriggerType, "trigger type", {
    Welcome => "welcome",
    AbandonedCart => "abandoned_cart",
    OrderPlaced => "order_placed",
    OrderShipped => "order_shipped",
    OrderDelivered => "order_delivered",
    InactiveUser => "inactive_user",
    ReviewRequest => "review_request",
});

/// Per-rule firing conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cart_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_order_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_days: Option<i64>,

    #[serde(default)]
    pub delay_hours: i64,
}

/// Automation rule
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: AutomationId,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub trigger_type: TriggerType,
    pub trigger_conditions: Json<TriggerConditions>,
    pub template_id: TemplateId,
    pub is_active: bool,
    pub priority: i32,
    pub send_limit_per_user: Option<i32>,
    pub cooldown_days: Option<i32>,
    pub total_sent: i32,
    pub total_opened: i32,
    pub total_clicked: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create automation rule input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAutomationRule {
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_conditions: TriggerConditions,
    pub template_id: TemplateId,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    pub send_limit_per_user: Option<i32>,
    pub cooldown_days: Option<i32>,
}

fn default_true() -> bool {
    true
}

/// Business event payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Event specific fields (cart_total, order_total, last_active_at, ...)
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl TriggerEvent {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Numeric field, accepting numbers or numeric strings
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Automation execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

text_enum!(ExecutionStatus, "execution status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

impl ExecutionStatus {
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Processing, Skipped)
        )
    }

    pub fn transition(self, next: ExecutionStatus) -> Result<ExecutionStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                kind: "execution",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// One attempt to run an automation for one recipient
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutomationExecution {
    pub id: ExecutionId,
    pub automation_id: AutomationId,
    pub user_id: Option<UserId>,
    pub email: String,
    pub trigger_data: Json<TriggerEvent>,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    pub skip_reason: Option<String>,
    pub queued_message_id: Option<MessageId>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Create execution input
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub automation_id: AutomationId,
    pub event: TriggerEvent,
    pub status: ExecutionStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Final state of an execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed { message_id: MessageId },
    Skipped { reason: String },
    Failed { reason: String },
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Completed { .. } => ExecutionStatus::Completed,
            ExecutionOutcome::Skipped { .. } => ExecutionStatus::Skipped,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
        }
    }
}

/// Lifetime counters on an automation rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationCounter {
    Sent,
    Opened,
    Clicked,
}

impl AutomationCounter {
    pub fn column(&self) -> &'static str {
        match self {
            AutomationCounter::Sent => "total_sent",
            AutomationCounter::Opened => "total_opened",
            AutomationCounter::Clicked => "total_clicked",
        }
    }
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Sending,
    Sent,
    Paused,
    Failed,
}

text_enum!(CampaignStatus, "campaign status", {
    Draft => "draft",
    Sending => "sending",
    Sent => "sent",
    Paused => "paused",
    Failed => "failed",
});

/// Who receives a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetAudience {
    All,
    Segment { tag: String },
    List { emails: Vec<String> },
}

impl Default for TargetAudience {
    fn default() -> Self {
        TargetAudience::All
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub target_audience: Json<TargetAudience>,
    #[sqlx(try_from = "String")]
    pub status: CampaignStatus,
    pub track_opens: bool,
    pub track_clicks: bool,
    pub ab_test_id: Option<AbTestId>,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub open_count: i32,
    pub click_count: i32,
    pub bounce_count: i32,
    pub unsubscribe_count: i32,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create campaign input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub target_audience: TargetAudience,
    #[serde(default = "default_true")]
    pub track_opens: bool,
    #[serde(default = "default_true")]
    pub track_clicks: bool,
    pub ab_test_id: Option<AbTestId>,
}

/// Aggregate counters on a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignCounter {
    Open,
    Click,
    Bounce,
    Unsubscribe,
}

impl CampaignCounter {
    pub fn column(&self) -> &'static str {
        match self {
            CampaignCounter::Open => "open_count",
            CampaignCounter::Click => "click_count",
            CampaignCounter::Bounce => "bounce_count",
            CampaignCounter::Unsubscribe => "unsubscribe_count",
        }
    }
}

/// Totals written when a fan-out finishes
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignSendSummary {
    pub status: CampaignStatus,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub sent_at: DateTime<Utc>,
}

/// What the A/B test varies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestType {
    Subject,
    Content,
    FromName,
    SendTime,
}

text_enum!(AbTestType, "ab test type", {
    Subject => "subject",
    Content => "content",
    FromName => "from_name",
    SendTime => "send_time",
});

/// How the winner is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerCriteria {
    OpenRate,
    ClickRate,
    Conversion,
}

text_enum!(WinnerCriteria, "winner criteria", {
    OpenRate => "open_rate",
    ClickRate => "click_rate",
    Conversion => "conversion",
});

/// A/B test status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestStatus {
    Draft,
    Running,
    Completed,
}

text_enum!(AbTestStatus, "ab test status", {
    Draft => "draft",
    Running => "running",
    Completed => "completed",
});

/// Payload of one variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_delay_hours: Option<i64>,
}

/// A/B test model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AbTest {
    pub id: AbTestId,
    pub campaign_id: CampaignId,
    #[sqlx(try_from = "String")]
    pub test_type: AbTestType,
    pub variant_a: Json<VariantContent>,
    pub variant_b: Json<VariantContent>,
    pub split_percentage: i32,
    #[sqlx(try_from = "String")]
    pub winner_criteria: WinnerCriteria,
    pub test_duration_hours: i32,
    #[sqlx(try_from = "String")]
    pub status: AbTestStatus,
    pub variant_a_sent: i32,
    pub variant_a_opens: i32,
    pub variant_a_clicks: i32,
    pub variant_a_conversions: i32,
    pub variant_b_sent: i32,
    pub variant_b_opens: i32,
    pub variant_b_clicks: i32,
    pub variant_b_conversions: i32,
    pub winner: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AbTest {
    pub fn winner_variant(&self) -> Option<Variant> {
        self.winner.as_deref().and_then(|w| w.parse().ok())
    }

    pub fn content(&self, variant: Variant) -> &VariantContent {
        match variant {
            Variant::A => &self.variant_a,
            Variant::B => &self.variant_b,
        }
    }
}

/// Create A/B test input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAbTest {
    pub campaign_id: CampaignId,
    pub test_type: AbTestType,
    pub variant_a: VariantContent,
    pub variant_b: VariantContent,
    pub split_percentage: i32,
    pub winner_criteria: WinnerCriteria,
    pub test_duration_hours: i32,
}

/// Per-variant counters on an A/B test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantCounter {
    Open,
    Click,
    Conversion,
}

impl VariantCounter {
    pub fn column(&self, variant: Variant) -> &'static str {
        match (variant, self) {
            (Variant::A, VariantCounter::Open) => "variant_a_opens",
            (Variant::A, VariantCounter::Click) => "variant_a_clicks",
            (Variant::A, VariantCounter::Conversion) => "variant_a_conversions",
            (Variant::B, VariantCounter::Open) => "variant_b_opens",
            (Variant::B, VariantCounter::Click) => "variant_b_clicks",
            (Variant::B, VariantCounter::Conversion) => "variant_b_conversions",
        }
    }
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

/// Inbound engagement event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingEventType {
    Opened,
    Clicked,
    Unsubscribed,
    Converted,
}

text_enum!(TrackingEventType, "tracking event type", {
    Opened => "opened",
    Clicked => "clicked",
    Unsubscribed => "unsubscribed",
    Converted => "converted",
});

/// Device class derived from the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Tablet,
    Mobile,
    Desktop,
    Unknown,
}

text_enum!(DeviceType, "device type", {
    Tablet => "tablet",
    Mobile => "mobile",
    Desktop => "desktop",
    Unknown => "unknown",
});

/// Mail client derived from the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailClient {
    Gmail,
    Outlook,
    AppleMail,
    Yahoo,
    Thunderbird,
    Other,
}

text_enum!(EmailClient, "email client", {
    Gmail => "gmail",
    Outlook => "outlook",
    AppleMail => "apple_mail",
    Yahoo => "yahoo",
    Thunderbird => "thunderbird",
    Other => "other",
});

/// Append-only engagement record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub id: Uuid,
    pub tracking_id: String,
    pub message_id: Option<MessageId>,
    pub campaign_id: Option<CampaignId>,
    pub automation_id: Option<AutomationId>,
    #[sqlx(try_from = "String")]
    pub event_type: TrackingEventType,
    pub link_url: Option<String>,
    pub link_id: Option<i32>,
    #[sqlx(try_from = "String")]
    pub device_type: DeviceType,
    #[sqlx(try_from = "String")]
    pub email_client: EmailClient,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Subscribers & suppression
// ---------------------------------------------------------------------------

/// Subscriber status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Unsubscribed,
    Bounced,
    Complained,
}

text_enum!(SubscriberStatus, "subscriber status", {
    Active => "active",
    Unsubscribed => "unsubscribed",
    Bounced => "bounced",
    Complained => "complained",
});

/// Mailing list subscriber
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub email: String,
    pub name: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SubscriberStatus,
    pub tags: Vec<String>,
    pub attributes: Json<BTreeMap<String, serde_json::Value>>,
    pub user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Create or update subscriber input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSubscriber {
    pub email: String,
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub user_id: Option<UserId>,
}

/// Global suppression list entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub email: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Rendered template content as produced by the template store
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: TemplateId,
    pub name: String,
    pub subject: String,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Create template input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub subject: String,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider webhooks
// ---------------------------------------------------------------------------

/// Provider notification kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    Delivered,
    Bounced,
    Complained,
}

text_enum!(WebhookEventType, "webhook event type", {
    Delivered => "delivered",
    Bounced => "bounced",
    Complained => "complained",
});

/// Stored provider notification
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub event_type: WebhookEventType,
    pub email: String,
    pub provider_message_id: Option<String>,
    pub payload: Json<serde_json::Value>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
