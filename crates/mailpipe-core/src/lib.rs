//! Mailpipe Core - delivery queue, automations, campaigns and tracking
//!
//! This crate turns business events and campaigns into queued messages,
//! delivers them through a provider adapter and records engagement.

pub mod automation;
pub mod campaign;
pub mod cron;
pub mod eligibility;
pub mod metrics;
pub mod provider;
pub mod queue;
pub mod services;
pub mod template;
pub mod tracking;
pub mod webhooks;

pub use automation::{AutomationEngine, RuleOutcome, TriggerReport};
pub use campaign::{CampaignError, CampaignService, PauseReport, SendReport};
pub use cron::{CronReport, HealthReport, HealthStatus, Orchestrator};
pub use eligibility::{Eligibility, EligibilityGate};
pub use metrics::Metrics;
pub use provider::{build_provider, EmailProvider, ProviderError};
pub use queue::{MessageQueue, QueueWorker};
pub use services::Pipeline;
pub use tracking::{RecordOutcome, TrackingInjector, TrackingService};
pub use webhooks::{ProviderWebhook, WebhookOutcome, WebhookProcessor};
