//! Wiring of every pipeline component over one set of repositories

use crate::automation::AutomationEngine;
use crate::campaign::CampaignService;
use crate::cron::Orchestrator;
use crate::eligibility::EligibilityGate;
use crate::metrics::Metrics;
use crate::provider::EmailProvider;
use crate::queue::{MessageQueue, QueueWorker};
use crate::tracking::{TrackingInjector, TrackingOptions, TrackingService};
use crate::webhooks::WebhookProcessor;
use mailpipe_common::{Clock, Config, Error, Result};
use mailpipe_storage::Repositories;
use std::sync::Arc;

/// The assembled pipeline
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<Config>,
    pub repos: Repositories,
    pub clock: Arc<dyn Clock>,
    pub metrics: Metrics,
    pub gate: EligibilityGate,
    pub queue: MessageQueue,
    pub worker: QueueWorker,
    pub automations: AutomationEngine,
    pub campaigns: CampaignService,
    pub tracking: TrackingService,
    pub webhooks: WebhookProcessor,
    pub injector: TrackingInjector,
}

impl Pipeline {
    pub fn new(
        config: Config,
        repos: Repositories,
        provider: Arc<dyn EmailProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let metrics = Metrics::new().map_err(|e| Error::Internal(format!("metrics: {}", e)))?;

        let gate = EligibilityGate::new(
            repos.subscribers.clone(),
            repos.automations.clone(),
            clock.clone(),
        );
        let queue = MessageQueue::new(
            repos.messages.clone(),
            gate.clone(),
            clock.clone(),
            metrics.clone(),
            config.queue.clone(),
        );
        let worker = QueueWorker::new(
            repos.messages.clone(),
            repos.tracking.clone(),
            provider,
            clock.clone(),
            metrics.clone(),
            config.queue.clone(),
            config.provider.clone(),
        );

        let injector = TrackingInjector::from_config(&config.tracking, &config.server);
        let tracking_options = TrackingOptions::from(&config.tracking);

        let automations = AutomationEngine::new(
            repos.automations.clone(),
            repos.templates.clone(),
            queue.clone(),
            gate.clone(),
            injector.clone(),
            tracking_options,
            clock.clone(),
            config.queue.automation_priority,
        );
        let campaigns = CampaignService::new(
            repos.campaigns.clone(),
            repos.subscribers.clone(),
            queue.clone(),
            injector.clone(),
            tracking_options,
            clock.clone(),
            config.campaign.batch_size,
            config.queue.campaign_priority,
        );
        let tracking = TrackingService::new(
            repos.tracking.clone(),
            repos.campaigns.clone(),
            repos.automations.clone(),
            repos.subscribers.clone(),
            clock.clone(),
            metrics.clone(),
            config.tracking.secret.clone(),
        );
        let webhooks = WebhookProcessor::new(
            repos.webhooks.clone(),
            repos.subscribers.clone(),
            repos.campaigns.clone(),
            repos.tracking.clone(),
            clock.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            repos,
            clock,
            metrics,
            gate,
            queue,
            worker,
            automations,
            campaigns,
            tracking,
            webhooks,
            injector,
        })
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.worker.clone(),
            self.queue.clone(),
            self.automations.clone(),
            self.campaigns.clone(),
            self.repos.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            self.config.cron.clone(),
            self.config.retention.clone(),
            self.config.queue.batch_size,
        )
    }
}
