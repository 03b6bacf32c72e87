//! Repository layer for data access

pub mod automations;
pub mod campaigns;
pub mod messages;
pub mod subscribers;
pub mod templates;
pub mod tracking;
pub mod webhooks;

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use std::sync::Arc;

// Re-export concrete repository implementations
pub use automations::DbAutomationRepository;
pub use campaigns::DbCampaignRepository;
pub use messages::DbMessageRepository;
pub use subscribers::DbSubscriberRepository;
pub use templates::DbTemplateRepository;
pub use tracking::DbTrackingRepository;
pub use webhooks::DbWebhookRepository;

// Re-export repository traits
pub use automations::AutomationRepository;
pub use campaigns::CampaignRepository;
pub use messages::MessageRepository;
pub use subscribers::SubscriberRepository;
pub use templates::TemplateRepository;
pub use tracking::TrackingRepository;
pub use webhooks::WebhookRepository;

/// Every repository behind one handle
#[derive(Clone)]
pub struct Repositories {
    pub messages: Arc<dyn MessageRepository>,
    pub automations: Arc<dyn AutomationRepository>,
    pub campaigns: Arc<dyn CampaignRepository>,
    pub subscribers: Arc<dyn SubscriberRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub tracking: Arc<dyn TrackingRepository>,
    pub webhooks: Arc<dyn WebhookRepository>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
            automations: Arc::new(DbAutomationRepository::new(pool.clone())),
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            subscribers: Arc::new(DbSubscriberRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool.clone())),
            tracking: Arc::new(DbTrackingRepository::new(pool.clone())),
            webhooks: Arc::new(DbWebhookRepository::new(pool)),
        }
    }

    /// Repositories backed by one in-memory store
    pub fn memory(store: MemoryStore) -> Self {
        Self {
            messages: Arc::new(store.clone()),
            automations: Arc::new(store.clone()),
            campaigns: Arc::new(store.clone()),
            subscribers: Arc::new(store.clone()),
            templates: Arc::new(store.clone()),
            tracking: Arc::new(store.clone()),
            webhooks: Arc::new(store),
        }
    }
}
