//! In-process store with the same semantics as the PostgreSQL repositories.
//!
//! Used by `database.backend = "memory"` and throughout the test suites.
//! Each repository module implements its trait for [`MemoryStore`] next to
//! the PostgreSQL implementation.

use crate::models::*;
use mailpipe_common::types::{AbTestId, AutomationId, CampaignId, ExecutionId, MessageId, TemplateId};
use mailpipe_common::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
pub(crate) struct MemoryState {
    pub messages: HashMap<MessageId, QueuedMessage>,
    pub delivery_logs: HashMap<String, DeliveryLog>,
    pub tracking_events: Vec<TrackingEvent>,
    pub rules: HashMap<AutomationId, AutomationRule>,
    pub executions: HashMap<ExecutionId, AutomationExecution>,
    pub campaigns: HashMap<CampaignId, Campaign>,
    pub ab_tests: HashMap<AbTestId, AbTest>,
    /// Keyed by normalized address
    pub subscribers: HashMap<String, Subscriber>,
    pub suppressions: HashMap<String, SuppressionEntry>,
    pub templates: HashMap<TemplateId, EmailTemplate>,
    pub webhooks: Vec<WebhookEvent>,
    /// Batch inserts touching one of these addresses fail
    #[cfg(any(test, feature = "test-util"))]
    pub poisoned_addresses: std::collections::HashSet<String>,
}

/// Shared in-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every batch insert that contains `email` fail
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_batches_containing(&self, email: &str) {
        self.state()
            .poisoned_addresses
            .insert(mailpipe_common::types::normalize_email(email));
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn check_batch(state: &MemoryState, inputs: &[NewMessage]) -> Result<()> {
        match inputs.iter().find(|m| {
            state
                .poisoned_addresses
                .contains(&mailpipe_common::types::normalize_email(&m.to_address))
        }) {
            Some(m) => Err(mailpipe_common::Error::Database(format!(
                "batch insert rejected for {}",
                m.to_address
            ))),
            None => Ok(()),
        }
    }

    #[cfg(not(any(test, feature = "test-util")))]
    pub(crate) fn check_batch(_state: &MemoryState, _inputs: &[NewMessage]) -> Result<()> {
        Ok(())
    }

    /// All queued messages, oldest first
    pub fn messages(&self) -> Vec<QueuedMessage> {
        let mut messages: Vec<_> = self.state().messages.values().cloned().collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages
    }

    /// All executions, oldest first
    pub fn executions(&self) -> Vec<AutomationExecution> {
        let mut executions: Vec<_> = self.state().executions.values().cloned().collect();
        executions.sort_by_key(|e| (e.created_at, e.id));
        executions
    }

    pub fn tracking_events(&self) -> Vec<TrackingEvent> {
        self.state().tracking_events.clone()
    }

    pub fn delivery_logs(&self) -> Vec<DeliveryLog> {
        let mut logs: Vec<_> = self.state().delivery_logs.values().cloned().collect();
        logs.sort_by_key(|l| (l.sent_at, l.id));
        logs
    }

    pub fn webhook_events(&self) -> Vec<WebhookEvent> {
        self.state().webhooks.clone()
    }
}
