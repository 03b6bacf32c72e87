//! Suppression and eligibility gate
//!
//! Decides whether a recipient may receive a message. The checks short-circuit
//! in order: global suppression list, subscriber status, per-automation send
//! limit, per-automation cooldown. The gate has no side effects.

use mailpipe_common::types::{checked_sub_days, AutomationId, UserId};
use mailpipe_common::{Clock, Result};
use mailpipe_storage::models::{AutomationRule, SubscriberStatus};
use mailpipe_storage::{AutomationRepository, SubscriberRepository};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Per-automation frequency caps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationContext {
    pub automation_id: AutomationId,
    pub send_limit_per_user: Option<i32>,
    pub cooldown_days: Option<i32>,
}

impl From<&AutomationRule> for AutomationContext {
    fn from(rule: &AutomationRule) -> Self {
        Self {
            automation_id: rule.id,
            send_limit_per_user: rule.send_limit_per_user,
            cooldown_days: rule.cooldown_days,
        }
    }
}

/// Why a recipient was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Suppressed,
    Subscriber(SubscriberStatus),
    LimitReached,
    Cooldown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Suppressed => f.write_str("suppressed"),
            RejectReason::Subscriber(status) => f.write_str(status.as_str()),
            RejectReason::LimitReached => f.write_str("limit reached"),
            RejectReason::Cooldown => f.write_str("cooldown"),
        }
    }
}

/// Gate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Allowed,
    Rejected(RejectReason),
}

impl Eligibility {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Eligibility::Allowed)
    }
}

/// Eligibility gate
#[derive(Clone)]
pub struct EligibilityGate {
    subscribers: Arc<dyn SubscriberRepository>,
    automations: Arc<dyn AutomationRepository>,
    clock: Arc<dyn Clock>,
}

impl EligibilityGate {
    pub fn new(
        subscribers: Arc<dyn SubscriberRepository>,
        automations: Arc<dyn AutomationRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            subscribers,
            automations,
            clock,
        }
    }

    /// Suppression list and subscriber status only
    pub async fn check_recipient(&self, email: &str) -> Result<Eligibility> {
        self.check(email, None, None).await
    }

    pub async fn check(
        &self,
        email: &str,
        user_id: Option<UserId>,
        automation: Option<&AutomationContext>,
    ) -> Result<Eligibility> {
        if self.subscribers.is_suppressed(email).await? {
            debug!(email = %email, "Recipient is on the suppression list");
            return Ok(Eligibility::Rejected(RejectReason::Suppressed));
        }

        match self.subscribers.subscriber_status(email).await? {
            Some(SubscriberStatus::Active) | None => {}
            Some(status) => return Ok(Eligibility::Rejected(RejectReason::Subscriber(status))),
        }

        let (user_id, ctx) = match (user_id, automation) {
            (Some(user_id), Some(ctx)) => (user_id, ctx),
            _ => return Ok(Eligibility::Allowed),
        };

        if let Some(limit) = ctx.send_limit_per_user {
            let sent = self
                .automations
                .count_completed(ctx.automation_id, user_id)
                .await?;
            if sent >= i64::from(limit) {
                return Ok(Eligibility::Rejected(RejectReason::LimitReached));
            }
        }

        if let Some(days) = ctx.cooldown_days.filter(|d| *d > 0) {
            if let Some(last) = self
                .automations
                .last_completed_at(ctx.automation_id, user_id)
                .await?
            {
                // A window reaching past the earliest representable time covers everything
                let in_cooldown = checked_sub_days(self.clock.now(), i64::from(days))
                    .map_or(true, |since| last > since);
                if in_cooldown {
                    return Ok(Eligibility::Rejected(RejectReason::Cooldown));
                }
            }
        }

        Ok(Eligibility::Allowed)
    }
}
