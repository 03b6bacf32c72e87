//! Automation Engine - turns business events into queued messages

use super::conditions::{self, ConditionOutcome};
use crate::eligibility::{AutomationContext, Eligibility, EligibilityGate};
use crate::queue::{MessageQueue, LIST_UNSUBSCRIBE_KEY};
use crate::template::{render, TemplateVariables};
use crate::tracking::{new_tracking_id, TrackingInjector, TrackingOptions};
use chrono::{DateTime, Utc};
use mailpipe_common::types::{
    checked_add_hours, AutomationId, EmailAddress, ExecutionId, MessageId,
};
use mailpipe_common::{Clock, Error, Result};
use mailpipe_storage::models::{
    AutomationCounter, AutomationExecution, AutomationRule, ExecutionOutcome, ExecutionStatus,
    MessageMetadata, NewExecution, NewMessage, TriggerEvent, TriggerType,
};
use mailpipe_storage::{AutomationRepository, TemplateRepository};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one rule for one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RuleOutcome {
    ConditionsNotMet {
        reason: String,
    },
    Scheduled {
        execution_id: ExecutionId,
        scheduled_for: DateTime<Utc>,
    },
    Completed {
        execution_id: ExecutionId,
        message_id: MessageId,
    },
    Skipped {
        execution_id: ExecutionId,
        reason: String,
    },
    Failed {
        execution_id: ExecutionId,
        reason: String,
    },
    /// Unexpected store error; no reliable execution state
    Error {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleReport {
    pub automation_id: AutomationId,
    pub name: String,
    #[serde(flatten)]
    pub outcome: RuleOutcome,
}

/// Result of one trigger call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerReport {
    pub trigger: TriggerType,
    pub rules_evaluated: usize,
    pub rules: Vec<RuleReport>,
}

/// Result of a scheduled-execution sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledReport {
    pub due: usize,
    pub executed: usize,
    /// Rule missing or inactive
    pub dropped: usize,
    /// Claimed by a concurrent sweep
    pub lost: usize,
    pub errors: usize,
    /// Put back as pending after the run could not be started
    pub restored: usize,
}

/// Automation engine
#[derive(Clone)]
pub struct AutomationEngine {
    automations: Arc<dyn AutomationRepository>,
    templates: Arc<dyn TemplateRepository>,
    queue: MessageQueue,
    gate: EligibilityGate,
    injector: TrackingInjector,
    tracking_options: TrackingOptions,
    clock: Arc<dyn Clock>,
    priority: i32,
}

impl AutomationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        automations: Arc<dyn AutomationRepository>,
        templates: Arc<dyn TemplateRepository>,
        queue: MessageQueue,
        gate: EligibilityGate,
        injector: TrackingInjector,
        tracking_options: TrackingOptions,
        clock: Arc<dyn Clock>,
        priority: i32,
    ) -> Self {
        Self {
            automations,
            templates,
            queue,
            gate,
            injector,
            tracking_options,
            clock,
            priority,
        }
    }

    /// Fire every active rule for `trigger` whose conditions hold
    pub async fn trigger_automation(
        &self,
        trigger: TriggerType,
        event: TriggerEvent,
    ) -> Result<TriggerReport> {
        if EmailAddress::parse(&event.email).is_none() {
            return Err(Error::Validation(format!(
                "Invalid event email: {}",
                event.email
            )));
        }

        let rules = self.automations.list_active_rules(trigger).await?;
        let mut report = TriggerReport {
            trigger,
            rules_evaluated: rules.len(),
            rules: Vec::with_capacity(rules.len()),
        };

        for rule in rules {
            let outcome = match self.fire_rule(&rule, &event).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(automation_id = %rule.id, "Automation rule failed: {}", e);
                    RuleOutcome::Error {
                        reason: e.to_string(),
                    }
                }
            };
            report.rules.push(RuleReport {
                automation_id: rule.id,
                name: rule.name.clone(),
                outcome,
            });
        }

        info!(
            trigger = %trigger,
            email = %event.email,
            rules = report.rules_evaluated,
            "Processed automation trigger"
        );
        Ok(report)
    }

    async fn fire_rule(&self, rule: &AutomationRule, event: &TriggerEvent) -> Result<RuleOutcome> {
        let now = self.clock.now();

        if let ConditionOutcome::NotMet(reason) =
            conditions::evaluate(rule.trigger_type, &rule.trigger_conditions, event, now)
        {
            debug!(automation_id = %rule.id, reason = %reason, "Conditions not met");
            return Ok(RuleOutcome::ConditionsNotMet { reason });
        }

        let delay_hours = rule.trigger_conditions.delay_hours;
        if delay_hours > 0 {
            let scheduled_for = checked_add_hours(now, delay_hours).ok_or_else(|| {
                Error::Validation(format!("delay_hours {} is out of range", delay_hours))
            })?;
            let execution = self
                .automations
                .create_execution(
                    NewExecution {
                        automation_id: rule.id,
                        event: event.clone(),
                        status: ExecutionStatus::Pending,
                        scheduled_for: Some(scheduled_for),
                    },
                    now,
                )
                .await?;
            debug!(
                automation_id = %rule.id,
                execution_id = %execution.id,
                scheduled_for = %scheduled_for,
                "Scheduled delayed automation"
            );
            return Ok(RuleOutcome::Scheduled {
                execution_id: execution.id,
                scheduled_for,
            });
        }

        self.execute_automation(rule, event.clone()).await
    }

    /// Run one rule for one recipient now
    pub async fn execute_automation(
        &self,
        rule: &AutomationRule,
        event: TriggerEvent,
    ) -> Result<RuleOutcome> {
        let execution = self.start_execution(rule, &event).await?;
        self.run_execution(rule, event, execution).await
    }

    async fn start_execution(
        &self,
        rule: &AutomationRule,
        event: &TriggerEvent,
    ) -> Result<AutomationExecution> {
        self.automations
            .create_execution(
                NewExecution {
                    automation_id: rule.id,
                    event: event.clone(),
                    status: ExecutionStatus::Processing,
                    scheduled_for: None,
                },
                self.clock.now(),
            )
            .await
    }

    async fn run_execution(
        &self,
        rule: &AutomationRule,
        event: TriggerEvent,
        execution: AutomationExecution,
    ) -> Result<RuleOutcome> {
        let outcome = match self.render_and_enqueue(rule, &event).await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::Failed {
                reason: e.to_string(),
            },
        };

        self.automations
            .finish_execution(execution.id, &outcome, self.clock.now())
            .await?;

        Ok(match outcome {
            ExecutionOutcome::Completed { message_id } => {
                self.automations
                    .increment_counter(rule.id, AutomationCounter::Sent)
                    .await?;
                info!(
                    automation_id = %rule.id,
                    execution_id = %execution.id,
                    message_id = %message_id,
                    "Automation message queued"
                );
                RuleOutcome::Completed {
                    execution_id: execution.id,
                    message_id,
                }
            }
            ExecutionOutcome::Skipped { reason } => {
                debug!(automation_id = %rule.id, email = %event.email, reason = %reason, "Automation skipped");
                RuleOutcome::Skipped {
                    execution_id: execution.id,
                    reason,
                }
            }
            ExecutionOutcome::Failed { reason } => {
                warn!(automation_id = %rule.id, execution_id = %execution.id, "Automation failed: {}", reason);
                RuleOutcome::Failed {
                    execution_id: execution.id,
                    reason,
                }
            }
        })
    }

    async fn render_and_enqueue(
        &self,
        rule: &AutomationRule,
        event: &TriggerEvent,
    ) -> Result<ExecutionOutcome> {
        let ctx = AutomationContext::from(rule);
        if let Eligibility::Rejected(reason) =
            self.gate.check(&event.email, event.user_id, Some(&ctx)).await?
        {
            return Ok(ExecutionOutcome::Skipped {
                reason: reason.to_string(),
            });
        }

        let Some(template) = self.templates.get(rule.template_id).await? else {
            return Ok(ExecutionOutcome::Failed {
                reason: format!("template {} not found", rule.template_id),
            });
        };

        let vars = TemplateVariables::from_event(event);
        let tracking_id = new_tracking_id();

        let html_body = template.html_content.as_deref().map(|html| {
            self.injector.prepare_email_for_tracking(
                &render(html, &vars),
                &tracking_id,
                &event.email,
                self.tracking_options,
            )
        });

        let mut metadata = MessageMetadata {
            tracking_id: Some(tracking_id.clone()),
            user_id: event.user_id,
            ..Default::default()
        };
        metadata.extra.insert(
            LIST_UNSUBSCRIBE_KEY.to_string(),
            self.injector
                .list_unsubscribe_header(&tracking_id, &event.email)
                .into(),
        );

        let message = NewMessage {
            to_address: event.email.clone(),
            subject: render(&template.subject, &vars),
            html_body,
            text_body: template.text_content.as_deref().map(|text| render(text, &vars)),
            automation_id: Some(rule.id),
            template_id: Some(template.id),
            priority: self.priority,
            metadata,
            ..Default::default()
        };

        match self.queue.enqueue(message).await {
            Ok(message_id) => Ok(ExecutionOutcome::Completed { message_id }),
            Err(e) => Ok(ExecutionOutcome::Failed {
                reason: e.to_string(),
            }),
        }
    }

    /// Run delayed executions whose time has come.
    ///
    /// Each due row is deleted first; only the caller whose delete succeeds
    /// runs it. A row whose replacement run cannot be recorded is put back.
    pub async fn process_scheduled_automations(&self, limit: i64) -> Result<ScheduledReport> {
        let due = self
            .automations
            .due_pending_executions(self.clock.now(), limit)
            .await?;
        let mut report = ScheduledReport {
            due: due.len(),
            ..Default::default()
        };

        for execution in due {
            if !self.automations.delete_pending_execution(execution.id).await? {
                report.lost += 1;
                continue;
            }

            let rule = match self.automations.get_rule(execution.automation_id).await? {
                Some(rule) if rule.is_active => rule,
                _ => {
                    debug!(
                        automation_id = %execution.automation_id,
                        execution_id = %execution.id,
                        "Dropping delayed execution for missing or inactive rule"
                    );
                    report.dropped += 1;
                    continue;
                }
            };

            let event = execution.trigger_data.0.clone();
            let started = match self.start_execution(&rule, &event).await {
                Ok(started) => started,
                Err(e) => {
                    error!(execution_id = %execution.id, "Delayed automation could not start: {}", e);
                    report.errors += 1;
                    if self.restore_placeholder(&execution).await {
                        report.restored += 1;
                    }
                    continue;
                }
            };

            match self.run_execution(&rule, event, started).await {
                Ok(_) => report.executed += 1,
                Err(e) => {
                    error!(execution_id = %execution.id, "Delayed automation failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                executed = report.executed,
                dropped = report.dropped,
                restored = report.restored,
                "Processed scheduled automations"
            );
        }
        Ok(report)
    }

    /// Re-create a deleted placeholder so the next sweep picks it up again
    async fn restore_placeholder(&self, execution: &AutomationExecution) -> bool {
        let restored = self
            .automations
            .create_execution(
                NewExecution {
                    automation_id: execution.automation_id,
                    event: execution.trigger_data.0.clone(),
                    status: ExecutionStatus::Pending,
                    scheduled_for: execution.scheduled_for,
                },
                self.clock.now(),
            )
            .await;
        match restored {
            Ok(placeholder) => {
                warn!(
                    automation_id = %execution.automation_id,
                    execution_id = %placeholder.id,
                    "Restored delayed automation"
                );
                true
            }
            Err(e) => {
                error!(
                    automation_id = %execution.automation_id,
                    email = %execution.email,
                    "Delayed automation lost: {}",
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use async_trait::async_trait;
    use chrono::Duration;
    use mailpipe_common::config::QueueConfig;
    use mailpipe_common::types::UserId;
    use mailpipe_common::ManualClock;
    use mailpipe_storage::models::{
        MessageStatus, NewAutomationRule, NewSubscriber, NewTemplate, SubscriberStatus,
        TriggerConditions,
    };
    use mailpipe_storage::{MemoryStore, Repositories};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    /// Automation store that rejects new processing executions while `down` is set
    struct ExecutionsDown {
        inner: MemoryStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl AutomationRepository for ExecutionsDown {
        async fn create_rule(&self, input: NewAutomationRule) -> Result<AutomationRule> {
            self.inner.create_rule(input).await
        }

        async fn get_rule(&self, id: AutomationId) -> Result<Option<AutomationRule>> {
            self.inner.get_rule(id).await
        }

        async fn list_active_rules(&self, trigger: TriggerType) -> Result<Vec<AutomationRule>> {
            self.inner.list_active_rules(trigger).await
        }

        async fn set_rule_active(&self, id: AutomationId, active: bool) -> Result<()> {
            self.inner.set_rule_active(id, active).await
        }

        async fn increment_counter(&self, id: AutomationId, counter: AutomationCounter) -> Result<()> {
            AutomationRepository::increment_counter(&self.inner, id, counter).await
        }

        async fn create_execution(
            &self,
            input: NewExecution,
            now: DateTime<Utc>,
        ) -> Result<AutomationExecution> {
            if input.status == ExecutionStatus::Processing && self.down.load(Ordering::SeqCst) {
                return Err(Error::Database("connection refused".into()));
            }
            self.inner.create_execution(input, now).await
        }

        async fn get_execution(&self, id: ExecutionId) -> Result<Option<AutomationExecution>> {
            self.inner.get_execution(id).await
        }

        async fn finish_execution(
            &self,
            id: ExecutionId,
            outcome: &ExecutionOutcome,
            now: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.finish_execution(id, outcome, now).await
        }

        async fn due_pending_executions(
            &self,
            now: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<AutomationExecution>> {
            self.inner.due_pending_executions(now, limit).await
        }

        async fn delete_pending_execution(&self, id: ExecutionId) -> Result<bool> {
            self.inner.delete_pending_execution(id).await
        }

        async fn count_completed(&self, automation_id: AutomationId, user_id: UserId) -> Result<i64> {
            self.inner.count_completed(automation_id, user_id).await
        }

        async fn last_completed_at(
            &self,
            automation_id: AutomationId,
            user_id: UserId,
        ) -> Result<Option<DateTime<Utc>>> {
            self.inner.last_completed_at(automation_id, user_id).await
        }
    }

    struct Fixture {
        store: MemoryStore,
        repos: Repositories,
        clock: ManualClock,
        engine: AutomationEngine,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        fixture_with(store.clone(), Repositories::memory(store))
    }

    fn fixture_with(store: MemoryStore, repos: Repositories) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let gate = EligibilityGate::new(
            repos.subscribers.clone(),
            repos.automations.clone(),
            shared_clock.clone(),
        );
        let queue = MessageQueue::new(
            repos.messages.clone(),
            gate.clone(),
            shared_clock.clone(),
            Metrics::new().unwrap(),
            QueueConfig::default(),
        );
        let engine = AutomationEngine::new(
            repos.automations.clone(),
            repos.templates.clone(),
            queue,
            gate,
            TrackingInjector::new("https://t.example.com", None),
            TrackingOptions::default(),
            shared_clock,
            5,
        );
        Fixture {
            store,
            repos,
            clock,
            engine,
        }
    }

    async fn rule(fx: &Fixture, trigger: TriggerType, conditions: TriggerConditions) -> AutomationRule {
        let template = fx
            .repos
            .templates
            .create(NewTemplate {
                name: "t".into(),
                subject: "Hi {{first_name}}".into(),
                html_content: Some(
                    r#"<html><body><a href="https://shop.example.com/cart">Cart {{cart_total}}</a></body></html>"#
                        .into(),
                ),
                text_content: Some("Cart {{cart_total}}".into()),
            })
            .await
            .unwrap();
        fx.repos
            .automations
            .create_rule(NewAutomationRule {
                name: format!("{} rule", trigger),
                trigger_type: trigger,
                trigger_conditions: conditions,
                template_id: template.id,
                is_active: true,
                priority: 0,
                send_limit_per_user: None,
                cooldown_days: None,
            })
            .await
            .unwrap()
    }

    fn cart_event(total: f64) -> TriggerEvent {
        TriggerEvent::new("ann@example.com")
            .with_user(Uuid::nil())
            .with_name("Ann Smith")
            .with_field("cart_total", total)
    }

    #[tokio::test]
    async fn test_abandoned_cart_renders_and_queues() {
        let fx = fixture();
        let rule = rule(
            &fx,
            TriggerType::AbandonedCart,
            TriggerConditions {
                min_cart_value: Some(50.0),
                ..Default::default()
            },
        )
        .await;

        let report = fx
            .engine
            .trigger_automation(TriggerType::AbandonedCart, cart_event(75.0))
            .await
            .unwrap();
        assert_eq!(report.rules.len(), 1);
        assert!(matches!(report.rules[0].outcome, RuleOutcome::Completed { .. }));

        let messages = fx.store.messages();
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.subject, "Hi Ann");
        assert_eq!(message.text_body.as_deref(), Some("Cart 75.0"));
        assert_eq!(message.priority, 5);
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.automation_id, Some(rule.id));
        let html = message.html_body.as_deref().unwrap();
        assert!(html.contains("/track/click/"));
        assert!(html.contains("/track/open/"));
        assert!(message.tracking_id().is_some());

        let rule = fx.repos.automations.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(rule.total_sent, 1);

        let executions = fx.store.executions();
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
        assert_eq!(executions[0].queued_message_id, Some(message.id));
    }

    #[tokio::test]
    async fn test_cart_below_minimum_creates_no_execution() {
        let fx = fixture();
        rule(
            &fx,
            TriggerType::AbandonedCart,
            TriggerConditions {
                min_cart_value: Some(50.0),
                ..Default::default()
            },
        )
        .await;

        let report = fx
            .engine
            .trigger_automation(TriggerType::AbandonedCart, cart_event(20.0))
            .await
            .unwrap();
        assert!(matches!(
            report.rules[0].outcome,
            RuleOutcome::ConditionsNotMet { .. }
        ));
        assert!(fx.store.executions().is_empty());
        assert!(fx.store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_ineligible_recipient_is_skipped() {
        let fx = fixture();
        rule(&fx, TriggerType::Welcome, TriggerConditions::default()).await;
        fx.repos
            .subscribers
            .upsert(
                NewSubscriber {
                    email: "ann@example.com".into(),
                    ..Default::default()
                },
                fx.clock.now(),
            )
            .await
            .unwrap();
        fx.repos
            .subscribers
            .set_status("ann@example.com", SubscriberStatus::Unsubscribed, fx.clock.now())
            .await
            .unwrap();

        let report = fx
            .engine
            .trigger_automation(TriggerType::Welcome, cart_event(0.0))
            .await
            .unwrap();
        match &report.rules[0].outcome {
            RuleOutcome::Skipped { reason, .. } => assert_eq!(reason, "unsubscribed"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fx.store.executions()[0].status, ExecutionStatus::Skipped);
        assert!(fx.store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_missing_template_fails_execution() {
        let fx = fixture();
        fx.repos
            .automations
            .create_rule(NewAutomationRule {
                name: "broken".into(),
                trigger_type: TriggerType::Welcome,
                trigger_conditions: TriggerConditions::default(),
                template_id: Uuid::now_v7(),
                is_active: true,
                priority: 0,
                send_limit_per_user: None,
                cooldown_days: None,
            })
            .await
            .unwrap();

        let report = fx
            .engine
            .trigger_automation(TriggerType::Welcome, cart_event(0.0))
            .await
            .unwrap();
        assert!(matches!(report.rules[0].outcome, RuleOutcome::Failed { .. }));
        assert_eq!(fx.store.executions()[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_delayed_rule_runs_once_when_due() {
        let fx = fixture();
        let rule = rule(
            &fx,
            TriggerType::OrderDelivered,
            TriggerConditions {
                delay_hours: 24,
                ..Default::default()
            },
        )
        .await;

        let report = fx
            .engine
            .trigger_automation(TriggerType::OrderDelivered, cart_event(0.0))
            .await
            .unwrap();
        assert!(matches!(report.rules[0].outcome, RuleOutcome::Scheduled { .. }));
        assert!(fx.store.messages().is_empty());

        // Not due yet
        let sweep = fx.engine.process_scheduled_automations(100).await.unwrap();
        assert_eq!(sweep.due, 0);

        fx.clock.advance(Duration::hours(25));
        let sweep = fx.engine.process_scheduled_automations(100).await.unwrap();
        assert_eq!((sweep.due, sweep.executed), (1, 1));
        assert_eq!(fx.store.messages().len(), 1);

        let again = fx.engine.process_scheduled_automations(100).await.unwrap();
        assert_eq!(again.due, 0);
        assert_eq!(fx.store.messages().len(), 1);

        let rule = fx.repos.automations.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(rule.total_sent, 1);
    }

    #[tokio::test]
    async fn test_delayed_execution_dropped_when_rule_deactivated() {
        let fx = fixture();
        let rule = rule(
            &fx,
            TriggerType::ReviewRequest,
            TriggerConditions {
                delay_hours: 2,
                ..Default::default()
            },
        )
        .await;
        fx.engine
            .trigger_automation(TriggerType::ReviewRequest, cart_event(0.0))
            .await
            .unwrap();
        fx.repos.automations.set_rule_active(rule.id, false).await.unwrap();

        fx.clock.advance(Duration::hours(3));
        let sweep = fx.engine.process_scheduled_automations(100).await.unwrap();
        assert_eq!((sweep.due, sweep.dropped, sweep.executed), (1, 1, 0));
        assert!(fx.store.messages().is_empty());
        assert!(fx.store.executions().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_delay_is_a_rule_error() {
        let fx = fixture();
        rule(
            &fx,
            TriggerType::OrderDelivered,
            TriggerConditions {
                delay_hours: i64::MAX,
                ..Default::default()
            },
        )
        .await;

        let report = fx
            .engine
            .trigger_automation(TriggerType::OrderDelivered, cart_event(0.0))
            .await
            .unwrap();
        match &report.rules[0].outcome {
            RuleOutcome::Error { reason } => assert!(reason.contains("delay_hours")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(fx.store.executions().is_empty());
    }

    #[tokio::test]
    async fn test_delayed_execution_restored_when_run_cannot_start() {
        let store = MemoryStore::new();
        let flaky = Arc::new(ExecutionsDown {
            inner: store.clone(),
            down: AtomicBool::new(true),
        });
        let mut repos = Repositories::memory(store.clone());
        repos.automations = flaky.clone();
        let fx = fixture_with(store, repos);
        rule(
            &fx,
            TriggerType::OrderDelivered,
            TriggerConditions {
                delay_hours: 2,
                ..Default::default()
            },
        )
        .await;
        fx.engine
            .trigger_automation(TriggerType::OrderDelivered, cart_event(0.0))
            .await
            .unwrap();
        let scheduled_for = fx.store.executions()[0].scheduled_for;

        fx.clock.advance(Duration::hours(3));
        let sweep = fx.engine.process_scheduled_automations(100).await.unwrap();
        assert_eq!((sweep.due, sweep.errors, sweep.restored), (1, 1, 1));
        assert_eq!(sweep.executed, 0);

        let executions = fx.store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Pending);
        assert_eq!(executions[0].scheduled_for, scheduled_for);
        assert!(fx.store.messages().is_empty());

        flaky.down.store(false, Ordering::SeqCst);
        let sweep = fx.engine.process_scheduled_automations(100).await.unwrap();
        assert_eq!((sweep.due, sweep.executed), (1, 1));
        assert_eq!(fx.store.messages().len(), 1);
        assert_eq!(fx.store.executions()[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_event_email_is_rejected() {
        let fx = fixture();
        let err = fx
            .engine
            .trigger_automation(TriggerType::Welcome, TriggerEvent::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
