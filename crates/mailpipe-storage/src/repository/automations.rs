//! Automation rule and execution repository

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use crate::models::{
    AutomationCounter, AutomationExecution, AutomationRule, ExecutionOutcome, ExecutionStatus,
    NewAutomationRule, NewExecution, TriggerType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailpipe_common::types::{AutomationId, ExecutionId, UserId};
use mailpipe_common::{Error, Result};
use sqlx::types::Json;
use uuid::Uuid;

/// Automation repository trait
#[async_trait]
pub trait AutomationRepository: Send + Sync {
    async fn create_rule(&self, input: NewAutomationRule) -> Result<AutomationRule>;

    async fn get_rule(&self, id: AutomationId) -> Result<Option<AutomationRule>>;

    /// Active rules for a trigger, highest priority first
    async fn list_active_rules(&self, trigger: TriggerType) -> Result<Vec<AutomationRule>>;

    async fn set_rule_active(&self, id: AutomationId, active: bool) -> Result<()>;

    async fn increment_counter(&self, id: AutomationId, counter: AutomationCounter) -> Result<()>;

    async fn create_execution(
        &self,
        input: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<AutomationExecution>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<AutomationExecution>>;

    async fn finish_execution(
        &self,
        id: ExecutionId,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Pending executions whose `scheduled_for` has passed, oldest first
    async fn due_pending_executions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AutomationExecution>>;

    /// Delete a pending execution; false when another caller got there first
    async fn delete_pending_execution(&self, id: ExecutionId) -> Result<bool>;

    async fn count_completed(&self, automation_id: AutomationId, user_id: UserId) -> Result<i64>;

    async fn last_completed_at(
        &self,
        automation_id: AutomationId,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>>;
}

fn build_rule(input: NewAutomationRule, now: DateTime<Utc>) -> AutomationRule {
    AutomationRule {
        id: Uuid::now_v7(),
        name: input.name,
        trigger_type: input.trigger_type,
        trigger_conditions: Json(input.trigger_conditions),
        template_id: input.template_id,
        is_active: input.is_active,
        priority: input.priority,
        send_limit_per_user: input.send_limit_per_user,
        cooldown_days: input.cooldown_days,
        total_sent: 0,
        total_opened: 0,
        total_clicked: 0,
        created_at: now,
        updated_at: now,
    }
}

fn build_execution(input: NewExecution, now: DateTime<Utc>) -> AutomationExecution {
    AutomationExecution {
        id: Uuid::now_v7(),
        automation_id: input.automation_id,
        user_id: input.event.user_id,
        email: input.event.email.clone(),
        trigger_data: Json(input.event),
        status: input.status,
        skip_reason: None,
        queued_message_id: None,
        scheduled_for: input.scheduled_for,
        executed_at: None,
        created_at: now,
    }
}

fn outcome_parts(outcome: &ExecutionOutcome) -> (Option<&str>, Option<Uuid>) {
    match outcome {
        ExecutionOutcome::Completed { message_id } => (None, Some(*message_id)),
        ExecutionOutcome::Skipped { reason } | ExecutionOutcome::Failed { reason } => {
            (Some(reason.as_str()), None)
        }
    }
}

/// Database automation repository
pub struct DbAutomationRepository {
    pool: DatabasePool,
}

impl DbAutomationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutomationRepository for DbAutomationRepository {
    async fn create_rule(&self, input: NewAutomationRule) -> Result<AutomationRule> {
        let rule = build_rule(input, Utc::now());

        sqlx::query_as::<_, AutomationRule>(
            r#"
            INSERT INTO automation_rules (
                id, name, trigger_type, trigger_conditions, template_id, is_active, priority,
                send_limit_per_user, cooldown_days, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING *
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.trigger_type.as_str())
        .bind(&rule.trigger_conditions)
        .bind(rule.template_id)
        .bind(rule.is_active)
        .bind(rule.priority)
        .bind(rule.send_limit_per_user)
        .bind(rule.cooldown_days)
        .bind(rule.created_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_rule(&self, id: AutomationId) -> Result<Option<AutomationRule>> {
        sqlx::query_as::<_, AutomationRule>("SELECT * FROM automation_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_active_rules(&self, trigger: TriggerType) -> Result<Vec<AutomationRule>> {
        sqlx::query_as::<_, AutomationRule>(
            r#"
            SELECT * FROM automation_rules
            WHERE trigger_type = $1 AND is_active = TRUE
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .bind(trigger.as_str())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn set_rule_active(&self, id: AutomationId, active: bool) -> Result<()> {
        sqlx::query("UPDATE automation_rules SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn increment_counter(&self, id: AutomationId, counter: AutomationCounter) -> Result<()> {
        let column = counter.column();
        let sql = format!(
            "UPDATE automation_rules SET {column} = {column} + 1, updated_at = NOW() WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn create_execution(
        &self,
        input: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<AutomationExecution> {
        let execution = build_execution(input, now);

        sqlx::query_as::<_, AutomationExecution>(
            r#"
            INSERT INTO automation_executions (
                id, automation_id, user_id, email, trigger_data, status, scheduled_for, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(execution.id)
        .bind(execution.automation_id)
        .bind(execution.user_id)
        .bind(&execution.email)
        .bind(&execution.trigger_data)
        .bind(execution.status.as_str())
        .bind(execution.scheduled_for)
        .bind(execution.created_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<AutomationExecution>> {
        sqlx::query_as::<_, AutomationExecution>(
            "SELECT * FROM automation_executions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn finish_execution(
        &self,
        id: ExecutionId,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (reason, message_id) = outcome_parts(outcome);

        let result = sqlx::query(
            r#"
            UPDATE automation_executions SET
                status = $2,
                skip_reason = $3,
                queued_message_id = $4,
                executed_at = $5
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(outcome.status().as_str())
        .bind(reason)
        .bind(message_id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidTransition(format!(
                "execution {} is not processing",
                id
            )));
        }
        Ok(())
    }

    async fn due_pending_executions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AutomationExecution>> {
        sqlx::query_as::<_, AutomationExecution>(
            r#"
            SELECT * FROM automation_executions
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn delete_pending_execution(&self, id: ExecutionId) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM automation_executions WHERE id = $1 AND status = 'pending'")
                .bind(id)
                .execute(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_completed(&self, automation_id: AutomationId, user_id: UserId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM automation_executions
            WHERE automation_id = $1 AND user_id = $2 AND status = 'completed'
            "#,
        )
        .bind(automation_id)
        .bind(user_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }

    async fn last_completed_at(
        &self,
        automation_id: AutomationId,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MAX(COALESCE(executed_at, created_at)) FROM automation_executions
            WHERE automation_id = $1 AND user_id = $2 AND status = 'completed'
            "#,
        )
        .bind(automation_id)
        .bind(user_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.0)
    }
}

#[async_trait]
impl AutomationRepository for MemoryStore {
    async fn create_rule(&self, input: NewAutomationRule) -> Result<AutomationRule> {
        let rule = build_rule(input, Utc::now());
        self.state().rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn get_rule(&self, id: AutomationId) -> Result<Option<AutomationRule>> {
        Ok(self.state().rules.get(&id).cloned())
    }

    async fn list_active_rules(&self, trigger: TriggerType) -> Result<Vec<AutomationRule>> {
        let mut rules: Vec<_> = self
            .state()
            .rules
            .values()
            .filter(|r| r.trigger_type == trigger && r.is_active)
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(rules)
    }

    async fn set_rule_active(&self, id: AutomationId, active: bool) -> Result<()> {
        if let Some(rule) = self.state().rules.get_mut(&id) {
            rule.is_active = active;
            rule.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn increment_counter(&self, id: AutomationId, counter: AutomationCounter) -> Result<()> {
        if let Some(rule) = self.state().rules.get_mut(&id) {
            match counter {
                AutomationCounter::Sent => rule.total_sent += 1,
                AutomationCounter::Opened => rule.total_opened += 1,
                AutomationCounter::Clicked => rule.total_clicked += 1,
            }
        }
        Ok(())
    }

    async fn create_execution(
        &self,
        input: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<AutomationExecution> {
        let execution = build_execution(input, now);
        self.state()
            .executions
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<AutomationExecution>> {
        Ok(self.state().executions.get(&id).cloned())
    }

    async fn finish_execution(
        &self,
        id: ExecutionId,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("execution {}", id)))?;

        execution.status = execution.status.transition(outcome.status())?;
        let (reason, message_id) = outcome_parts(outcome);
        execution.skip_reason = reason.map(str::to_string);
        execution.queued_message_id = message_id;
        execution.executed_at = Some(now);
        Ok(())
    }

    async fn due_pending_executions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AutomationExecution>> {
        let mut due: Vec<_> = self
            .state()
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Pending && e.scheduled_for.map_or(false, |t| t <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.scheduled_for, e.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn delete_pending_execution(&self, id: ExecutionId) -> Result<bool> {
        let mut state = self.state();
        match state.executions.get(&id) {
            Some(e) if e.status == ExecutionStatus::Pending => {
                state.executions.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_completed(&self, automation_id: AutomationId, user_id: UserId) -> Result<i64> {
        Ok(self
            .state()
            .executions
            .values()
            .filter(|e| {
                e.automation_id == automation_id
                    && e.user_id == Some(user_id)
                    && e.status == ExecutionStatus::Completed
            })
            .count() as i64)
    }

    async fn last_completed_at(
        &self,
        automation_id: AutomationId,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state()
            .executions
            .values()
            .filter(|e| {
                e.automation_id == automation_id
                    && e.user_id == Some(user_id)
                    && e.status == ExecutionStatus::Completed
            })
            .map(|e| e.executed_at.unwrap_or(e.created_at))
            .max())
    }
}
