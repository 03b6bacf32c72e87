//! Trigger condition evaluation

use chrono::{DateTime, Utc};
use mailpipe_storage::models::{TriggerConditions, TriggerEvent, TriggerType};

/// Result of checking a rule's conditions against an event
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionOutcome {
    Met,
    NotMet(String),
}

impl ConditionOutcome {
    pub fn is_met(&self) -> bool {
        matches!(self, ConditionOutcome::Met)
    }
}

/// Check the trigger-specific conditions of a rule
pub fn evaluate(
    trigger: TriggerType,
    conditions: &TriggerConditions,
    event: &TriggerEvent,
    now: DateTime<Utc>,
) -> ConditionOutcome {
    match trigger {
        TriggerType::AbandonedCart => {
            minimum(event, "cart_total", conditions.min_cart_value, "cart total")
        }
        TriggerType::OrderPlaced => {
            minimum(event, "order_total", conditions.min_order_value, "order total")
        }
        TriggerType::InactiveUser => match conditions.inactive_days {
            Some(required) => match inactive_days(event, now) {
                Some(days) if days >= required => ConditionOutcome::Met,
                Some(days) => ConditionOutcome::NotMet(format!(
                    "inactive for {} days, need {}",
                    days, required
                )),
                None => ConditionOutcome::NotMet("inactivity unknown".into()),
            },
            None => ConditionOutcome::Met,
        },
        _ => ConditionOutcome::Met,
    }
}

fn minimum(event: &TriggerEvent, field: &str, min: Option<f64>, label: &str) -> ConditionOutcome {
    let Some(min) = min else {
        return ConditionOutcome::Met;
    };
    let value = event.number(field).unwrap_or(0.0);
    if value >= min {
        ConditionOutcome::Met
    } else {
        ConditionOutcome::NotMet(format!("{} {} below minimum {}", label, value, min))
    }
}

/// Days of inactivity: the `inactive_days` field, else days since `last_active_at`
fn inactive_days(event: &TriggerEvent, now: DateTime<Utc>) -> Option<i64> {
    if let Some(days) = event.number("inactive_days") {
        return Some(days.floor() as i64);
    }
    let last_active = event.fields.get("last_active_at")?.as_str()?;
    let last_active = DateTime::parse_from_rfc3339(last_active).ok()?;
    Some((now - last_active.with_timezone(&Utc)).num_days())
}
