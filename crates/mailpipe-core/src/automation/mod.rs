//! Event-driven automations (welcome, abandoned cart, order lifecycle, ...)

pub mod conditions;
mod engine;

pub use conditions::ConditionOutcome;
pub use engine::{AutomationEngine, RuleOutcome, RuleReport, ScheduledReport, TriggerReport};
