//! API request handlers

pub mod automations;
pub mod campaigns;
pub mod cron;
pub mod health;
pub mod messages;
pub mod tracking;
pub mod webhooks;
