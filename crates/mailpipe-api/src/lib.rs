//! Mailpipe API - HTTP surface of the delivery pipeline
//!
//! Transactional sends, event intake, campaign controls, the cron trigger,
//! recipient-facing tracking endpoints and provider webhooks.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
