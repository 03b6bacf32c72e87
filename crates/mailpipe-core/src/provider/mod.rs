//! Email provider adapters
//!
//! The queue worker hands each claimed message to an [`EmailProvider`]. Errors
//! are classified so the worker can decide between retrying, failing the
//! message, or failing it without consuming an attempt.

mod http;
mod smtp;

pub use http::HttpProvider;
pub use smtp::SmtpProvider;

use async_trait::async_trait;
use mailpipe_common::config::{ProviderConfig, ProviderKind};
use mailpipe_common::types::MessageId;
use std::sync::Arc;
use thiserror::Error;

/// Fully rendered message ready for hand-off
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub message_id: MessageId,
    pub to: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    /// Value for the `List-Unsubscribe` header
    pub list_unsubscribe: Option<String>,
}

/// Provider acceptance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub provider_message_id: Option<String>,
}

/// Provider failure classes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Worth retrying later (network, timeout, throttling, 5xx)
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The recipient or message was rejected
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// Credentials or endpoint misconfigured; retrying cannot help
    #[error("provider configuration error: {0}")]
    Configuration(String),
}

impl From<ProviderError> for mailpipe_common::Error {
    fn from(e: ProviderError) -> Self {
        mailpipe_common::Error::Provider(e.to_string())
    }
}

/// Outbound email provider
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, ProviderError>;

    fn name(&self) -> &'static str;

    /// Cheap reachability probe used by the detailed health endpoint
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Build the configured provider
pub fn build_provider(config: &ProviderConfig) -> Arc<dyn EmailProvider> {
    match config.kind {
        ProviderKind::Http => Arc::new(HttpProvider::new(config.clone())),
        ProviderKind::Smtp => Arc::new(SmtpProvider::new(config.clone())),
    }
}
