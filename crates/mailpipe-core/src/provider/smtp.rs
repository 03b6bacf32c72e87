//! SMTP relay provider

use super::{EmailProvider, OutboundEmail, ProviderError, SentEmail};
use async_trait::async_trait;
use lettre::{
    address::Address,
    message::{
        header::{ContentType, Header, HeaderName, HeaderValue},
        Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailpipe_common::config::ProviderConfig;
use std::time::Duration;
use tracing::debug;

/// `List-Unsubscribe` header
#[derive(Debug, Clone)]
struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// SMTP relay provider
pub struct SmtpProvider {
    config: ProviderConfig,
}

impl SmtpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, email: &OutboundEmail) -> Result<(Message, String), ProviderError> {
        let from_address: Address = email
            .from_address
            .parse()
            .map_err(|e| ProviderError::Configuration(format!("Invalid from address: {}", e)))?;
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| ProviderError::Permanent(format!("Invalid to address: {}", e)))?;

        let message_id = format!("<{}@mailpipe>", email.message_id);

        let mut builder = Message::builder()
            .from(Mailbox::new(email.from_name.clone(), from_address))
            .to(to)
            .subject(&email.subject)
            .message_id(Some(message_id.clone()));

        if let Some(reply_to) = &email.reply_to {
            let mailbox: Mailbox = reply_to
                .parse()
                .map_err(|e| ProviderError::Configuration(format!("Invalid reply-to: {}", e)))?;
            builder = builder.reply_to(mailbox);
        }

        if let Some(value) = &email.list_unsubscribe {
            builder = builder.header(ListUnsubscribe(value.clone()));
        }

        let message = match (&email.html_body, &email.text_body) {
            (Some(html), Some(text)) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(text.clone()))
                    .singlepart(SinglePart::html(html.clone())),
            ),
            (Some(html), None) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
            (None, Some(text)) => builder.header(ContentType::TEXT_PLAIN).body(text.clone()),
            (None, None) => builder.body(String::new()),
        }
        .map_err(|e| ProviderError::Permanent(format!("Failed to build email: {}", e)))?;

        Ok((message, message_id))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, ProviderError> {
        let config = &self.config;
        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| ProviderError::Configuration(format!("SMTP relay: {}", e)))?
        } else if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| ProviderError::Configuration(format!("SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        let mut builder = builder.port(config.smtp_port);

        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder
            .timeout(Some(Duration::from_secs(config.timeout_secs)))
            .build())
    }
}

/// Map an SMTP error to a failure class
fn classify_smtp_error(e: &lettre::transport::smtp::Error) -> ProviderError {
    let detail = e.to_string();
    let code = e.status().map(|c| c.to_string());

    // Authentication failures
    if matches!(code.as_deref(), Some("530") | Some("535")) {
        return ProviderError::Configuration(detail);
    }
    if e.is_permanent() {
        ProviderError::Permanent(detail)
    } else {
        ProviderError::Transient(detail)
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, ProviderError> {
        let (message, message_id) = self.build_message(email)?;
        let mailer = self.transport()?;

        match mailer.send(message).await {
            Ok(response) => {
                debug!(message_id = %email.message_id, code = %response.code(), "SMTP relay accepted message");
                Ok(SentEmail {
                    provider_message_id: Some(message_id),
                })
            }
            Err(e) => Err(classify_smtp_error(&e)),
        }
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        match self.transport()?.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProviderError::Transient("SMTP relay did not respond".into())),
            Err(e) => Err(classify_smtp_error(&e)),
        }
    }
}
