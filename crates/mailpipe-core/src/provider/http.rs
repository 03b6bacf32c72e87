//! HTTP email API provider (JSON POST with a bearer key)

use super::{EmailProvider, OutboundEmail, ProviderError, SentEmail};
use async_trait::async_trait;
use mailpipe_common::config::ProviderConfig;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: Sender<'a>,
    to: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<&'static str, &'a str>,
    /// Lets the provider deduplicate resubmissions
    idempotency_key: String,
}

#[derive(Debug, Serialize)]
struct Sender<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

/// HTTP email API provider
pub struct HttpProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn endpoint(&self) -> Result<(String, &str), ProviderError> {
        let url = self
            .config
            .api_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ProviderError::Configuration("provider.api_url is not set".into()))?;
        let key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::Configuration("provider.api_key is not set".into()))?;
        Ok((format!("{}/send", url.trim_end_matches('/')), key))
    }
}

/// Map a non-success status to a failure class
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{}: {}", status, body.trim());
    match status.as_u16() {
        401 | 403 => ProviderError::Configuration(detail),
        408 | 429 => ProviderError::Transient(detail),
        s if s >= 500 => ProviderError::Transient(detail),
        _ => ProviderError::Permanent(detail),
    }
}

#[async_trait]
impl EmailProvider for HttpProvider {
    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, ProviderError> {
        let (url, key) = self.endpoint()?;

        let mut headers = BTreeMap::new();
        if let Some(value) = email.list_unsubscribe.as_deref() {
            headers.insert("List-Unsubscribe", value);
        }

        let request = SendRequest {
            from: Sender {
                email: &email.from_address,
                name: email.from_name.as_deref(),
            },
            to: [email.to.as_str()],
            reply_to: email.reply_to.as_deref(),
            subject: &email.subject,
            html: email.html_body.as_deref(),
            text: email.text_body.as_deref(),
            headers,
            idempotency_key: email.message_id.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let header_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let body_id = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
            v.get("id")
                .or_else(|| v.get("message_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        debug!(message_id = %email.message_id, status = %status, "Provider accepted message");
        Ok(SentEmail {
            provider_message_id: body_id.or(header_id),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        self.endpoint().map(|_| ())
    }
}
