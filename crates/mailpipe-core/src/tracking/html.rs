//! Tracking injection into HTML bodies

use super::signing::sign_hex;
use mailpipe_common::config::{ServerConfig, TrackingConfig};
use mailpipe_common::types::normalize_email;
use regex::{Captures, Regex};
use reqwest::Url;
use std::sync::OnceLock;

fn href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("href pattern is valid")
    })
}

/// Which tracking pieces to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingOptions {
    pub track_opens: bool,
    pub track_clicks: bool,
    pub include_unsubscribe: bool,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            track_opens: true,
            track_clicks: true,
            include_unsubscribe: true,
        }
    }
}

impl From<&TrackingConfig> for TrackingOptions {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            track_opens: config.track_opens,
            track_clicks: config.track_clicks,
            include_unsubscribe: config.include_unsubscribe,
        }
    }
}

/// Fresh tracking id for one message
pub fn new_tracking_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Payload covered by an unsubscribe signature
pub fn unsubscribe_payload(tracking_id: &str, email: &str) -> String {
    format!("{}:{}", tracking_id, normalize_email(email))
}

/// Payload covered by a click signature
pub fn click_payload(tracking_id: &str, target: &str) -> String {
    format!("{}:{}", tracking_id, target)
}

/// Builds tracking URLs and rewrites HTML
#[derive(Debug, Clone)]
pub struct TrackingInjector {
    base_url: String,
    secret: Option<String>,
}

impl TrackingInjector {
    pub fn new(base_url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn from_config(tracking: &TrackingConfig, server: &ServerConfig) -> Self {
        Self::new(tracking.resolved_base_url(server), tracking.secret.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_with_params(&self, path: &str, params: &[(&str, &str)]) -> String {
        let raw = format!("{}{}", self.base_url, path);
        match Url::parse_with_params(&raw, params) {
            Ok(url) => url.to_string(),
            Err(_) => {
                let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                format!("{}?{}", raw, query.join("&"))
            }
        }
    }

    pub fn open_url(&self, tracking_id: &str) -> String {
        format!("{}/track/open/{}", self.base_url, tracking_id)
    }

    /// `{base}/track/click/{id}?url=..&lid=..[&s=..]`; signed when a secret is configured
    pub fn click_url(&self, tracking_id: &str, target: &str, link_id: usize) -> String {
        let lid = link_id.to_string();
        let path = format!("/track/click/{}", tracking_id);
        match &self.secret {
            Some(secret) => {
                let signature = sign_hex(secret, click_payload(tracking_id, target).as_bytes());
                self.url_with_params(&path, &[("url", target), ("lid", &lid), ("s", &signature)])
            }
            None => self.url_with_params(&path, &[("url", target), ("lid", &lid)]),
        }
    }

    /// `{base}/unsubscribe?t=..&e=..[&s=..]`; signed when a secret is configured
    pub fn unsubscribe_url(&self, tracking_id: &str, email: &str) -> String {
        let email = normalize_email(email);
        match &self.secret {
            Some(secret) => {
                let signature = sign_hex(secret, unsubscribe_payload(tracking_id, &email).as_bytes());
                self.url_with_params(
                    "/unsubscribe",
                    &[("t", tracking_id), ("e", &email), ("s", &signature)],
                )
            }
            None => self.url_with_params("/unsubscribe", &[("t", tracking_id), ("e", &email)]),
        }
    }

    /// Value for the `List-Unsubscribe` header
    pub fn list_unsubscribe_header(&self, tracking_id: &str, email: &str) -> String {
        format!("<{}>", self.unsubscribe_url(tracking_id, email))
    }

    /// Rewrite links, append the unsubscribe footer and the open pixel
    pub fn prepare_email_for_tracking(
        &self,
        html: &str,
        tracking_id: &str,
        email: &str,
        options: TrackingOptions,
    ) -> String {
        let mut html = if options.track_clicks {
            self.rewrite_links(html, tracking_id)
        } else {
            html.to_string()
        };

        let mut tail = String::new();
        if options.include_unsubscribe {
            tail.push_str(&format!(
                r#"<div style="margin-top:24px;font-size:12px;color:#888888;text-align:center"><a href="{}" style="color:#888888">Unsubscribe</a></div>"#,
                self.unsubscribe_url(tracking_id, email)
            ));
        }
        if options.track_opens {
            tail.push_str(&format!(
                r#"<img src="{}" width="1" height="1" alt="" style="display:none" />"#,
                self.open_url(tracking_id)
            ));
        }

        if !tail.is_empty() {
            match html.to_ascii_lowercase().rfind("</body>") {
                Some(idx) => html.insert_str(idx, &tail),
                None => html.push_str(&tail),
            }
        }
        html
    }

    fn rewrite_links(&self, html: &str, tracking_id: &str) -> String {
        let mut link_id = 0usize;
        let tracking_prefix = format!("{}/track/", self.base_url);

        href_regex()
            .replace_all(html, |caps: &Captures| {
                let (raw, quote) = match (caps.get(1), caps.get(2)) {
                    (Some(m), _) => (m.as_str(), '"'),
                    (None, Some(m)) => (m.as_str(), '\''),
                    (None, None) => return caps[0].to_string(),
                };
                let target = raw.trim().replace("&amp;", "&");

                if should_skip(&target) || target.starts_with(&tracking_prefix) {
                    return caps[0].to_string();
                }

                let url = self.click_url(tracking_id, &target, link_id);
                link_id += 1;
                format!("href={quote}{url}{quote}")
            })
            .into_owned()
    }
}

fn should_skip(target: &str) -> bool {
    let lower = target.to_ascii_lowercase();
    target.is_empty()
        || target.starts_with('#')
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.contains("unsubscribe")
        || target.contains("{{")
}
