//! Configuration for Mailpipe

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Outbound provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Queue worker configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Campaign fan-out configuration
    #[serde(default)]
    pub campaign: CampaignConfig,

    /// Open/click tracking configuration
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Cron orchestrator configuration
    #[serde(default)]
    pub cron: CronConfig,

    /// Data retention windows
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Externally reachable base URL, used in tracking links
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Key required on `/api/v1` requests (bearer or `X-API-Key`); open when unset
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            public_url: default_public_url(),
            api_key: None,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Which transport delivers outbound mail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Generic HTTP email API
    Http,
    /// SMTP relay
    Smtp,
}

/// Outbound provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    /// Base URL of the HTTP email API
    pub api_url: Option<String>,

    /// Bearer key for the HTTP email API
    pub api_key: Option<String>,

    /// SMTP relay host
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,

    /// SMTP relay port
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    pub smtp_username: Option<String>,

    pub smtp_password: Option<String>,

    /// Implicit TLS
    #[serde(default)]
    pub use_tls: bool,

    /// Upgrade with STARTTLS
    #[serde(default)]
    pub use_starttls: bool,

    /// Default sender address
    #[serde(default = "default_from_address")]
    pub from_address: String,

    /// Default sender display name
    pub from_name: Option<String>,

    /// Default Reply-To
    pub reply_to: Option<String>,

    /// Per-send timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// HMAC-SHA256 key for the `X-Webhook-Signature` header on provider webhooks
    pub webhook_secret: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            api_url: None,
            api_key: None,
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            use_tls: false,
            use_starttls: false,
            from_address: default_from_address(),
            from_name: None,
            reply_to: None,
            timeout_secs: default_provider_timeout(),
            webhook_secret: None,
        }
    }
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Smtp
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_from_address() -> String {
    "noreply@localhost.localdomain".to_string()
}

fn default_provider_timeout() -> u64 {
    30
}

/// Queue worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Messages claimed per processing run
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: i64,

    /// Concurrent provider calls within a run
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,

    /// Attempts granted to a new message
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Attempt ceiling below which the retry sweep revives failed messages
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: i32,

    #[serde(default = "default_transactional_priority")]
    pub transactional_priority: i32,

    #[serde(default = "default_automation_priority")]
    pub automation_priority: i32,

    #[serde(default)]
    pub campaign_priority: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_queue_batch_size(),
            concurrency: default_queue_concurrency(),
            max_attempts: default_max_attempts(),
            retry_ceiling: default_retry_ceiling(),
            transactional_priority: default_transactional_priority(),
            automation_priority: default_automation_priority(),
            campaign_priority: 0,
        }
    }
}

fn default_queue_batch_size() -> i64 {
    50
}

fn default_queue_concurrency() -> usize {
    1
}

fn default_max_attempts() -> i32 {
    3
}

fn default_retry_ceiling() -> i32 {
    3
}

fn default_transactional_priority() -> i32 {
    10
}

fn default_automation_priority() -> i32 {
    5
}

/// Campaign fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Rows per bulk insert
    #[serde(default = "default_campaign_batch_size")]
    pub batch_size: usize,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            batch_size: default_campaign_batch_size(),
        }
    }
}

fn default_campaign_batch_size() -> usize {
    100
}

/// Open/click tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Base URL for pixel, redirect and unsubscribe links; falls back to `server.public_url`
    pub base_url: Option<String>,

    /// HMAC key for signing click and unsubscribe links
    pub secret: Option<String>,

    #[serde(default = "default_true")]
    pub track_opens: bool,

    #[serde(default = "default_true")]
    pub track_clicks: bool,

    #[serde(default = "default_true")]
    pub include_unsubscribe: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            secret: None,
            track_opens: true,
            track_clicks: true,
            include_unsubscribe: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Cron orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Bearer token required by the HTTP cron trigger
    pub secret: Option<String>,

    /// Failed messages in the last hour that mark the pipeline degraded
    #[serde(default = "default_degraded_threshold")]
    pub degraded_failed_threshold: u64,

    /// Failed messages in the last hour that mark the pipeline critical
    #[serde(default = "default_critical_threshold")]
    pub critical_failed_threshold: u64,

    /// Messages carrying an error in the last hour that mark the pipeline degraded
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u64,

    /// Pending automation executions handled per run
    #[serde(default = "default_automation_batch")]
    pub automation_batch_size: i64,

    /// Complete A/B tests whose duration has elapsed
    #[serde(default = "default_true")]
    pub evaluate_ab_tests: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            secret: None,
            degraded_failed_threshold: default_degraded_threshold(),
            critical_failed_threshold: default_critical_threshold(),
            error_threshold: default_error_threshold(),
            automation_batch_size: default_automation_batch(),
            evaluate_ab_tests: true,
        }
    }
}

fn default_degraded_threshold() -> u64 {
    10
}

fn default_critical_threshold() -> u64 {
    50
}

fn default_error_threshold() -> u64 {
    25
}

fn default_automation_batch() -> i64 {
    100
}

/// Data retention windows in days
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_queue_retention")]
    pub queue_days: i64,

    #[serde(default = "default_tracking_retention")]
    pub tracking_days: i64,

    #[serde(default = "default_webhook_retention")]
    pub webhook_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            queue_days: default_queue_retention(),
            tracking_days: default_tracking_retention(),
            webhook_days: default_webhook_retention(),
        }
    }
}

fn default_queue_retention() -> i64 {
    30
}

fn default_tracking_retention() -> i64 {
    90
}

fn default_webhook_retention() -> i64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl TrackingConfig {
    /// Base URL for tracking links, without a trailing slash
    pub fn resolved_base_url(&self, server: &ServerConfig) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(&server.public_url)
            .trim_end_matches('/')
            .to_string()
    }
}

impl Config {
    /// Load configuration from a TOML file only
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from file (explicit or default locations) layered
    /// under `MAILPIPE__SECTION__KEY` environment variables
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = ::config::Config::builder();

        let candidates: Vec<PathBuf> = match path {
            Some(p) => vec![p.to_path_buf()],
            None => vec![
                PathBuf::from("./mailpipe.toml"),
                PathBuf::from("/etc/mailpipe/mailpipe.toml"),
            ],
        };

        match path {
            Some(p) if !p.exists() => {
                return Err(crate::Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )))
            }
            _ => {}
        }

        if let Some(found) = candidates.into_iter().find(|p| p.exists()) {
            tracing::debug!(path = %found.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(found).format(::config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("MAILPIPE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}
