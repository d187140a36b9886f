use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `REPLY_TRACKER__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Where link-preview crawlers are sent instead of the channel.
    #[serde(default = "default_crawler_redirect_url")]
    pub crawler_redirect_url: String,
    /// User-agent substring that identifies a link-preview crawler. Empty
    /// turns crawler detection off.
    #[serde(default = "default_crawler_agent_marker")]
    pub crawler_agent_marker: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Transparent retries of a query on transient errors.
    #[serde(default = "default_redis_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_redis_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_nats_max_reconnects")]
    pub max_reconnects: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Fixed delay before an application-level reconnect.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Maximum in-flight unacknowledged messages per consumer.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_inbound_stream")]
    pub inbound_stream: String,
    #[serde(default = "default_inbound_subject")]
    pub inbound_subject: String,
    #[serde(default = "default_inbound_consumer")]
    pub inbound_consumer: String,
    #[serde(default = "default_jobs_stream")]
    pub jobs_stream: String,
    #[serde(default = "default_jobs_subject_prefix")]
    pub jobs_subject_prefix: String,
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
    /// Ack deadline for inbound events. Dispatch consumers stretch it to
    /// cover their worst-case handling time.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

impl NatsConfig {
    /// Subject carrying jobs of one sink kind, e.g. `tracker.jobs.conversion`.
    pub fn jobs_subject(&self, kind: crate::types::SinkKind) -> String {
        format!("{}.{}", self.jobs_subject_prefix, kind.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    /// Feature flag for the inbound channel-event consumer.
    #[serde(default = "default_correlation_enabled")]
    pub enabled: bool,
    /// Re-runs of the correlation transaction after an optimistic conflict.
    #[serde(default = "default_max_tx_attempts")]
    pub max_tx_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_enabled")]
    pub enabled: bool,
    #[serde(default = "default_dispatch_consumer_prefix")]
    pub consumer_prefix: String,
    /// Attempts at resolving click → campaign → sink before abandoning.
    #[serde(default = "default_lookup_attempts")]
    pub lookup_attempts: u32,
    #[serde(default = "default_lookup_delay_ms")]
    pub lookup_delay_ms: u64,
    #[serde(default = "default_sink_timeout_ms")]
    pub sink_timeout_ms: u64,
    #[serde(default = "default_sink_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default = "default_watermark_min_len")]
    pub min_len: usize,
    #[serde(default = "default_watermark_max_len")]
    pub max_len: usize,
    #[serde(default = "default_watermark_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    3000
}
fn default_crawler_redirect_url() -> String {
    "https://www.google.com".to_string()
}
fn default_crawler_agent_marker() -> String {
    "facebook".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    8000
}
fn default_redis_retry_attempts() -> u32 {
    15
}
fn default_redis_retry_delay_ms() -> u64 {
    1000
}
fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}
fn default_nats_max_reconnects() -> usize {
    60
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_prefetch() -> usize {
    1000
}
fn default_ack_wait_secs() -> u64 {
    30
}
fn default_inbound_stream() -> String {
    "CHANNEL_EVENTS".to_string()
}
fn default_inbound_subject() -> String {
    "channel.messages.upsert".to_string()
}
fn default_inbound_consumer() -> String {
    "reply-correlation".to_string()
}
fn default_jobs_stream() -> String {
    "TRACKER_JOBS".to_string()
}
fn default_jobs_subject_prefix() -> String {
    "tracker.jobs".to_string()
}
fn default_duplicate_window_secs() -> u64 {
    3600
}
fn default_correlation_enabled() -> bool {
    false
}
fn default_max_tx_attempts() -> u32 {
    5
}
fn default_dispatch_enabled() -> bool {
    true
}
fn default_dispatch_consumer_prefix() -> String {
    "reply-dispatch".to_string()
}
fn default_lookup_attempts() -> u32 {
    5
}
fn default_lookup_delay_ms() -> u64 {
    1000
}
fn default_sink_timeout_ms() -> u64 {
    10_000
}
fn default_sink_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_watermark_min_len() -> usize {
    3
}
fn default_watermark_max_len() -> usize {
    15
}
fn default_watermark_max_attempts() -> u32 {
    10
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            crawler_redirect_url: default_crawler_redirect_url(),
            crawler_agent_marker: default_crawler_agent_marker(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_attempts: default_redis_retry_attempts(),
            retry_delay_ms: default_redis_retry_delay_ms(),
        }
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            max_reconnects: default_nats_max_reconnects(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            prefetch: default_prefetch(),
            inbound_stream: default_inbound_stream(),
            inbound_subject: default_inbound_subject(),
            inbound_consumer: default_inbound_consumer(),
            jobs_stream: default_jobs_stream(),
            jobs_subject_prefix: default_jobs_subject_prefix(),
            duplicate_window_secs: default_duplicate_window_secs(),
            ack_wait_secs: default_ack_wait_secs(),
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: default_correlation_enabled(),
            max_tx_attempts: default_max_tx_attempts(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: default_dispatch_enabled(),
            consumer_prefix: default_dispatch_consumer_prefix(),
            lookup_attempts: default_lookup_attempts(),
            lookup_delay_ms: default_lookup_delay_ms(),
            sink_timeout_ms: default_sink_timeout_ms(),
            max_retries: default_sink_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            min_len: default_watermark_min_len(),
            max_len: default_watermark_max_len(),
            max_attempts: default_watermark_max_attempts(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            redis: RedisConfig::default(),
            nats: NatsConfig::default(),
            correlation: CorrelationConfig::default(),
            dispatch: DispatchConfig::default(),
            watermark: WatermarkConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("REPLY_TRACKER")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
