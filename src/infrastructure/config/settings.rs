use std::collections::HashMap;
use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Relational store for contacts and templates. In-memory repositories are
    /// used when absent.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub queues: QueueSettings,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    /// Logical database index
    #[serde(default)]
    pub db: u8,
    /// Key prefix shared by every queue key
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

/// Which job store backs the queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub store: StoreKind,
    /// How often an idle worker polls the store for new work
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How often each pool looks for jobs whose lock lapsed
    #[serde(default = "default_stalled_interval")]
    pub stalled_interval_ms: u64,
    /// Extra time past a job's timeout before its lock is considered lapsed
    #[serde(default = "default_lock_grace")]
    pub lock_grace_ms: u64,
    /// Upper bound on jobs removed by a single clean call
    #[serde(default = "default_clean_batch_limit")]
    pub clean_batch_limit: usize,
    /// Per-queue policy overrides keyed by queue name
    #[serde(default)]
    pub overrides: HashMap<String, QueueOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueOverride {
    pub attempts: Option<u32>,
    pub concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub backoff_delay_ms: Option<u64>,
    pub keep_completed: Option<usize>,
    pub keep_failed: Option<usize>,
    pub rate_limit_max: Option<u32>,
    pub rate_limit_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_messaging_provider")]
    pub messaging: ProviderConfig,
    #[serde(default = "default_email_provider")]
    pub email: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Documented per-second ceiling of the provider API
    pub rate_per_second: u32,
    /// Recipients per provider call (email only)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_namespace() -> String {
    "ara:tasks".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    300
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_stalled_interval() -> u64 {
    30_000
}

fn default_lock_grace() -> u64 {
    30_000
}

fn default_clean_batch_limit() -> usize {
    1_000
}

fn default_batch_size() -> usize {
    50
}

fn default_request_timeout() -> u64 {
    10
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-task-queue".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

// Observed provider ceilings are roughly 12-13/sec for messaging. The
// authoritative value belongs in configuration.
fn default_messaging_provider() -> ProviderConfig {
    ProviderConfig {
        endpoint: "http://localhost:9001/v1/messages".to_string(),
        api_key: String::new(),
        rate_per_second: 12,
        batch_size: 1,
        request_timeout_seconds: default_request_timeout(),
    }
}

fn default_email_provider() -> ProviderConfig {
    ProviderConfig {
        endpoint: "http://localhost:9002/v1/mail/send".to_string(),
        api_key: String::new(),
        rate_per_second: 10,
        batch_size: default_batch_size(),
        request_timeout_seconds: default_request_timeout(),
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("redis.host", default_redis_host())?
            .set_default("redis.port", default_redis_port())?
            .set_default("redis.namespace", default_namespace())?
            .set_default("queues.store", "redis")?
            .set_default("shutdown.drain_timeout_seconds", default_drain_timeout())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // REDIS__HOST, QUEUES__STORE, PROVIDERS__EMAIL__API_KEY, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl RedisConfig {
    /// Connection URL assembled from host, port, credential and database index.
    pub fn url(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            namespace: default_namespace(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
            backoff_initial_delay_ms: default_backoff_initial(),
            backoff_max_delay_ms: default_backoff_max(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            poll_interval_ms: default_poll_interval(),
            stalled_interval_ms: default_stalled_interval(),
            lock_grace_ms: default_lock_grace(),
            clean_batch_limit: default_clean_batch_limit(),
            overrides: HashMap::new(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            messaging: default_messaging_provider(),
            email: default_email_provider(),
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: default_drain_timeout(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
