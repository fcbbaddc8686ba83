//! # Configuration Schema
//!
//! Typed view of the merged configuration used for schema validation.
//!
//! Every section is optional at this level; which sections must exist is
//! decided by the validator's `required_sections`. Inside a present section
//! missing fields fall back to their defaults, and unknown fields are
//! ignored so deployments can carry extra keys.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

static SEMVER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("semver pattern is valid"));

/// Known environments.
pub const ENVIRONMENTS: [&str; 3] = ["development", "production", "testing"];

/// Known log levels.
pub const LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

/// Top-level schema of the merged configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub system: Option<SystemSection>,

    #[serde(default)]
    #[validate(nested)]
    pub database: Option<DatabaseSection>,

    #[serde(default)]
    #[validate(nested)]
    pub redis: Option<RedisSection>,

    #[serde(default)]
    #[validate(nested)]
    pub api: Option<ApiSection>,

    #[serde(default)]
    #[validate(nested)]
    pub ai_service: Option<AiServiceSection>,

    #[serde(default)]
    #[validate(nested)]
    pub document_processor: Option<DocumentProcessorSection>,

    #[serde(default)]
    #[validate(nested)]
    pub web_crawler: Option<WebCrawlerSection>,

    #[serde(default)]
    #[validate(nested)]
    pub logging: Option<LoggingSection>,

    #[serde(default)]
    #[validate(nested)]
    pub monitoring: Option<MonitoringSection>,

    #[serde(default)]
    pub security: Option<SecuritySection>,

    #[serde(default)]
    pub storage: Option<StorageSection>
}

/// Identity of the running system.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct SystemSection {
    #[serde(default)]
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_system_version")]
    #[validate(custom(function = "validate_semver"))]
    pub version: String,

    #[serde(default = "default_environment")]
    #[validate(custom(function = "validate_environment"))]
    pub environment: String,

    #[serde(default)]
    pub debug: bool
}

fn default_system_version() -> String {
    "1.0.0".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn validate_semver(value: &str) -> Result<(), ValidationError> {
    if SEMVER.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("version must look like x.y.z"))
    }
}

fn validate_environment(value: &str) -> Result<(), ValidationError> {
    if ENVIRONMENTS.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(
            "environment must be development, production or testing"
        ))
    }
}

/// Relational database connection pool.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct DatabaseSection {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_database_host")]
    pub host: String,

    #[serde(default = "default_database_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_pool_size")]
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,

    #[serde(default = "default_max_overflow")]
    #[validate(range(min = 0, max = 50))]
    pub max_overflow: u32,

    #[serde(default = "default_pool_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub pool_timeout: u64,

    #[serde(default = "default_pool_recycle")]
    #[validate(range(min = 300))]
    pub pool_recycle: u64
}

fn default_database_host() -> String {
    "localhost".to_string()
}

fn default_database_port() -> u16 {
    5432
}

fn default_pool_size() -> u32 {
    10
}

fn default_max_overflow() -> u32 {
    20
}

fn default_pool_timeout() -> u64 {
    30
}

fn default_pool_recycle() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct RedisSection {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default)]
    #[validate(range(max = 15))]
    pub db: u8,

    #[serde(default = "default_redis_max_connections")]
    #[validate(range(min = 1, max = 100))]
    pub max_connections: u32
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_max_connections() -> u32 {
    10
}

/// HTTP API server.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ApiSection {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_api_workers")]
    #[validate(range(min = 1, max = 32))]
    pub workers: u32,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    #[serde(default)]
    pub cors_methods: Vec<String>,

    #[serde(default)]
    pub cors_headers: Vec<String>
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_api_workers() -> u32 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct AiServiceSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    #[validate(range(min = 1, max = 8000))]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f64,

    #[serde(default = "default_ai_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub timeout: u64,

    #[serde(default = "default_retry_attempts")]
    #[validate(range(max = 10))]
    pub retry_attempts: u32
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_temperature() -> f64 {
    0.7
}

fn default_ai_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct DocumentProcessorSection {
    /// Upper bound for an uploaded document, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default)]
    pub supported_formats: Vec<String>,

    #[serde(default = "default_processing_timeout")]
    #[validate(range(min = 1, max = 3600))]
    pub processing_timeout: u64,

    #[serde(default = "default_max_concurrent")]
    #[validate(range(min = 1, max = 20))]
    pub max_concurrent: u32
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_processing_timeout() -> u64 {
    300
}

fn default_max_concurrent() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct WebCrawlerSection {
    #[serde(default = "default_max_pages")]
    #[validate(range(min = 1, max = 10000))]
    pub max_pages: u32,

    /// Seconds between requests to one host.
    #[serde(default = "default_crawl_delay")]
    #[validate(range(min = 0.0, max = 60.0))]
    pub delay: f64,

    #[serde(default = "default_crawl_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub timeout: u64,

    #[serde(default = "default_max_concurrent")]
    #[validate(range(min = 1, max = 20))]
    pub max_concurrent: u32,

    #[serde(default)]
    pub user_agent: Option<String>
}

fn default_max_pages() -> u32 {
    100
}

fn default_crawl_delay() -> f64 {
    1.0
}

fn default_crawl_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[serde(default)]
    pub format: Option<String>,

    #[serde(default)]
    pub file: Option<String>
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn validate_log_level(value: &str) -> Result<(), ValidationError> {
    if LOG_LEVELS.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(
            "level must be DEBUG, INFO, WARNING, ERROR or CRITICAL"
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct MonitoringSection {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    #[validate(range(min = 1, max = 65535))]
    pub metrics_port: u16
}

fn default_monitoring_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SecuritySection {
    #[serde(default)]
    pub secret_key: String,

    #[serde(default)]
    pub algorithm: Option<String>,

    #[serde(default)]
    pub access_token_expire_minutes: Option<u64>
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageSection {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub local_path: String,

    #[serde(default)]
    pub allowed_extensions: Vec<String>
}
