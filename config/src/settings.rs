//! # Subsystem Settings
//!
//! Settings of the configuration subsystem itself, read from environment
//! variables following 12-factor app principles. CLI flags override them.
//!
//! # Naming Convention
//! All variables use the `STRATA_` prefix. The environment name also falls
//! back to the conventional `ENV` variable.

use crate::rollback::RetentionPolicy;
use errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::warn;
use validator::Validate;

/// Settings for [`crate::ConfigSystem`] and its parts.
///
/// ## Environment Variables
/// - `STRATA_CONFIG_DIR`: configuration root (default: `config`)
/// - `STRATA_ENV` or `ENV`: environment name (default: `development`)
/// - `STRATA_BACKUP_DIR`: version store (default: `<config_dir>/backups`)
/// - `STRATA_DEBOUNCE_MS`: watcher debounce window (default: 1000)
/// - `STRATA_MAX_VERSIONS`: versions kept per config id (default: 50)
/// - `STRATA_RETENTION_DAYS`: age limit of automatic versions (default: 30)
/// - `STRATA_RETENTION_POLICY`: `delete` or `archive` (default: `delete`)
/// - `STRATA_EVENT_HISTORY`: change events kept (default: 100)
/// - `STRATA_NOTIFICATION_HISTORY`: notifications kept (default: 1000)
/// - `STRATA_ENV_PREFIX`: prefix of the `env_var` tier (default: `STRATA__`)
/// - `STRATA_REQUIRED_SECTIONS`: comma list (default: `system`)
/// - `STRATA_WS_BIND`: notification server address (default: `127.0.0.1:8765`)
/// - `STRATA_CONFIG_ID`: id of the live configuration in the version store
///   (default: `main`)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ManagerSettings {
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    #[serde(default = "default_environment")]
    #[validate(length(min = 1, max = 64))]
    pub environment: String,

    /// `None` means `<config_dir>/backups`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    #[serde(default = "default_debounce_ms")]
    #[validate(range(min = 10, max = 60000))]
    pub debounce_ms: u64,

    #[serde(default = "default_max_versions")]
    #[validate(range(min = 1, max = 10000))]
    pub max_versions: usize,

    #[serde(default = "default_retention_days")]
    #[validate(range(min = 1, max = 3650))]
    pub retention_days: u32,

    #[serde(default)]
    pub retention_policy: RetentionPolicy,

    #[serde(default = "default_event_history")]
    #[validate(range(min = 1, max = 100000))]
    pub event_history: usize,

    #[serde(default = "default_notification_history")]
    #[validate(range(min = 1, max = 100000))]
    pub notification_history: usize,

    #[serde(default = "default_env_prefix")]
    #[validate(length(min = 1))]
    pub env_prefix: String,

    #[serde(default = "default_required_sections")]
    pub required_sections: Vec<String>,

    #[serde(default = "default_ws_bind")]
    pub ws_bind: String,

    #[serde(default = "default_config_id")]
    #[validate(custom(function = "validate_config_id"))]
    pub config_id: String
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_max_versions() -> usize {
    50
}

fn default_retention_days() -> u32 {
    30
}

fn default_event_history() -> usize {
    100
}

fn default_notification_history() -> usize {
    1000
}

fn default_env_prefix() -> String {
    "STRATA__".to_string()
}

fn default_required_sections() -> Vec<String> {
    vec!["system".to_string()]
}

fn default_ws_bind() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_config_id() -> String {
    "main".to_string()
}

/// Config ids become part of file names.
fn validate_config_id(value: &str) -> Result<(), validator::ValidationError> {
    if crate::rollback::is_valid_config_id(value) {
        Ok(())
    } else {
        Err(validator::ValidationError::new(
            "config id may only contain letters, digits, '-' and '_'"
        ))
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            environment: default_environment(),
            backup_dir: None,
            debounce_ms: default_debounce_ms(),
            max_versions: default_max_versions(),
            retention_days: default_retention_days(),
            retention_policy: RetentionPolicy::default(),
            event_history: default_event_history(),
            notification_history: default_notification_history(),
            env_prefix: default_env_prefix(),
            required_sections: default_required_sections(),
            ws_bind: default_ws_bind(),
            config_id: default_config_id()
        }
    }
}

impl ManagerSettings {
    /// Settings rooted at `config_dir` with every other value defaulted.
    pub fn for_dir(config_dir: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment: environment.into(),
            ..Self::default()
        }
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::default();
        let settings = Self {
            config_dir: env::var("STRATA_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            environment: env::var("STRATA_ENV")
                .or_else(|_| env::var("ENV"))
                .unwrap_or(defaults.environment),
            backup_dir: env::var("STRATA_BACKUP_DIR").ok().map(PathBuf::from),
            debounce_ms: parse_env("STRATA_DEBOUNCE_MS").unwrap_or(defaults.debounce_ms),
            max_versions: parse_env("STRATA_MAX_VERSIONS").unwrap_or(defaults.max_versions),
            retention_days: parse_env("STRATA_RETENTION_DAYS").unwrap_or(defaults.retention_days),
            retention_policy: parse_env("STRATA_RETENTION_POLICY")
                .unwrap_or(defaults.retention_policy),
            event_history: parse_env("STRATA_EVENT_HISTORY").unwrap_or(defaults.event_history),
            notification_history: parse_env("STRATA_NOTIFICATION_HISTORY")
                .unwrap_or(defaults.notification_history),
            env_prefix: env::var("STRATA_ENV_PREFIX").unwrap_or(defaults.env_prefix),
            required_sections: env::var("STRATA_REQUIRED_SECTIONS")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.required_sections),
            ws_bind: env::var("STRATA_WS_BIND").unwrap_or(defaults.ws_bind),
            config_id: env::var("STRATA_CONFIG_ID").unwrap_or(defaults.config_id)
        };
        settings.check()?;
        Ok(settings)
    }

    /// Runs the `validator` rules, mapping failures to `ConfigError`.
    pub fn check(&self) -> ConfigResult<()> {
        self.validate().map_err(|e| ConfigError::Validation {
            violations: e
                .field_errors()
                .into_iter()
                .map(|(field, errs)| {
                    let codes: Vec<String> = errs.iter().map(|e| e.code.to_string()).collect();
                    format!("settings.{field}: {}", codes.join(", "))
                })
                .collect()
        })
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("backups"))
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display
{
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring unparsable setting");
            None
        }
    }
}
