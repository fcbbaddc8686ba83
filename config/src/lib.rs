//! # Configuration System
//!
//! Layered configuration for the strata document-processing backend.
//!
//! This crate provides:
//! - YAML/JSON file discovery with `extends` inheritance
//! - Priority-ordered merging with per-key strategies
//! - `${VAR}` interpolation and `STRATA__` environment overrides
//! - Schema, business-rule and interpolation validation
//! - Debounced hot reload
//! - Versioned, integrity-checked backups with rollback
//! - Change notifications over in-process channels and WebSocket
//!
//! [`ConfigSystem`] wires all of the above together; the individual parts
//! are usable on their own.

pub mod diff;
pub mod env;
pub mod file_loader;
pub mod hot_reload;
pub mod manager;
pub mod notifications;
pub mod precedence;
pub mod rollback;
pub mod schema;
pub mod settings;
pub mod system;
pub mod validation;

pub use diff::ConfigDiff;
pub use env::{EnvLookup, ProcessEnv, env_source, interpolate};
pub use file_loader::{ConfigFileInfo, ConfigFormat, ConfigLoader, LoadOutcome, load_file};
pub use hot_reload::{ChangeEvent, ChangeHandler, ChangeKind, ConfigWatcher, WatcherStatus};
pub use manager::{ConfigInfo, ConfigManager, ConfigSnapshot};
pub use notifications::websocket::NotificationServer;
pub use notifications::{
    ChannelSink, NotificationLevel, NotificationMessage, NotificationService, NotificationType,
    SubscriberSink,
};
pub use precedence::{ConfigSource, MergeStrategy, SourceTier, StrategyTable, merge_sources};
pub use rollback::{
    BackupMetadata, ConfigVersion, FileLiveConfig, LiveConfig, RetentionPolicy, RetentionSettings,
    RollbackManager, RollbackOutcome, VersionStatus, VersionType,
};
pub use schema::AppConfig;
pub use settings::ManagerSettings;
pub use system::{ConfigSystem, SystemStatus};
pub use validation::{ConfigValidator, ValidationReport};
