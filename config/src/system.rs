//! # Config System
//!
//! The process-wide handle that wires the manager, watcher, version store
//! and notification service together. Create one at startup and pass it by
//! reference (usually inside an `Arc`) to whatever needs configuration.

use crate::file_loader::ConfigFormat;
use crate::hot_reload::{ChangeEvent, ChangeHandler, ChangeKind, ConfigWatcher, WatcherStatus};
use crate::manager::ConfigManager;
use crate::notifications::{NotificationService, NotificationStatus, SubscriberSink};
use crate::rollback::{
    BackupMetadata, ConfigVersion, FileLiveConfig, LiveConfig, RetentionSettings, RollbackManager,
    RollbackOutcome, VersionType,
};
use crate::settings::ManagerSettings;
use errors::{ConfigError, ConfigResult, NotifyError};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Monitoring snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub environment: String,
    pub config_dir: PathBuf,
    pub loaded: bool,
    pub restored: bool,
    pub config_id: String,
    pub version_count: usize,
    pub latest_version: Option<u32>,
    pub watcher: WatcherStatus,
    pub notifications: NotificationStatus
}

/// The merged configuration as the thing a rollback replaces.
///
/// A restore pins the complete snapshot in the `restored` tier, which masks
/// every file and environment tier below it, and drops runtime overrides.
/// The next load therefore serves exactly the restored content.
struct ManagerLive {
    manager: Arc<ConfigManager>
}

impl ManagerLive {
    fn pin(&self) -> FileLiveConfig {
        FileLiveConfig::new(self.manager.restored_path())
    }
}

impl LiveConfig for ManagerLive {
    /// Falls back to the pinned snapshot, then the raw `default` file, when
    /// nothing loaded, so a broken configuration can still be rolled back.
    fn current(&self) -> ConfigResult<Value> {
        if self.manager.is_loaded() {
            Ok(self.manager.get_merged_config())
        } else if self.manager.has_restored() {
            self.pin().current()
        } else {
            FileLiveConfig::new(self.manager.live_path()).current()
        }
    }

    fn restore(&self, config: &Value) -> ConfigResult<()> {
        self.pin().restore(config)?;
        self.manager.discard_runtime_overrides();
        Ok(())
    }

    fn describe(&self) -> String {
        self.manager.restored_path().display().to_string()
    }
}

/// Versions every successful reload and turns watcher activity into
/// notifications.
struct Lifecycle {
    config_id: String,
    environment: String,
    rollback: Arc<RollbackManager>,
    notifications: Arc<NotificationService>
}

impl ChangeHandler for Lifecycle {
    fn on_event(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        if event.kind != ChangeKind::Reloaded {
            self.notifications
                .notify_config_changed(&event.path.display().to_string(), &event.kind.to_string());
            return Ok(());
        }
        let (Some(old), Some(new)) = (&event.old_config, &event.new_config) else {
            return Ok(());
        };
        self.notifications.notify_config_reloaded(old, new);
        let meta = BackupMetadata::new(VersionType::Auto)
            .author("watcher")
            .reason(format!("reload after change to {}", event.path.display()))
            .environment(&self.environment);
        self.rollback.create_backup(&self.config_id, new, meta)?;
        Ok(())
    }

    fn on_error(&self, error: &ConfigError) -> anyhow::Result<()> {
        self.notifications.notify_validation_error(&error.violations());
        Ok(())
    }
}

/// Stops the watcher on drop.
pub struct ConfigSystem {
    settings: ManagerSettings,
    manager: Arc<ConfigManager>,
    watcher: Arc<ConfigWatcher>,
    rollback: Arc<RollbackManager>,
    notifications: Arc<NotificationService>
}

impl ConfigSystem {
    pub fn new(settings: ManagerSettings) -> ConfigResult<Self> {
        let manager = Arc::new(ConfigManager::new(&settings));
        Self::with_manager(settings, manager)
    }

    /// Builds the system around an existing manager (custom environment
    /// lookup or strategy table).
    pub fn with_manager(settings: ManagerSettings, manager: Arc<ConfigManager>) -> ConfigResult<Self> {
        settings.check()?;
        let backup_dir = settings.backup_dir();
        let rollback = Arc::new(RollbackManager::open(
            &backup_dir,
            RetentionSettings::from(&settings)
        )?);
        let notifications = Arc::new(NotificationService::new(settings.notification_history));
        let watcher = Arc::new(
            ConfigWatcher::new(Arc::clone(&manager), settings.debounce(), settings.event_history)
                .ignoring(&backup_dir)
        );
        watcher.add_handler(Arc::new(Lifecycle {
            config_id: settings.config_id.clone(),
            environment: settings.environment.clone(),
            rollback: Arc::clone(&rollback),
            notifications: Arc::clone(&notifications)
        }));
        Ok(Self {
            settings,
            manager,
            watcher,
            rollback,
            notifications
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn manager(&self) -> &Arc<ConfigManager> {
        &self.manager
    }

    pub fn watcher(&self) -> &Arc<ConfigWatcher> {
        &self.watcher
    }

    pub fn rollback(&self) -> &Arc<RollbackManager> {
        &self.rollback
    }

    pub fn notifications(&self) -> &Arc<NotificationService> {
        &self.notifications
    }

    pub fn config_id(&self) -> &str {
        &self.settings.config_id
    }

    /// Loads the configuration and records it as the startup version.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// First load of the process. The loaded configuration is stored as an
    /// `auto` version tagged `startup` (deduplicated against the history).
    ///
    /// ## Error Handling
    /// A load failure sends a `validation_error` notification and is
    /// returned; nothing is served.
    pub fn load(&self) -> ConfigResult<Arc<Value>> {
        let merged = self.manager.load().inspect_err(|err| {
            self.notifications.notify_validation_error(&err.violations());
        })?;
        let meta = BackupMetadata::new(VersionType::Auto)
            .author("system")
            .reason("startup")
            .environment(&self.settings.environment)
            .tag("startup");
        let version = self.rollback.create_backup(self.config_id(), &merged, meta)?;
        info!(config_id = %self.config_id(), version = version.version, "startup configuration recorded");
        Ok(merged)
    }

    /// Reloads now. Success versions the result and sends
    /// `config_reloaded`; failure sends `validation_error` and keeps the
    /// current configuration.
    pub fn reload(&self) -> ConfigResult<ChangeEvent> {
        self.watcher.force_reload()
    }

    /// Starts hot reload. Requires a Tokio runtime.
    pub fn start_watching(&self) -> ConfigResult<()> {
        self.watcher.start()
    }

    pub fn stop_watching(&self) {
        self.watcher.stop();
    }

    pub fn get_value(&self, key_path: &str, default: Value) -> Value {
        self.manager.get_value(key_path, default)
    }

    pub fn get_merged_config(&self) -> Value {
        self.manager.get_merged_config()
    }

    /// Stores the current configuration as a manual version.
    pub fn backup(&self, author: &str, reason: &str) -> ConfigResult<ConfigVersion> {
        let meta = BackupMetadata::new(VersionType::Manual)
            .author(author)
            .reason(reason)
            .environment(&self.settings.environment);
        self.rollback
            .create_backup(self.config_id(), &self.manager.get_merged_config(), meta)
    }

    fn live(&self) -> ManagerLive {
        ManagerLive {
            manager: Arc::clone(&self.manager)
        }
    }

    /// Restores a stored version, then reloads.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// The single restore path: the version store verifies the target,
    /// snapshots the current configuration as a `rollback` version and
    /// pins the target as the `restored` tier. A `rollback` notification
    /// follows and the manager reloads from disk, serving the target
    /// content unchanged until [`ConfigSystem::release_restore`].
    ///
    /// ## Error Handling
    /// `NotFound` or `Integrity` errors leave the live file untouched. A
    /// reload failure after a successful restore is reported through a
    /// `validation_error` notification, not returned.
    pub fn rollback_to_version(&self, version: u32, author: &str) -> ConfigResult<RollbackOutcome> {
        let outcome = self
            .rollback
            .rollback_to_version(self.config_id(), version, &self.live(), author)?;
        self.notifications
            .notify_rollback(self.config_id(), outcome.from_version, outcome.to_version);
        match self.watcher.force_reload() {
            Ok(_) if self.manager.get_merged_config() != outcome.restored => {
                warn!(version = outcome.to_version, "served configuration differs from restored version");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "reload after rollback failed")
        }
        Ok(outcome)
    }

    /// Removes the pinned snapshot so the file tiers apply again, then
    /// reloads. Returns `false` when nothing was pinned.
    pub fn release_restore(&self) -> ConfigResult<bool> {
        let path = self.manager.restored_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(ConfigError::access(&path, e))
        }
        info!(path = %path.display(), "released restored configuration");
        self.notifications.notify_system_status(
            "restore_released",
            json!({"config_id": self.config_id(), "path": path.display().to_string()})
        );
        self.watcher.force_reload()?;
        Ok(true)
    }

    /// Newest versions first.
    pub fn get_history(&self, limit: usize) -> Vec<ConfigVersion> {
        self.rollback.get_history(self.config_id(), limit)
    }

    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        sink: Arc<dyn SubscriberSink>
    ) -> Result<(), NotifyError> {
        self.notifications.subscribe(subscriber_id, sink)
    }

    /// Validates imported content, versions the current configuration and
    /// pins the import the same way a rollback does.
    pub fn apply_import(
        &self,
        content: &str,
        format: ConfigFormat,
        author: &str
    ) -> ConfigResult<ConfigVersion> {
        let imported = self.manager.import(content, format)?;
        let backup = self.backup(author, "before import")?;
        self.live().restore(&imported)?;
        if let Err(err) = self.watcher.force_reload() {
            warn!(error = %err, "reload after import failed");
        }
        Ok(backup)
    }

    pub fn status(&self) -> SystemStatus {
        let latest = self.rollback.get_latest_version(self.config_id());
        SystemStatus {
            environment: self.settings.environment.clone(),
            config_dir: self.settings.config_dir.clone(),
            loaded: self.manager.is_loaded(),
            restored: self.manager.has_restored(),
            config_id: self.settings.config_id.clone(),
            version_count: self.rollback.get_versions(self.config_id()).len(),
            latest_version: latest.map(|v| v.version),
            watcher: self.watcher.status(),
            notifications: self.notifications.status()
        }
    }
}

impl Drop for ConfigSystem {
    fn drop(&mut self) {
        self.watcher.stop();
    }
}
