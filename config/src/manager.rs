//! # Config Manager
//!
//! Loads, merges, validates and serves the effective configuration.
//!
//! The merged configuration lives in an immutable snapshot behind an
//! [`ArcSwapOption`]. A reload builds a complete new snapshot and swaps it in
//! with one pointer store, so readers see either the old or the new
//! configuration and never a mix. A failed load leaves the previous snapshot
//! in place.

use crate::env::{EnvLookup, ProcessEnv, env_source, interpolate};
use crate::file_loader::{ConfigFileInfo, ConfigFormat, ConfigLoader};
use crate::precedence::{ConfigSource, SourceTier, StrategyTable, merge_sources, source_of};
use crate::settings::ManagerSettings;
use crate::validation::{ConfigValidator, ValidationReport};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use errors::{ConfigError, ConfigResult};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata block added to exports on request.
pub const METADATA_KEY: &str = "_metadata";
pub const EXPORT_FORMAT_VERSION: &str = "1.0";

/// One fully built configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub merged: Arc<Value>,
    pub sources: Vec<ConfigSource>,
    pub warnings: Vec<String>,
    pub loaded_at: DateTime<Utc>
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigInfo {
    pub config_dir: PathBuf,
    pub environment: String,
    pub loaded: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub sources: Vec<String>,
    pub top_level_keys: Vec<String>,
    pub warnings: Vec<String>
}

pub struct ConfigManager {
    loader: ConfigLoader,
    validator: ConfigValidator,
    strategies: StrategyTable,
    env_prefix: String,
    env: Arc<dyn EnvLookup>,
    current: ArcSwapOption<ConfigSnapshot>,
    runtime: Mutex<Value>
}

impl ConfigManager {
    pub fn new(settings: &ManagerSettings) -> Self {
        Self {
            loader: ConfigLoader::new(&settings.config_dir, &settings.environment),
            validator: ConfigValidator::new(settings.required_sections.clone())
                .with_environment(settings.environment.clone()),
            strategies: StrategyTable::with_defaults(),
            env_prefix: settings.env_prefix.clone(),
            env: Arc::new(ProcessEnv),
            current: ArcSwapOption::empty(),
            runtime: Mutex::new(Value::Object(Map::new()))
        }
    }

    /// Replaces the variable source used for the `env_var` tier and for
    /// `${VAR}` interpolation.
    pub fn with_env(mut self, env: Arc<dyn EnvLookup>) -> Self {
        self.env = env;
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn loader(&self) -> &ConfigLoader {
        &self.loader
    }

    pub fn config_dir(&self) -> &Path {
        self.loader.config_dir()
    }

    pub fn environment(&self) -> &str {
        self.loader.environment()
    }

    /// The `default` file.
    pub fn live_path(&self) -> PathBuf {
        self.loader.live_path()
    }

    /// File a restore pins its snapshot to.
    pub fn restored_path(&self) -> PathBuf {
        self.loader.restored_path()
    }

    /// Whether a pinned snapshot currently masks the file tiers.
    pub fn has_restored(&self) -> bool {
        self.restored_path().is_file()
    }

    /// Loads the configuration and makes it current.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// Reads every source, merges them by tier, resolves `${VAR}`
    /// references and validates the result before publishing it.
    ///
    /// ## Usage
    /// ```rust,no_run
    /// use config::{ConfigManager, ManagerSettings};
    ///
    /// fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let manager = ConfigManager::new(&ManagerSettings::for_dir("config", "development"));
    ///     manager.load()?;
    ///     let debug = manager.get_value("system.debug", serde_json::json!(false));
    ///     println!("debug = {debug}");
    ///     Ok(())
    /// }
    /// ```
    ///
    /// ## Error Handling
    /// Every failure is a `ConfigError::Load` wrapping the cause. A parse
    /// failure in an optional file is logged and the file is skipped; in a
    /// required file it aborts the load. The previous configuration stays
    /// current on failure.
    pub fn load(&self) -> ConfigResult<Arc<Value>> {
        let runtime = self.runtime.lock().clone();
        let snapshot = self.build(runtime)?;
        let merged = Arc::clone(&snapshot.merged);
        info!(
            environment = %self.environment(),
            sources = snapshot.sources.len(),
            warnings = snapshot.warnings.len(),
            "configuration loaded"
        );
        self.current.store(Some(Arc::new(snapshot)));
        Ok(merged)
    }

    /// Same as [`ConfigManager::load`]; logs the failure and keeps serving
    /// the last good configuration.
    pub fn reload(&self) -> ConfigResult<Arc<Value>> {
        self.load().inspect_err(|err| {
            warn!(error = %err, "reload failed, keeping last good configuration");
        })
    }

    fn build(&self, runtime: Value) -> ConfigResult<ConfigSnapshot> {
        let outcome = self
            .loader
            .load_sources()
            .map_err(|e| e.into_load("failed to read configuration files"))?;
        let required = self.loader.required_sources();

        for (info, err) in outcome.failures {
            if required.contains(&info.name.as_str()) {
                return Err(err.into_load(format!("required source '{}' failed to load", info.name)));
            }
            warn!(source = %info.name, error = %err, "skipping optional source");
        }

        let mut sources = outcome.sources;
        if let Some(env) = env_source(&self.env_prefix, self.env.as_ref()) {
            sources.push(env);
        }
        if let Value::Object(runtime) = runtime {
            if !runtime.is_empty() {
                sources.push(ConfigSource::new("runtime", SourceTier::Runtime, runtime));
            }
        }

        let mut merged = merge_sources(&sources, &self.strategies)
            .map_err(|e| e.into_load("failed to merge configuration sources"))?;
        interpolate(&mut merged, self.env.as_ref());

        let warnings = self
            .validator
            .validate(&sources, &required, &merged)
            .into_result()
            .map_err(|e| e.into_load("configuration is invalid"))?;

        Ok(ConfigSnapshot {
            merged: Arc::new(merged),
            sources,
            warnings,
            loaded_at: Utc::now()
        })
    }

    pub fn snapshot(&self) -> Option<Arc<ConfigSnapshot>> {
        self.current.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }

    /// Current merged configuration, `{}` before the first load.
    pub fn get_merged_config(&self) -> Value {
        self.current
            .load()
            .as_ref()
            .map_or_else(|| Value::Object(Map::new()), |s| (*s.merged).clone())
    }

    /// Value at a dotted key path, or `default` when absent.
    pub fn get_value(&self, key_path: &str, default: Value) -> Value {
        self.current
            .load()
            .as_ref()
            .and_then(|s| utils::lookup(&s.merged, key_path).cloned())
            .unwrap_or(default)
    }

    /// Typed value at a dotted key path.
    pub fn get_as<T: DeserializeOwned>(&self, key_path: &str) -> ConfigResult<T> {
        let guard = self.current.load();
        let value = guard
            .as_ref()
            .and_then(|s| utils::lookup(&s.merged, key_path))
            .ok_or_else(|| ConfigError::not_found("key", key_path))?;
        T::deserialize(value).map_err(|e| ConfigError::serialization(format!("{key_path}: {e}")))
    }

    /// Name of the highest-tier source defining `key_path`.
    pub fn get_config_source(&self, key_path: &str) -> Option<String> {
        let guard = self.current.load();
        let snapshot = guard.as_ref()?;
        source_of(&snapshot.sources, key_path).map(|s| s.name.clone())
    }

    pub fn config_info(&self) -> ConfigInfo {
        let snapshot = self.snapshot();
        ConfigInfo {
            config_dir: self.config_dir().to_path_buf(),
            environment: self.environment().to_string(),
            loaded: snapshot.is_some(),
            loaded_at: snapshot.as_ref().map(|s| s.loaded_at),
            sources: snapshot
                .as_ref()
                .map(|s| s.sources.iter().map(|src| src.name.clone()).collect())
                .unwrap_or_default(),
            top_level_keys: snapshot
                .as_ref()
                .and_then(|s| s.merged.as_object().map(|m| m.keys().cloned().collect()))
                .unwrap_or_default(),
            warnings: snapshot.map(|s| s.warnings.clone()).unwrap_or_default()
        }
    }

    pub fn list_config_files(&self) -> ConfigResult<Vec<ConfigFileInfo>> {
        self.loader.discover()
    }

    /// Sets a `runtime` tier value and reloads. The change is dropped again
    /// when the reload fails.
    pub fn set_runtime_value(&self, key_path: &str, value: Value) -> ConfigResult<Arc<Value>> {
        let mut runtime = self.runtime.lock();
        let mut updated = runtime.clone();
        utils::set_path(&mut updated, key_path, value);
        let snapshot = self.build(updated.clone())?;
        *runtime = updated;
        let merged = Arc::clone(&snapshot.merged);
        self.current.store(Some(Arc::new(snapshot)));
        debug!(key_path, "runtime override applied");
        Ok(merged)
    }

    /// Drops the `runtime` tier without rebuilding. The next load serves
    /// the file and pinned tiers only.
    pub fn discard_runtime_overrides(&self) {
        *self.runtime.lock() = Value::Object(Map::new());
    }

    pub fn clear_runtime_overrides(&self) -> ConfigResult<Arc<Value>> {
        let mut runtime = self.runtime.lock();
        let snapshot = self.build(Value::Object(Map::new()))?;
        *runtime = Value::Object(Map::new());
        let merged = Arc::clone(&snapshot.merged);
        self.current.store(Some(Arc::new(snapshot)));
        Ok(merged)
    }

    /// Validates an arbitrary merged mapping with the configured rules.
    pub fn validate_config(&self, config: &Value) -> ValidationReport {
        self.validator.validate_config(config)
    }

    /// Renders the merged configuration.
    ///
    /// With `include_metadata` a `_metadata` block records the export time,
    /// format version, source directory and environment.
    pub fn export(&self, format: ConfigFormat, include_metadata: bool) -> ConfigResult<String> {
        let mut config = self.get_merged_config();
        if include_metadata {
            if let Value::Object(map) = &mut config {
                map.insert(
                    METADATA_KEY.to_string(),
                    json!({
                        "exported_at": Utc::now().to_rfc3339(),
                        "version": EXPORT_FORMAT_VERSION,
                        "source_path": self.config_dir().display().to_string(),
                        "environment": self.environment()
                    })
                );
            }
        }
        format.render(&config)
    }

    /// Parses and validates exported content, dropping `_metadata`.
    pub fn import(&self, content: &str, format: ConfigFormat) -> ConfigResult<Value> {
        let mut mapping = format.parse(content, "import")?;
        mapping.remove(METADATA_KEY);
        let config = Value::Object(mapping);
        self.validator.validate_config(&config).into_result()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn tree(default: &str, development: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("default.yaml"), default).unwrap();
        fs::write(dir.path().join("development.yaml"), development).unwrap();
        dir
    }

    fn manager(dir: &TempDir, vars: &[(&str, &str)]) -> ConfigManager {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConfigManager::new(&ManagerSettings::for_dir(dir.path(), "development")).with_env(Arc::new(env))
    }

    #[test]
    fn test_environment_overrides_default() {
        let dir = tree(
            "system:\n  name: x\n  debug: false\n",
            "system:\n  debug: true\n"
        );
        let mgr = manager(&dir, &[]);
        mgr.load().unwrap();

        assert_eq!(mgr.get_value("system.debug", json!(null)), json!(true));
        assert_eq!(mgr.get_value("system.name", json!(null)), json!("x"));
        assert_eq!(mgr.get_value("system.missing", json!(7)), json!(7));
        assert_eq!(mgr.get_config_source("system.debug").as_deref(), Some("development"));
        assert_eq!(mgr.get_config_source("system.name").as_deref(), Some("default"));
        assert!(mgr.get_as::<bool>("system.debug").unwrap());
    }

    #[test]
    fn test_env_tier_and_interpolation() {
        let dir = tree(
            "system:\n  name: ${APP_NAME:fallback}\n  debug: false\ndatabase:\n  host: ${DB_HOST}\n",
            "{}\n"
        );
        let mgr = manager(
            &dir,
            &[("DB_HOST", "db.internal"), ("STRATA__SYSTEM__DEBUG", "true")]
        );
        mgr.load().unwrap();

        assert_eq!(mgr.get_value("system.name", json!(null)), json!("fallback"));
        assert_eq!(mgr.get_value("database.host", json!(null)), json!("db.internal"));
        assert_eq!(mgr.get_value("system.debug", json!(null)), json!(true));
        assert_eq!(mgr.get_config_source("system.debug").as_deref(), Some("env_var"));
    }

    #[test]
    fn test_missing_required_file_fails_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("default.yaml"), "system:\n  name: x\n").unwrap();
        let mgr = manager(&dir, &[]);

        let err = mgr.load().unwrap_err();
        assert_eq!(err.kind(), errors::ErrorKind::Load);
        assert_eq!(err.root_kind(), errors::ErrorKind::Validation);
        assert!(!mgr.is_loaded());
    }

    #[test]
    fn test_production_load_rejects_debug_without_environment_key() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("default.yaml"), "system:\n  name: x\n").unwrap();
        fs::write(dir.path().join("production.yaml"), "system:\n  debug: true\n").unwrap();
        let mgr = ConfigManager::new(&ManagerSettings::for_dir(dir.path(), "production"))
            .with_env(Arc::new(HashMap::<String, String>::new()));

        let err = mgr.load().unwrap_err();
        assert_eq!(err.root_kind(), errors::ErrorKind::Validation);
        assert!(!mgr.is_loaded());
    }

    #[test]
    fn test_broken_optional_file_is_skipped() {
        let dir = tree("system:\n  name: x\n", "{}\n");
        fs::write(dir.path().join("override.yaml"), "system: [unclosed\n").unwrap();
        let mgr = manager(&dir, &[]);
        mgr.load().unwrap();
        assert_eq!(mgr.get_value("system.name", json!(null)), json!("x"));
    }

    #[test]
    fn test_broken_required_file_aborts() {
        let dir = tree("system:\n  name: x\n", "system: [unclosed\n");
        let mgr = manager(&dir, &[]);
        assert_eq!(mgr.load().unwrap_err().root_kind(), errors::ErrorKind::Parse);
    }

    #[test]
    fn test_failed_reload_keeps_last_good() {
        let dir = tree("system:\n  name: x\n", "{}\n");
        let mgr = manager(&dir, &[]);
        mgr.load().unwrap();

        fs::write(dir.path().join("development.yaml"), "api:\n  workers: 500\n").unwrap();
        let err = mgr.reload().unwrap_err();
        assert!(err.violations().iter().any(|v| v.contains("api.workers")));
        assert_eq!(mgr.get_value("system.name", json!(null)), json!("x"));
        assert!(mgr.get_merged_config().get("api").is_none());
    }

    #[test]
    fn test_runtime_overrides() {
        let dir = tree("system:\n  name: x\n  debug: false\n", "{}\n");
        let mgr = manager(&dir, &[]);
        mgr.load().unwrap();

        mgr.set_runtime_value("system.debug", json!(true)).unwrap();
        assert_eq!(mgr.get_value("system.debug", json!(null)), json!(true));
        assert_eq!(mgr.get_config_source("system.debug").as_deref(), Some("runtime"));

        assert!(mgr.set_runtime_value("api.workers", json!(0)).is_err());
        assert!(mgr.get_merged_config().get("api").is_none());

        mgr.clear_runtime_overrides().unwrap();
        assert_eq!(mgr.get_value("system.debug", json!(null)), json!(false));
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = tree(
            "system:\n  name: x\n  version: 1.2.3\napi:\n  cors_origins: [a, b]\n  workers: 4\n",
            "ai_service:\n  temperature: 0.7\n"
        );
        let mgr = manager(&dir, &[]);
        mgr.load().unwrap();
        let merged = mgr.get_merged_config();

        for format in [ConfigFormat::Yaml, ConfigFormat::Json] {
            let plain = mgr.export(format, false).unwrap();
            assert_eq!(mgr.import(&plain, format).unwrap(), merged);

            let with_meta = mgr.export(format, true).unwrap();
            assert!(with_meta.contains("_metadata"));
            assert_eq!(mgr.import(&with_meta, format).unwrap(), merged);
        }
    }

    #[test]
    fn test_import_rejects_invalid() {
        let dir = tree("system:\n  name: x\n", "{}\n");
        let mgr = manager(&dir, &[]);
        let err = mgr
            .import(r#"{"system": {"name": "x", "environment": "staging"}}"#, ConfigFormat::Json)
            .unwrap_err();
        assert_eq!(err.kind(), errors::ErrorKind::Validation);
    }

    #[test]
    fn test_config_info_and_files() {
        let dir = tree("system:\n  name: x\n", "{}\n");
        fs::create_dir(dir.path().join("templates")).unwrap();
        fs::write(dir.path().join("templates/base.yaml"), "logging:\n  level: INFO\n").unwrap();
        let mgr = manager(&dir, &[]);
        mgr.load().unwrap();

        let info = mgr.config_info();
        assert!(info.loaded);
        assert_eq!(info.sources, vec!["default", "base.template", "development"]);
        assert_eq!(info.top_level_keys, vec!["logging", "system"]);
        assert_eq!(mgr.list_config_files().unwrap().len(), 3);
    }
}
