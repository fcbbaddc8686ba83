//! # Configuration File Loading
//!
//! Discovers the configuration file set under a root directory and parses
//! each file into a raw mapping. No merging happens here.
//!
//! # File Set
//! - `default.{yaml,yml,json}`
//! - `<environment>.{yaml,yml,json}`
//! - `override.{yaml,yml,json}`
//! - `templates/*` (source name `<stem>.template`)
//! - `presets/*` (source name `<stem>.preset`)
//! - `restored.json`, the snapshot pinned by the last rollback or import
//!
//! When one logical file exists with several extensions, `.yaml` is
//! preferred over `.yml`, which is preferred over `.json`.

use crate::precedence::{ConfigSource, SourceTier};
use chrono::{DateTime, Utc};
use errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Extensions the loader and the watcher recognize, in preference order.
pub const RECOGNIZED_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

pub const TEMPLATES_DIR: &str = "templates";
pub const PRESETS_DIR: &str = "presets";
/// Pinned snapshot written by rollbacks and imports.
pub const RESTORED_FILE: &str = "restored.json";

/// Serialization format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    #[default]
    Yaml,
    Json
}

impl ConfigFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|s| s.to_str())
            .and_then(Self::from_extension)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json"
        }
    }

    /// Parses a document whose root must be a mapping. Empty documents are
    /// an empty mapping.
    pub fn parse(self, content: &str, origin: &str) -> ConfigResult<Map<String, Value>> {
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        let value: Value = match self {
            Self::Yaml => serde_yaml::from_str(content).map_err(|e| ConfigError::parse(origin, e))?,
            Self::Json => serde_json::from_str(content).map_err(|e| ConfigError::parse(origin, e))?
        };
        match value {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(ConfigError::parse(
                origin,
                format!("root must be a mapping, found {}", kind_of(&other))
            ))
        }
    }

    pub fn render(self, value: &Value) -> ConfigResult<String> {
        match self {
            Self::Yaml => serde_yaml::to_string(value).map_err(ConfigError::serialization),
            Self::Json => serde_json::to_string_pretty(value).map_err(ConfigError::serialization)
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ConfigFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("unsupported format: {s}"))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Array(_) => "a list",
        Value::String(_) => "a string",
        Value::Number(_) => "a number",
        Value::Bool(_) => "a boolean",
        Value::Null | Value::Object(_) => "a mapping"
    }
}

/// Reads and parses one file, detecting the format from its extension.
pub fn load_file(path: &Path) -> ConfigResult<Map<String, Value>> {
    let format = ConfigFormat::from_path(path).ok_or_else(|| {
        ConfigError::parse(path, "unsupported or missing file extension")
    })?;
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ConfigError::not_found("config file", path.display().to_string()),
        _ => ConfigError::access(path, e)
    })?;
    format.parse(&content, &path.display().to_string())
}

/// One discovered configuration file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigFileInfo {
    pub name: String,
    pub tier: SourceTier,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>
}

/// Result of reading the file set: parsed sources plus per-file failures.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub sources: Vec<ConfigSource>,
    pub failures: Vec<(ConfigFileInfo, ConfigError)>
}

/// Reads the configuration file set from disk.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: PathBuf,
    environment: String
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment: environment.into()
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Names of the sources that must be present.
    pub fn required_sources(&self) -> [&str; 2] {
        ["default", self.environment.as_str()]
    }

    /// Lists the files that make up the current file set.
    pub fn discover(&self) -> ConfigResult<Vec<ConfigFileInfo>> {
        let mut files = Vec::new();
        for (name, tier) in [
            ("default", SourceTier::Default),
            (self.environment.as_str(), SourceTier::Environment),
            ("override", SourceTier::Override),
        ] {
            if let Some(path) = self.find_logical(&self.config_dir, name) {
                files.push(file_info(name.to_string(), tier, path));
            }
        }
        for (dir, suffix, tier) in [
            (TEMPLATES_DIR, "template", SourceTier::Template),
            (PRESETS_DIR, "preset", SourceTier::Preset),
        ] {
            for (stem, path) in self.scan_dir(&self.config_dir.join(dir))? {
                files.push(file_info(format!("{stem}.{suffix}"), tier, path));
            }
        }
        let restored = self.restored_path();
        if restored.is_file() {
            files.push(file_info("restored".to_string(), SourceTier::Restored, restored));
        }
        files.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));
        Ok(files)
    }

    /// Parses every discovered file. A file that fails to parse is reported
    /// in [`LoadOutcome::failures`] and contributes no source.
    pub fn load_sources(&self) -> ConfigResult<LoadOutcome> {
        let mut outcome = LoadOutcome::default();
        for info in self.discover()? {
            match load_file(&info.path) {
                Ok(mapping) => {
                    debug!(source = %info.name, path = %info.path.display(), keys = mapping.len(), "loaded config source");
                    outcome.sources.push(
                        ConfigSource::new(info.name.clone(), info.tier, mapping).with_path(&info.path)
                    );
                }
                Err(err) => {
                    warn!(source = %info.name, error = %err, "failed to load config source");
                    outcome.failures.push((info, err));
                }
            }
        }
        Ok(outcome)
    }

    /// Path of a top-level logical file (`default`, `override`, an
    /// environment name), if present.
    pub fn find_logical(&self, dir: &Path, name: &str) -> Option<PathBuf> {
        let found: Vec<PathBuf> = RECOGNIZED_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{name}.{ext}")))
            .filter(|p| p.is_file())
            .collect();
        if found.len() > 1 {
            warn!(
                name,
                using = %found[0].display(),
                ignored = found.len() - 1,
                "multiple files for one config source"
            );
        }
        found.into_iter().next()
    }

    /// Where restores pin their snapshot.
    pub fn restored_path(&self) -> PathBuf {
        self.config_dir.join(RESTORED_FILE)
    }

    /// The existing `default` file, or `default.yaml` when none exists yet.
    pub fn live_path(&self) -> PathBuf {
        self.find_logical(&self.config_dir, "default")
            .unwrap_or_else(|| self.config_dir.join("default.yaml"))
    }

    fn scan_dir(&self, dir: &Path) -> ConfigResult<BTreeMap<String, PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(ConfigError::access(dir, e))
        };
        let mut by_stem: BTreeMap<String, (usize, PathBuf)> = BTreeMap::new();
        for entry in entries {
            let path = entry.map_err(|e| ConfigError::access(dir, e))?.path();
            if !path.is_file() {
                continue;
            }
            let Some(rank) = extension_rank(&path) else {
                continue;
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match by_stem.get(&stem) {
                Some((existing, _)) if *existing <= rank => {
                    warn!(path = %path.display(), "ignoring duplicate config file");
                }
                _ => {
                    by_stem.insert(stem, (rank, path));
                }
            }
        }
        Ok(by_stem.into_iter().map(|(stem, (_, path))| (stem, path)).collect())
    }
}

fn extension_rank(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    RECOGNIZED_EXTENSIONS.iter().position(|e| *e == ext)
}

/// Whether `path` has a recognized configuration extension.
pub fn is_config_file(path: &Path) -> bool {
    extension_rank(path).is_some()
}

fn file_info(name: String, tier: SourceTier, path: PathBuf) -> ConfigFileInfo {
    let meta = std::fs::metadata(&path).ok();
    ConfigFileInfo {
        name,
        tier,
        size_bytes: meta.as_ref().map_or(0, std::fs::Metadata::len),
        modified: meta
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from),
        path
    }
}
