//! The live configuration a rollback restores into.

use super::storage::write_atomic;
use crate::file_loader::{ConfigFormat, load_file};
use errors::{ConfigError, ConfigResult, ErrorKind};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Read and replace the configuration currently in effect.
pub trait LiveConfig: Send + Sync {
    fn current(&self) -> ConfigResult<Value>;

    fn restore(&self, config: &Value) -> ConfigResult<()>;

    fn describe(&self) -> String;
}

/// A single configuration file. Restores write the file atomically and keep
/// the replaced content as `<file>.bak`.
#[derive(Debug, Clone)]
pub struct FileLiveConfig {
    path: PathBuf
}

impl FileLiveConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".bak");
        self.path.with_file_name(name)
    }
}

impl LiveConfig for FileLiveConfig {
    fn current(&self) -> ConfigResult<Value> {
        match load_file(&self.path) {
            Ok(map) => Ok(Value::Object(map)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Value::Object(Map::new())),
            Err(e) => Err(e)
        }
    }

    fn restore(&self, config: &Value) -> ConfigResult<()> {
        let format = ConfigFormat::from_path(&self.path).unwrap_or_default();
        let body = format.render(config)?;
        if self.path.is_file() {
            let backup = self.backup_path();
            std::fs::copy(&self.path, &backup).map_err(|e| ConfigError::access(&backup, e))?;
        }
        write_atomic(&self.path, body.as_bytes())?;
        tracing::info!(path = %self.path.display(), "live configuration restored");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
