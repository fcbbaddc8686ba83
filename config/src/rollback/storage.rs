//! On-disk layout of the version store.
//!
//! ```text
//! <backup_dir>/versions.json               index: config_id -> [ConfigVersion]
//! <backup_dir>/<config_id>_v<N>_<ts>.dat   gzip of the canonical JSON
//! ```

use super::version::ConfigVersion;
use errors::{ConfigError, ConfigResult};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "versions.json";

pub type VersionIndex = BTreeMap<String, Vec<ConfigVersion>>;

#[derive(Debug, Clone)]
pub struct VersionStore {
    dir: PathBuf
}

impl VersionStore {
    /// Opens the store, creating the directory when needed.
    pub fn open(dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ConfigError::access(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn payload_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub fn load_index(&self) -> ConfigResult<VersionIndex> {
        let path = self.index_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(VersionIndex::new()),
            Err(e) => return Err(ConfigError::access(&path, e))
        };
        if content.trim().is_empty() {
            return Ok(VersionIndex::new());
        }
        serde_json::from_str(&content).map_err(|e| ConfigError::parse(&path, e))
    }

    /// Replaces the index atomically (write to a temp file, fsync, rename).
    pub fn save_index(&self, index: &VersionIndex) -> ConfigResult<()> {
        let body = serde_json::to_vec_pretty(index).map_err(ConfigError::serialization)?;
        write_atomic(&self.index_path(), &body)
    }

    /// Payload file name that does not exist yet.
    pub fn allocate_name(&self, config_id: &str, version: u32, unix_ts: i64) -> String {
        let base = format!("{config_id}_v{version}_{unix_ts}");
        let mut name = format!("{base}.dat");
        let mut attempt = 1;
        while self.payload_path(&name).exists() {
            name = format!("{base}_{attempt}.dat");
            attempt += 1;
        }
        name
    }

    /// Writes a new payload and syncs it to disk. Never overwrites.
    pub fn write_payload(&self, file_name: &str, bytes: &[u8]) -> ConfigResult<()> {
        let path = self.payload_path(file_name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| ConfigError::access(&path, e))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| ConfigError::access(&path, e))
    }

    pub fn read_payload(&self, file_name: &str) -> ConfigResult<Vec<u8>> {
        let path = self.payload_path(file_name);
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ConfigError::not_found("payload", path.display().to_string()),
            _ => ConfigError::access(&path, e)
        })
    }

    pub fn payload_exists(&self, file_name: &str) -> bool {
        self.payload_path(file_name).is_file()
    }

    /// Removes a payload; a missing file is not an error.
    pub fn remove_payload(&self, file_name: &str) -> ConfigResult<()> {
        let path = self.payload_path(file_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::access(&path, e))
        }
    }
}

/// Writes `bytes` next to `path` and renames over it once synced.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> ConfigResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("config");
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    let result = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(ConfigError::access(path, e));
    }
    Ok(())
}
