//! # Rollback Manager
//!
//! Content-addressed, integrity-checked version history with restore.
//!
//! Every version stores the gzip of the canonical JSON serialization of a
//! configuration. `content_hash` is the SHA-256 of the canonical text and
//! drives deduplication; `checksum` is the SHA-256 of the compressed bytes
//! and is verified before any content is used.
//!
//! # Locking
//! Each config id has its own arena lock, held for the whole of a backup,
//! rollback or deletion. The shared index cache has a second lock taken
//! only while persisting, always after the arena lock.

mod live;
mod storage;
mod version;

pub use live::{FileLiveConfig, LiveConfig};
pub use storage::{INDEX_FILE, VersionIndex, VersionStore, write_atomic};
pub use version::{
    BackupMetadata, ConfigVersion, RetentionPolicy, VersionArena, VersionLineage, VersionStatus,
    VersionType,
};

use crate::diff::ConfigDiff;
use crate::precedence::{ConfigSource, MergeStrategy, SourceTier, StrategyTable, merge_sources};
use crate::settings::ManagerSettings;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use errors::{ConfigError, ConfigResult};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether `config_id` is safe to embed in payload file names.
pub fn is_valid_config_id(config_id: &str) -> bool {
    !config_id.is_empty()
        && config_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionSettings {
    pub max_versions: usize,
    pub retention_days: u32,
    pub policy: RetentionPolicy
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_versions: 50,
            retention_days: 30,
            policy: RetentionPolicy::Delete
        }
    }
}

impl From<&ManagerSettings> for RetentionSettings {
    fn from(settings: &ManagerSettings) -> Self {
        Self {
            max_versions: settings.max_versions,
            retention_days: settings.retention_days,
            policy: settings.retention_policy
        }
    }
}

/// Result of a successful rollback.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub config_id: String,
    pub from_version: Option<u32>,
    pub to_version: u32,
    /// The `rollback` version holding the configuration that was replaced.
    pub backup: ConfigVersion,
    pub restored: Value
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionDetails {
    #[serde(flatten)]
    pub record: ConfigVersion,
    pub lineage: VersionLineage,
    pub payload_present: bool
}

/// Filter for [`RollbackManager::search_versions`]. Empty fields match all.
#[derive(Debug, Clone, Default)]
pub struct VersionQuery {
    pub config_id: Option<String>,
    /// Every listed tag must be present.
    pub tags: Vec<String>,
    pub version_type: Option<VersionType>,
    pub status: Option<VersionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>
}

impl VersionQuery {
    fn matches(&self, record: &ConfigVersion) -> bool {
        self.config_id.as_ref().is_none_or(|id| *id == record.config_id)
            && self.tags.iter().all(|tag| record.has_tag(tag))
            && self.version_type.is_none_or(|t| t == record.version_type)
            && self.status.is_none_or(|s| s == record.status)
            && self.since.is_none_or(|since| record.timestamp >= since)
            && self.until.is_none_or(|until| record.timestamp <= until)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VersionStatistics {
    pub total_versions: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_environment: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub total_size_bytes: u64,
    pub compressed_size_bytes: u64,
    /// Compressed bytes over raw bytes; 0 when nothing is stored.
    pub compression_ratio: f64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub config_id: String,
    pub checked: usize,
    pub corrupted: Vec<u32>
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    pub backup_dir: PathBuf,
    pub config_ids: Vec<String>,
    pub total_versions: usize,
    pub compressed_size_bytes: u64
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataExport {
    pub config_id: String,
    pub exported_at: DateTime<Utc>,
    pub versions: Vec<ConfigVersion>
}

/// Durable version history for any number of config ids.
pub struct RollbackManager {
    store: VersionStore,
    retention: RetentionSettings,
    arenas: DashMap<String, Arc<Mutex<VersionArena>>>,
    index: Mutex<VersionIndex>
}

impl RollbackManager {
    /// Opens (or creates) the version store in `dir`.
    pub fn open(dir: impl Into<PathBuf>, retention: RetentionSettings) -> ConfigResult<Self> {
        let store = VersionStore::open(dir)?;
        let index = store.load_index()?;
        let arenas = DashMap::new();
        for (config_id, records) in &index {
            arenas.insert(
                config_id.clone(),
                Arc::new(Mutex::new(VersionArena::from_records(records.clone())))
            );
        }
        info!(
            backup_dir = %store.dir().display(),
            config_ids = index.len(),
            "opened version store"
        );
        Ok(Self {
            store,
            retention,
            arenas,
            index: Mutex::new(index)
        })
    }

    pub fn backup_dir(&self) -> &std::path::Path {
        self.store.dir()
    }

    pub fn retention(&self) -> RetentionSettings {
        self.retention
    }

    fn arena(&self, config_id: &str) -> Arc<Mutex<VersionArena>> {
        self.arenas
            .entry(config_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VersionArena::default())))
            .clone()
    }

    fn existing_arena(&self, config_id: &str) -> Option<Arc<Mutex<VersionArena>>> {
        self.arenas.get(config_id).map(|entry| entry.value().clone())
    }

    /// Arena of a config id that must already hold `version`. Never creates
    /// an entry.
    fn known_arena(&self, config_id: &str, version: u32) -> ConfigResult<Arc<Mutex<VersionArena>>> {
        self.existing_arena(config_id)
            .ok_or_else(|| ConfigError::not_found("version", format!("{config_id} v{version}")))
    }

    /// Config ids that hold at least one version.
    fn config_ids(&self) -> Vec<String> {
        let handles: Vec<(String, Arc<Mutex<VersionArena>>)> = self
            .arenas
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut ids: Vec<String> = handles
            .into_iter()
            .filter(|(_, handle)| !handle.lock().is_empty())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    fn version_of(arena: &VersionArena, backup_file: &str) -> Option<u32> {
        arena
            .iter()
            .find(|r| r.backup_file == backup_file)
            .map(|r| r.version)
    }

    /// Current numbers of the versions stored in `files`.
    fn resolve(config_id: &str, arena: &VersionArena, files: &[String]) -> ConfigResult<Vec<u32>> {
        files
            .iter()
            .map(|file| {
                Self::version_of(arena, file)
                    .ok_or_else(|| ConfigError::not_found("version", format!("{config_id} {file}")))
            })
            .collect()
    }

    /// Writes the arena into the index. On failure the cache keeps its
    /// previous content and the arena is rebuilt from it.
    fn persist(&self, config_id: &str, arena: &mut VersionArena) -> ConfigResult<()> {
        let mut index = self.index.lock();
        let previous = if arena.is_empty() {
            index.remove(config_id)
        } else {
            index.insert(config_id.to_string(), arena.snapshot())
        };
        if let Err(err) = self.store.save_index(&index) {
            match previous {
                Some(records) => {
                    *arena = VersionArena::from_records(records.clone());
                    index.insert(config_id.to_string(), records);
                }
                None => {
                    *arena = VersionArena::default();
                    index.remove(config_id);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn with_children(arena: &VersionArena, record: &ConfigVersion) -> ConfigVersion {
        let mut record = record.clone();
        record.child_versions = arena.children(record.version);
        record
    }

    /// Snapshots `config` as a new version of `config_id`.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// Stores an immutable, hashed, compressed version. When an active
    /// version with identical content already exists and the version type
    /// deduplicates, that version is returned instead.
    ///
    /// ## Usage
    /// ```rust,no_run
    /// use config::rollback::{BackupMetadata, RetentionSettings, RollbackManager, VersionType};
    /// use serde_json::json;
    ///
    /// fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let manager = RollbackManager::open("config/backups", RetentionSettings::default())?;
    ///     let meta = BackupMetadata::new(VersionType::Manual).author("ops").reason("before deploy");
    ///     let version = manager.create_backup("main", &json!({"a": 1}), meta)?;
    ///     println!("stored v{}", version.version);
    ///     Ok(())
    /// }
    /// ```
    ///
    /// ## Error Handling
    /// I/O failures surface as `ConfigError::Access` and are not retried.
    pub fn create_backup(
        &self,
        config_id: &str,
        config: &Value,
        meta: BackupMetadata
    ) -> ConfigResult<ConfigVersion> {
        if !is_valid_config_id(config_id) {
            return Err(ConfigError::Validation {
                violations: vec![format!("invalid config id '{config_id}'")]
            });
        }
        let handle = self.arena(config_id);
        let mut arena = handle.lock();
        self.create_locked(config_id, &mut arena, config, &[], |_| meta.clone())
    }

    /// Stores a new version.
    ///
    /// `refs` are the payload files of versions the new one refers to. They
    /// survive retention, and `meta` is built from their version numbers as
    /// they stand after retention has made room, so tags and lineage never
    /// name a stale number.
    fn create_locked<F>(
        &self,
        config_id: &str,
        arena: &mut VersionArena,
        config: &Value,
        refs: &[String],
        build: F
    ) -> ConfigResult<ConfigVersion>
    where
        F: Fn(&[u32]) -> BackupMetadata
    {
        let canonical = utils::canonical_json(config);
        let content_hash = utils::compute_content_hash(&canonical);

        let mut meta = build(&Self::resolve(config_id, arena, refs)?);
        if meta.version_type.deduplicates() {
            if let Some(existing) = arena.find_active_by_hash(&content_hash) {
                debug!(config_id, version = existing.version, "identical content, reusing version");
                return Ok(Self::with_children(arena, existing));
            }
        }
        if self.make_room(config_id, arena, refs)? > 0 {
            meta = build(&Self::resolve(config_id, arena, refs)?);
        }
        if let Some(parent) = meta.parent {
            if arena.get(parent).is_none() {
                return Err(ConfigError::not_found("version", format!("{config_id} v{parent}")));
            }
        }

        let compressed = utils::gzip_compress(canonical.as_bytes())
            .map_err(|e| ConfigError::access(self.store.dir(), e))?;
        let checksum = utils::compute_checksum(&compressed);
        let now = Utc::now();
        let version = arena.next_version();
        let backup_file = self.store.allocate_name(config_id, version, now.timestamp());
        self.store.write_payload(&backup_file, &compressed)?;

        let mut tags = Vec::new();
        for tag in meta.tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        let record = ConfigVersion {
            config_id: config_id.to_string(),
            version,
            timestamp: now,
            author: meta.author.unwrap_or_else(|| "system".to_string()),
            reason: meta.reason.unwrap_or_default(),
            version_type: meta.version_type,
            environment: meta.environment,
            content_hash,
            checksum,
            size_bytes: canonical.len() as u64,
            compressed_size: compressed.len() as u64,
            backup_file: backup_file.clone(),
            parent_version: meta.parent.or_else(|| arena.latest().map(|r| r.version)),
            child_versions: Vec::new(),
            merged_from: meta.merged_from,
            tags,
            status: VersionStatus::Active
        };
        arena.push(record);
        if let Err(err) = self.persist(config_id, arena) {
            if let Err(cleanup) = self.store.remove_payload(&backup_file) {
                warn!(file = %backup_file, error = %cleanup, "failed to remove orphaned payload");
            }
            return Err(err);
        }
        info!(
            config_id,
            version,
            version_type = %meta.version_type,
            "created configuration version"
        );

        let mut protected = refs.to_vec();
        protected.push(backup_file);
        self.archive_excess(config_id, arena, &protected)?;

        arena
            .get(version)
            .map(|r| Self::with_children(arena, r))
            .ok_or_else(|| ConfigError::not_found("version", format!("{config_id} v{version}")))
    }

    /// Delete policy: removes the oldest unprotected versions until one
    /// more fits under the count limit. Runs before a version is numbered.
    fn make_room(
        &self,
        config_id: &str,
        arena: &mut VersionArena,
        protect: &[String]
    ) -> ConfigResult<usize> {
        if self.retention.policy != RetentionPolicy::Delete {
            return Ok(0);
        }
        let max = self.retention.max_versions.max(1);
        let mut removed = 0;
        while arena.len() >= max {
            let Some(oldest) = arena
                .iter()
                .find(|r| !protect.contains(&r.backup_file))
                .map(|r| r.version)
            else {
                break;
            };
            self.delete_locked(config_id, arena, oldest)?;
            removed += 1;
        }
        if removed > 0 {
            info!(config_id, removed, "applied version count limit");
        }
        Ok(removed)
    }

    /// Archive policy: archives the oldest unprotected active versions
    /// beyond the count limit. Numbers do not change.
    fn archive_excess(
        &self,
        config_id: &str,
        arena: &mut VersionArena,
        protect: &[String]
    ) -> ConfigResult<usize> {
        if self.retention.policy != RetentionPolicy::Archive {
            return Ok(0);
        }
        let max = self.retention.max_versions.max(1);
        let active: Vec<(u32, String)> = arena
            .iter()
            .filter(|r| r.status == VersionStatus::Active)
            .map(|r| (r.version, r.backup_file.clone()))
            .collect();
        let excess = active.len().saturating_sub(max);
        let mut archived = 0;
        for (version, _) in active
            .into_iter()
            .filter(|(_, file)| !protect.contains(file))
            .take(excess)
        {
            arena.set_status(version, VersionStatus::Archived);
            archived += 1;
        }
        if archived > 0 {
            self.persist(config_id, arena)?;
            info!(config_id, archived, "applied version count limit");
        }
        Ok(archived)
    }

    fn delete_locked(
        &self,
        config_id: &str,
        arena: &mut VersionArena,
        version: u32
    ) -> ConfigResult<ConfigVersion> {
        let removed = arena
            .remove(version)
            .ok_or_else(|| ConfigError::not_found("version", format!("{config_id} v{version}")))?;
        self.persist(config_id, arena)?;
        if let Err(err) = self.store.remove_payload(&removed.backup_file) {
            warn!(file = %removed.backup_file, error = %err, "failed to remove payload of deleted version");
        }
        debug!(config_id, version, "deleted version");
        Ok(removed)
    }

    /// Reads and verifies a version's payload. Every failure is an
    /// integrity error.
    fn read_verified(&self, record: &ConfigVersion) -> ConfigResult<Value> {
        let integrity = |reason: String| ConfigError::Integrity {
            config_id: record.config_id.clone(),
            version: record.version,
            reason
        };
        let bytes = self.store.read_payload(&record.backup_file).map_err(|e| match e {
            ConfigError::NotFound { .. } => integrity(format!("payload {} is missing", record.backup_file)),
            other => integrity(other.to_string())
        })?;
        if utils::compute_checksum(&bytes) != record.checksum {
            return Err(integrity("checksum mismatch".to_string()));
        }
        let raw = utils::gzip_decompress(&bytes)
            .map_err(|e| integrity(format!("payload does not decompress: {e}")))?;
        let text = String::from_utf8(raw).map_err(|e| integrity(e.to_string()))?;
        if utils::compute_content_hash(&text) != record.content_hash {
            return Err(integrity("content hash mismatch".to_string()));
        }
        serde_json::from_str(&text).map_err(|e| integrity(e.to_string()))
    }

    /// Verified content of `version`. A version that fails verification is
    /// flagged corrupted.
    fn read_locked(
        &self,
        config_id: &str,
        arena: &mut VersionArena,
        version: u32
    ) -> ConfigResult<(ConfigVersion, Value)> {
        let record = arena
            .get(version)
            .cloned()
            .ok_or_else(|| ConfigError::not_found("version", format!("{config_id} v{version}")))?;
        if !record.is_restorable() {
            return Err(ConfigError::Integrity {
                config_id: config_id.to_string(),
                version,
                reason: format!("version is {}", record.status)
            });
        }
        match self.read_verified(&record) {
            Ok(value) => Ok((record, value)),
            Err(err) => {
                warn!(config_id, version, error = %err, "marking version corrupted");
                arena.set_status(version, VersionStatus::Corrupted);
                if let Err(persist_err) = self.persist(config_id, arena) {
                    warn!(config_id, error = %persist_err, "failed to persist corrupted status");
                }
                Err(err)
            }
        }
    }

    /// Verified content of one version.
    pub fn load_version(&self, config_id: &str, version: u32) -> ConfigResult<Value> {
        let handle = self.known_arena(config_id, version)?;
        let mut arena = handle.lock();
        self.read_locked(config_id, &mut arena, version)
            .map(|(_, value)| value)
    }

    /// Restores `target` into `live`.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// Verifies the target payload, snapshots the current live
    /// configuration as a `rollback` version, then writes the target
    /// content through [`LiveConfig::restore`]. Retention may renumber
    /// versions while the snapshot is stored; the outcome and the
    /// `rollback_to:v<N>` tag carry the numbers as they stand afterwards.
    ///
    /// ## Error Handling
    /// - `NotFound` when the version does not exist
    /// - `Integrity` when the payload is missing or fails its checksum; the
    ///   version is flagged corrupted and `live` is not touched
    pub fn rollback_to_version(
        &self,
        config_id: &str,
        target: u32,
        live: &dyn LiveConfig,
        author: &str
    ) -> ConfigResult<RollbackOutcome> {
        let handle = self.known_arena(config_id, target)?;
        let mut arena = handle.lock();

        let (record, restored) = self.read_locked(config_id, &mut arena, target)?;
        let current = live.current()?;
        let from_file = arena.latest().map(|r| r.backup_file.clone());

        let backup = self.create_locked(
            config_id,
            &mut arena,
            &current,
            std::slice::from_ref(&record.backup_file),
            |refs| {
                let to = refs.first().copied().unwrap_or(target);
                BackupMetadata::new(VersionType::Rollback)
                    .author(author)
                    .reason(format!("Backup before rollback to v{to}"))
                    .tag("rollback")
                    .tag(format!("rollback_to:v{to}"))
            }
        )?;
        let to_version = Self::version_of(&arena, &record.backup_file).ok_or_else(|| {
            ConfigError::not_found("version", format!("{config_id} {}", record.backup_file))
        })?;
        let from_version = from_file.and_then(|file| Self::version_of(&arena, &file));

        live.restore(&restored)?;
        warn!(
            config_id,
            from = ?from_version,
            to = to_version,
            target = %live.describe(),
            "rolled back configuration"
        );
        Ok(RollbackOutcome {
            config_id: config_id.to_string(),
            from_version,
            to_version,
            backup,
            restored
        })
    }

    pub fn get_versions(&self, config_id: &str) -> Vec<ConfigVersion> {
        self.existing_arena(config_id)
            .map(|handle| handle.lock().snapshot())
            .unwrap_or_default()
    }

    pub fn get_version(&self, config_id: &str, version: u32) -> Option<ConfigVersion> {
        let handle = self.existing_arena(config_id)?;
        let arena = handle.lock();
        arena.get(version).map(|r| Self::with_children(&arena, r))
    }

    pub fn get_latest_version(&self, config_id: &str) -> Option<ConfigVersion> {
        let handle = self.existing_arena(config_id)?;
        let arena = handle.lock();
        arena.latest().map(|r| Self::with_children(&arena, r))
    }

    /// Newest versions first.
    pub fn get_history(&self, config_id: &str, limit: usize) -> Vec<ConfigVersion> {
        let mut versions = self.get_versions(config_id);
        versions.reverse();
        versions.truncate(limit);
        versions
    }

    pub fn get_version_lineage(&self, config_id: &str, version: u32) -> ConfigResult<VersionLineage> {
        self.existing_arena(config_id)
            .and_then(|handle| handle.lock().lineage(version))
            .ok_or_else(|| ConfigError::not_found("version", format!("{config_id} v{version}")))
    }

    pub fn get_version_details(&self, config_id: &str, version: u32) -> ConfigResult<VersionDetails> {
        let record = self
            .get_version(config_id, version)
            .ok_or_else(|| ConfigError::not_found("version", format!("{config_id} v{version}")))?;
        let lineage = self.get_version_lineage(config_id, version)?;
        let payload_present = self.store.payload_exists(&record.backup_file);
        Ok(VersionDetails {
            record,
            lineage,
            payload_present
        })
    }

    /// Top-level structural diff from `from` to `to`.
    pub fn compare_versions(&self, config_id: &str, from: u32, to: u32) -> ConfigResult<ConfigDiff> {
        let handle = self.known_arena(config_id, from)?;
        let mut arena = handle.lock();
        let (_, old) = self.read_locked(config_id, &mut arena, from)?;
        let (_, new) = self.read_locked(config_id, &mut arena, to)?;
        Ok(ConfigDiff::between(&old, &new))
    }

    /// Records a branch off `base` without touching the live configuration.
    pub fn create_branch(
        &self,
        config_id: &str,
        base: u32,
        branch_name: &str,
        author: &str
    ) -> ConfigResult<ConfigVersion> {
        let handle = self.known_arena(config_id, base)?;
        let mut arena = handle.lock();
        let (record, content) = self.read_locked(config_id, &mut arena, base)?;
        self.create_locked(
            config_id,
            &mut arena,
            &content,
            std::slice::from_ref(&record.backup_file),
            |refs| {
                let base = refs.first().copied().unwrap_or(base);
                BackupMetadata::new(VersionType::Branch)
                    .author(author)
                    .reason(format!("Branch '{branch_name}' from v{base}"))
                    .parent(base)
                    .tag(format!("branch:{branch_name}"))
                    .tag(format!("base:v{base}"))
            }
        )
    }

    /// Records `source` merged into `target` as a new version whose parent
    /// is `target`. Mappings merge recursively with `source` winning.
    pub fn merge_versions(
        &self,
        config_id: &str,
        source: u32,
        target: u32,
        author: &str
    ) -> ConfigResult<ConfigVersion> {
        let handle = self.known_arena(config_id, target)?;
        let mut arena = handle.lock();
        let (target_record, base) = self.read_locked(config_id, &mut arena, target)?;
        let (source_record, overlay) = self.read_locked(config_id, &mut arena, source)?;

        let as_source = |name: String, tier: SourceTier, value: Value| {
            ConfigSource::new(name, tier, value.as_object().cloned().unwrap_or_default())
        };
        let mut table = StrategyTable::new();
        table.set("*", MergeStrategy::Merge);
        let merged = merge_sources(
            &[
                as_source(format!("v{target}"), SourceTier::Default, base),
                as_source(format!("v{source}"), SourceTier::Override, overlay),
            ],
            &table
        )?;

        let refs = [target_record.backup_file, source_record.backup_file];
        self.create_locked(config_id, &mut arena, &merged, &refs, |numbers| {
            let target = numbers.first().copied().unwrap_or(target);
            let source = numbers.get(1).copied().unwrap_or(source);
            BackupMetadata::new(VersionType::Merge)
                .author(author)
                .reason(format!("Merge v{source} into v{target}"))
                .parent(target)
                .merged_from(source)
                .tag(format!("merge:v{source}"))
        })
    }

    pub fn tag_version(
        &self,
        config_id: &str,
        version: u32,
        tags: &[String]
    ) -> ConfigResult<ConfigVersion> {
        let handle = self.known_arena(config_id, version)?;
        let mut arena = handle.lock();
        if arena.add_tags(version, tags).is_none() {
            return Err(ConfigError::not_found("version", format!("{config_id} v{version}")));
        }
        self.persist(config_id, &mut arena)?;
        arena
            .get(version)
            .map(|r| Self::with_children(&arena, r))
            .ok_or_else(|| ConfigError::not_found("version", format!("{config_id} v{version}")))
    }

    /// Hard-deletes one version and renumbers the rest.
    pub fn delete_version(&self, config_id: &str, version: u32) -> ConfigResult<ConfigVersion> {
        let handle = self.known_arena(config_id, version)?;
        let mut arena = handle.lock();
        self.delete_locked(config_id, &mut arena, version)
    }

    /// Hard-deletes the oldest versions until at most `keep` remain.
    pub fn cleanup_backups(&self, config_id: &str, keep: usize) -> ConfigResult<usize> {
        let Some(handle) = self.existing_arena(config_id) else {
            return Ok(0);
        };
        let mut arena = handle.lock();
        let mut removed = 0;
        while arena.len() > keep {
            let Some(oldest) = arena.iter().next().map(|r| r.version) else {
                break;
            };
            self.delete_locked(config_id, &mut arena, oldest)?;
            removed += 1;
        }
        if removed > 0 {
            info!(config_id, removed, keep, "cleaned up old versions");
        }
        Ok(removed)
    }

    /// Applies the age limit to machine-created (`auto`, `scheduled`)
    /// versions of every config id. The newest version is always kept.
    pub fn cleanup_expired_versions(&self) -> ConfigResult<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(self.retention.retention_days));
        let mut affected = 0;
        for config_id in self.config_ids() {
            let Some(handle) = self.existing_arena(&config_id) else {
                continue;
            };
            let mut arena = handle.lock();
            let latest = arena.latest().map(|r| r.version);
            let expired: Vec<String> = arena
                .iter()
                .filter(|r| {
                    matches!(r.version_type, VersionType::Auto | VersionType::Scheduled)
                        && r.status == VersionStatus::Active
                        && r.timestamp < cutoff
                        && Some(r.version) != latest
                })
                .map(|r| r.backup_file.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            match self.retention.policy {
                RetentionPolicy::Archive => {
                    for file in &expired {
                        let found = Self::version_of(&arena, file);
                        if let Some(version) = found {
                            arena.set_status(version, VersionStatus::Archived);
                        }
                    }
                    self.persist(&config_id, &mut arena)?;
                }
                RetentionPolicy::Delete => {
                    for file in &expired {
                        let found = Self::version_of(&arena, file);
                        if let Some(version) = found {
                            self.delete_locked(&config_id, &mut arena, version)?;
                        }
                    }
                }
            }
            info!(config_id = %config_id, count = expired.len(), "expired versions processed");
            affected += expired.len();
        }
        Ok(affected)
    }

    pub fn search_versions(&self, query: &VersionQuery) -> Vec<ConfigVersion> {
        let mut found = Vec::new();
        for config_id in self.config_ids() {
            if query.config_id.as_ref().is_some_and(|id| *id != config_id) {
                continue;
            }
            found.extend(
                self.get_versions(&config_id)
                    .into_iter()
                    .filter(|r| query.matches(r))
            );
        }
        found
    }

    /// Statistics for one config id, or for all when `None`.
    pub fn get_version_statistics(&self, config_id: Option<&str>) -> VersionStatistics {
        let query = VersionQuery {
            config_id: config_id.map(str::to_string),
            ..VersionQuery::default()
        };
        let versions = self.search_versions(&query);

        let mut stats = VersionStatistics {
            total_versions: versions.len(),
            ..VersionStatistics::default()
        };
        for record in &versions {
            *stats.by_type.entry(record.version_type.to_string()).or_default() += 1;
            *stats.by_status.entry(record.status.to_string()).or_default() += 1;
            let env = record.environment.clone().unwrap_or_else(|| "unknown".to_string());
            *stats.by_environment.entry(env).or_default() += 1;
            stats.total_size_bytes += record.size_bytes;
            stats.compressed_size_bytes += record.compressed_size;
        }
        if stats.total_size_bytes > 0 {
            stats.compression_ratio =
                stats.compressed_size_bytes as f64 / stats.total_size_bytes as f64;
        }
        stats.oldest = versions.iter().map(|r| r.timestamp).min();
        stats.newest = versions.iter().map(|r| r.timestamp).max();
        stats
    }

    pub fn export_version_metadata(&self, config_id: &str) -> ConfigResult<MetadataExport> {
        let versions = self.get_versions(config_id);
        if versions.is_empty() {
            return Err(ConfigError::not_found("config id", config_id));
        }
        Ok(MetadataExport {
            config_id: config_id.to_string(),
            exported_at: Utc::now(),
            versions
        })
    }

    /// Re-verifies every restorable version, flagging failures corrupted.
    pub fn verify_integrity(&self, config_id: &str) -> ConfigResult<IntegrityReport> {
        let Some(handle) = self.existing_arena(config_id) else {
            return Ok(IntegrityReport {
                config_id: config_id.to_string(),
                checked: 0,
                corrupted: Vec::new()
            });
        };
        let mut arena = handle.lock();
        let candidates: Vec<ConfigVersion> =
            arena.iter().filter(|r| r.is_restorable()).cloned().collect();
        let mut corrupted = Vec::new();
        for record in &candidates {
            if let Err(err) = self.read_verified(record) {
                warn!(config_id, version = record.version, error = %err, "integrity check failed");
                arena.set_status(record.version, VersionStatus::Corrupted);
                corrupted.push(record.version);
            }
        }
        if !corrupted.is_empty() {
            self.persist(config_id, &mut arena)?;
        }
        Ok(IntegrityReport {
            config_id: config_id.to_string(),
            checked: candidates.len(),
            corrupted
        })
    }

    pub fn backup_info(&self) -> BackupInfo {
        let stats = self.get_version_statistics(None);
        BackupInfo {
            backup_dir: self.store.dir().to_path_buf(),
            config_ids: self.config_ids(),
            total_versions: stats.total_versions,
            compressed_size_bytes: stats.compressed_size_bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> RollbackManager {
        RollbackManager::open(dir.path().join("backups"), RetentionSettings::default()).unwrap()
    }

    fn manual() -> BackupMetadata {
        BackupMetadata::new(VersionType::Manual).author("test")
    }

    #[test]
    fn test_create_backup_dedups_identical_content() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let v1 = mgr.create_backup("main", &json!({"a": 1}), manual()).unwrap();
        let again = mgr.create_backup("main", &json!({"a": 1}), manual()).unwrap();
        let v2 = mgr.create_backup("main", &json!({"a": 2}), manual()).unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(again.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.parent_version, Some(1));
        assert_eq!(mgr.get_version("main", 1).unwrap().child_versions, vec![2]);
    }

    #[test]
    fn test_payload_and_index_on_disk() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let v1 = mgr.create_backup("main", &json!({"a": 1}), manual()).unwrap();

        assert!(v1.backup_file.starts_with("main_v1_"));
        assert!(v1.backup_file.ends_with(".dat"));
        let payload = fs::read(mgr.backup_dir().join(&v1.backup_file)).unwrap();
        assert_eq!(utils::compute_checksum(&payload), v1.checksum);

        let reopened = manager(&dir);
        assert_eq!(reopened.get_versions("main").len(), 1);
        assert_eq!(reopened.load_version("main", 1).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_rollback_creates_rollback_version_first() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let live_path = dir.path().join("default.yaml");
        fs::write(&live_path, "a: 2\n").unwrap();
        let live = FileLiveConfig::new(&live_path);

        mgr.create_backup("main", &json!({"a": 1}), manual()).unwrap();
        mgr.create_backup("main", &json!({"a": 2}), manual()).unwrap();

        let outcome = mgr.rollback_to_version("main", 1, &live, "ops").unwrap();
        assert_eq!(outcome.from_version, Some(2));
        assert_eq!(outcome.backup.version, 3);
        assert_eq!(outcome.backup.version_type, VersionType::Rollback);
        assert!(outcome.backup.has_tag("rollback"));
        assert_eq!(mgr.load_version("main", 3).unwrap(), json!({"a": 2}));
        assert_eq!(live.current().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_corrupted_payload_blocks_rollback() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let live_path = dir.path().join("default.yaml");
        fs::write(&live_path, "a: 2\n").unwrap();
        let live = FileLiveConfig::new(&live_path);

        let v1 = mgr.create_backup("main", &json!({"a": 1}), manual()).unwrap();
        let payload_path = mgr.backup_dir().join(&v1.backup_file);
        let mut bytes = fs::read(&payload_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&payload_path, bytes).unwrap();

        let err = mgr.rollback_to_version("main", 1, &live, "ops").unwrap_err();
        assert_eq!(err.kind(), errors::ErrorKind::Integrity);
        assert_eq!(fs::read_to_string(&live_path).unwrap(), "a: 2\n");
        assert_eq!(mgr.get_version("main", 1).unwrap().status, VersionStatus::Corrupted);
        assert_eq!(mgr.get_versions("main").len(), 1);
    }

    #[test]
    fn test_missing_payload_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let v1 = mgr.create_backup("main", &json!({"a": 1}), manual()).unwrap();
        fs::remove_file(mgr.backup_dir().join(&v1.backup_file)).unwrap();

        let err = mgr.load_version("main", 1).unwrap_err();
        assert_eq!(err.kind(), errors::ErrorKind::Integrity);
        assert!(!mgr.get_version_details("main", 1).unwrap().payload_present);
    }

    #[test]
    fn test_rollback_unknown_version_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let live = FileLiveConfig::new(dir.path().join("default.yaml"));
        let err = mgr.rollback_to_version("main", 7, &live, "ops").unwrap_err();
        assert_eq!(err.kind(), errors::ErrorKind::NotFound);
    }

    #[test]
    fn test_count_limit_deletes_oldest_and_renumbers() {
        let dir = TempDir::new().unwrap();
        let retention = RetentionSettings {
            max_versions: 2,
            ..RetentionSettings::default()
        };
        let mgr = RollbackManager::open(dir.path(), retention).unwrap();
        let first = mgr.create_backup("main", &json!({"n": 1}), manual()).unwrap();
        mgr.create_backup("main", &json!({"n": 2}), manual()).unwrap();
        let newest = mgr.create_backup("main", &json!({"n": 3}), manual()).unwrap();

        assert_eq!(newest.version, 2);
        let versions: Vec<u32> = mgr.get_versions("main").iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(mgr.load_version("main", 1).unwrap(), json!({"n": 2}));
        assert!(!mgr.backup_dir().join(&first.backup_file).exists());
    }

    #[test]
    fn test_count_limit_archive_policy() {
        let dir = TempDir::new().unwrap();
        let retention = RetentionSettings {
            max_versions: 1,
            policy: RetentionPolicy::Archive,
            ..RetentionSettings::default()
        };
        let mgr = RollbackManager::open(dir.path(), retention).unwrap();
        mgr.create_backup("main", &json!({"n": 1}), manual()).unwrap();
        mgr.create_backup("main", &json!({"n": 2}), manual()).unwrap();

        let statuses: Vec<VersionStatus> = mgr.get_versions("main").iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![VersionStatus::Archived, VersionStatus::Active]);

        // archived content no longer deduplicates
        let again = mgr.create_backup("main", &json!({"n": 1}), manual()).unwrap();
        assert_eq!(again.version, 3);
    }

    #[test]
    fn test_branch_merge_and_lineage() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.create_backup("main", &json!({"api": {"port": 1}}), manual()).unwrap();
        mgr.create_backup("main", &json!({"api": {"port": 2}, "x": 1}), manual()).unwrap();

        let branch = mgr.create_branch("main", 1, "experiment", "dev").unwrap();
        assert_eq!(branch.version, 3);
        assert_eq!(branch.parent_version, Some(1));
        assert!(branch.has_tag("branch:experiment"));
        assert!(branch.has_tag("base:v1"));

        let merged = mgr.merge_versions("main", 3, 2, "dev").unwrap();
        assert_eq!(merged.version, 4);
        assert_eq!(merged.parent_version, Some(2));
        assert_eq!(merged.merged_from, vec![3]);
        assert_eq!(mgr.load_version("main", 4).unwrap(), json!({"api": {"port": 1}, "x": 1}));

        let lineage = mgr.get_version_lineage("main", 1).unwrap();
        assert_eq!(lineage.descendants, vec![2, 3, 4]);
        assert_eq!(mgr.get_version_lineage("main", 4).unwrap().ancestors, vec![2, 1]);
    }

    #[test]
    fn test_compare_versions() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.create_backup("main", &json!({"a": 1, "b": 1}), manual()).unwrap();
        mgr.create_backup("main", &json!({"a": 1, "b": 2, "c": 3}), manual()).unwrap();

        let diff = mgr.compare_versions("main", 1, 2).unwrap();
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.modified, vec!["b"]);
        assert_eq!(diff.unchanged, vec!["a"]);
    }

    #[test]
    fn test_tag_delete_and_history() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        for n in 1..=3 {
            mgr.create_backup("main", &json!({"n": n}), manual()).unwrap();
        }
        let tagged = mgr
            .tag_version("main", 2, &["stable".to_string(), "stable".to_string()])
            .unwrap();
        assert_eq!(tagged.tags, vec!["stable"]);

        let history: Vec<u32> = mgr.get_history("main", 2).iter().map(|r| r.version).collect();
        assert_eq!(history, vec![3, 2]);

        mgr.delete_version("main", 2).unwrap();
        let remaining = mgr.get_versions("main");
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[1].version, 2);
        assert_eq!(remaining[1].parent_version, Some(1));
        assert_eq!(mgr.load_version("main", 2).unwrap(), json!({"n": 3}));
    }

    #[test]
    fn test_cleanup_backups_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        for n in 1..=4 {
            mgr.create_backup("main", &json!({"n": n}), manual()).unwrap();
        }
        assert_eq!(mgr.cleanup_backups("main", 1).unwrap(), 3);
        assert_eq!(mgr.load_version("main", 1).unwrap(), json!({"n": 4}));
    }

    #[test]
    fn test_cleanup_expired_auto_versions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backups");
        {
            let mgr = manager(&dir);
            let auto = || BackupMetadata::new(VersionType::Auto);
            mgr.create_backup("main", &json!({"n": 1}), auto()).unwrap();
            mgr.create_backup("main", &json!({"n": 2}), manual()).unwrap();
            mgr.create_backup("main", &json!({"n": 3}), auto()).unwrap();
        }
        let store = VersionStore::open(&path).unwrap();
        let mut index = store.load_index().unwrap();
        for record in index.get_mut("main").unwrap() {
            record.timestamp = Utc::now() - Duration::days(90);
        }
        store.save_index(&index).unwrap();

        let mgr = RollbackManager::open(&path, RetentionSettings::default()).unwrap();
        assert_eq!(mgr.cleanup_expired_versions().unwrap(), 1);
        let types: Vec<VersionType> = mgr.get_versions("main").iter().map(|r| r.version_type).collect();
        assert_eq!(types, vec![VersionType::Manual, VersionType::Auto]);
    }

    #[test]
    fn test_cleanup_expired_archive_policy_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backups");
        {
            let mgr = manager(&dir);
            let auto = || BackupMetadata::new(VersionType::Auto);
            mgr.create_backup("main", &json!({"n": 1}), auto()).unwrap();
            mgr.create_backup("main", &json!({"n": 2}), auto()).unwrap();
        }
        let store = VersionStore::open(&path).unwrap();
        let mut index = store.load_index().unwrap();
        for record in index.get_mut("main").unwrap() {
            record.timestamp = Utc::now() - Duration::days(90);
        }
        store.save_index(&index).unwrap();

        let retention = RetentionSettings {
            policy: RetentionPolicy::Archive,
            ..RetentionSettings::default()
        };
        let mgr = RollbackManager::open(&path, retention).unwrap();
        assert_eq!(mgr.cleanup_expired_versions().unwrap(), 1);
        let statuses: Vec<VersionStatus> = mgr.get_versions("main").iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![VersionStatus::Archived, VersionStatus::Active]);
        assert_eq!(mgr.load_version("main", 1).unwrap(), json!({"n": 1}));
    }

    #[test]
    fn test_rollback_at_count_limit_reports_renumbered_target() {
        let dir = TempDir::new().unwrap();
        let retention = RetentionSettings {
            max_versions: 2,
            ..RetentionSettings::default()
        };
        let mgr = RollbackManager::open(dir.path().join("backups"), retention).unwrap();
        let live_path = dir.path().join("default.yaml");
        fs::write(&live_path, "n: 0\n").unwrap();
        let live = FileLiveConfig::new(&live_path);

        mgr.create_backup("main", &json!({"n": 1}), manual()).unwrap();
        mgr.create_backup("main", &json!({"n": 2}), manual()).unwrap();

        let outcome = mgr.rollback_to_version("main", 2, &live, "ops").unwrap();
        assert_eq!(outcome.to_version, 1);
        assert_eq!(outcome.from_version, Some(1));
        assert_eq!(outcome.backup.version, 2);
        assert!(outcome.backup.has_tag("rollback_to:v1"));
        assert_eq!(outcome.backup.reason, "Backup before rollback to v1");
        assert_eq!(mgr.load_version("main", outcome.to_version).unwrap(), json!({"n": 2}));
        assert_eq!(mgr.load_version("main", 2).unwrap(), json!({"n": 0}));
        assert_eq!(live.current().unwrap(), json!({"n": 2}));
    }

    #[test]
    fn test_branch_at_count_limit_keeps_base_reference() {
        let dir = TempDir::new().unwrap();
        let retention = RetentionSettings {
            max_versions: 2,
            ..RetentionSettings::default()
        };
        let mgr = RollbackManager::open(dir.path(), retention).unwrap();
        mgr.create_backup("main", &json!({"n": 1}), manual()).unwrap();
        mgr.create_backup("main", &json!({"n": 2}), manual()).unwrap();

        let branch = mgr.create_branch("main", 2, "hotfix", "dev").unwrap();
        assert_eq!(branch.version, 2);
        assert_eq!(branch.parent_version, Some(1));
        assert!(branch.has_tag("base:v1"));
        assert_eq!(mgr.load_version("main", 1).unwrap(), json!({"n": 2}));
    }

    #[test]
    fn test_reads_of_unknown_config_do_not_register_it() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.create_backup("main", &json!({"n": 1}), manual()).unwrap();

        let report = mgr.verify_integrity("ghost").unwrap();
        assert_eq!(report.checked, 0);
        let err = mgr.compare_versions("ghost", 1, 2).unwrap_err();
        assert_eq!(err.kind(), errors::ErrorKind::NotFound);
        assert_eq!(mgr.load_version("", 1).unwrap_err().kind(), errors::ErrorKind::NotFound);
        assert_eq!(mgr.cleanup_backups("ghost", 0).unwrap(), 0);

        assert_eq!(mgr.backup_info().config_ids, vec!["main"]);
    }

    #[test]
    fn test_search_and_statistics() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.create_backup("main", &json!({"n": 1}), manual().environment("production").tag("release"))
            .unwrap();
        mgr.create_backup("main", &json!({"n": 2}), BackupMetadata::new(VersionType::Auto))
            .unwrap();
        mgr.create_backup("other", &json!({"n": 1}), manual()).unwrap();

        let tagged = mgr.search_versions(&VersionQuery {
            tags: vec!["release".to_string()],
            ..VersionQuery::default()
        });
        assert_eq!(tagged.len(), 1);

        let autos = mgr.search_versions(&VersionQuery {
            version_type: Some(VersionType::Auto),
            ..VersionQuery::default()
        });
        assert_eq!(autos.len(), 1);

        let stats = mgr.get_version_statistics(Some("main"));
        assert_eq!(stats.total_versions, 2);
        assert_eq!(stats.by_type.get("manual"), Some(&1));
        assert_eq!(stats.by_environment.get("production"), Some(&1));
        assert!(stats.compression_ratio > 0.0);

        let info = mgr.backup_info();
        assert_eq!(info.config_ids, vec!["main", "other"]);
        assert_eq!(info.total_versions, 3);
    }

    #[test]
    fn test_verify_integrity_flags_corruption() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.create_backup("main", &json!({"n": 1}), manual()).unwrap();
        let v2 = mgr.create_backup("main", &json!({"n": 2}), manual()).unwrap();
        fs::write(mgr.backup_dir().join(&v2.backup_file), b"garbage").unwrap();

        let report = mgr.verify_integrity("main").unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.corrupted, vec![2]);

        let export = mgr.export_version_metadata("main").unwrap();
        assert_eq!(export.versions[1].status, VersionStatus::Corrupted);
        assert!(mgr.export_version_metadata("missing").is_err());
    }

    #[test]
    fn test_invalid_config_id_rejected() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let err = mgr.create_backup("../x", &json!({}), manual()).unwrap_err();
        assert_eq!(err.kind(), errors::ErrorKind::Validation);
    }
}
