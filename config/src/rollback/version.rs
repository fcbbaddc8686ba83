//! Version records and the per-config arena that holds them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Why a version was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionType {
    #[default]
    Manual,
    Auto,
    Scheduled,
    Rollback,
    Branch,
    Merge
}

impl VersionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Scheduled => "scheduled",
            Self::Rollback => "rollback",
            Self::Branch => "branch",
            Self::Merge => "merge"
        }
    }

    /// Snapshots of these types reuse an active version with equal content.
    /// Rollback, branch and merge versions record an event in the lineage
    /// and always get their own number.
    pub fn deduplicates(self) -> bool {
        matches!(self, Self::Manual | Self::Auto | Self::Scheduled)
    }
}

impl fmt::Display for VersionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "scheduled" => Ok(Self::Scheduled),
            "rollback" => Ok(Self::Rollback),
            "branch" => Ok(Self::Branch),
            "merge" => Ok(Self::Merge),
            other => Err(format!("unknown version type: {other}"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    #[default]
    Active,
    Archived,
    Deleted,
    Corrupted
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
            Self::Corrupted => "corrupted"
        };
        f.write_str(name)
    }
}

/// What happens to versions beyond the retention limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Remove the payload and renumber the remaining versions.
    #[default]
    Delete,
    /// Keep the payload and mark the version archived.
    Archive
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "delete" => Ok(Self::Delete),
            "archive" => Ok(Self::Archive),
            other => Err(format!("unknown retention policy: {other}"))
        }
    }
}

/// One stored snapshot. Everything but `status` and `tags` is fixed at
/// creation; `child_versions` is derived from the arena when persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub config_id: String,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub reason: String,
    pub version_type: VersionType,
    #[serde(default)]
    pub environment: Option<String>,
    pub content_hash: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub compressed_size: u64,
    pub backup_file: String,
    #[serde(default)]
    pub parent_version: Option<u32>,
    #[serde(default)]
    pub child_versions: Vec<u32>,
    #[serde(default)]
    pub merged_from: Vec<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: VersionStatus
}

impl ConfigVersion {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Versions whose content may be restored.
    pub fn is_restorable(&self) -> bool {
        matches!(self.status, VersionStatus::Active | VersionStatus::Archived)
    }
}

/// Caller-supplied description of a new version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupMetadata {
    pub author: Option<String>,
    pub reason: Option<String>,
    pub version_type: VersionType,
    pub environment: Option<String>,
    pub tags: Vec<String>,
    /// Parent override; defaults to the latest version.
    pub parent: Option<u32>,
    pub merged_from: Vec<u32>
}

impl BackupMetadata {
    pub fn new(version_type: VersionType) -> Self {
        Self {
            version_type,
            ..Self::default()
        }
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn parent(mut self, version: u32) -> Self {
        self.parent = Some(version);
        self
    }

    pub fn merged_from(mut self, version: u32) -> Self {
        self.merged_from.push(version);
        self
    }
}

/// Ancestors (nearest first) and descendants (breadth first) of a version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionLineage {
    pub version: u32,
    pub ancestors: Vec<u32>,
    pub descendants: Vec<u32>
}

/// Versions of one config id ordered by number.
///
/// Records are addressed by version number; lineage edges are version
/// numbers into the same arena.
#[derive(Debug, Clone, Default)]
pub struct VersionArena {
    records: Vec<ConfigVersion>
}

impl VersionArena {
    pub fn from_records(mut records: Vec<ConfigVersion>) -> Self {
        records.sort_by_key(|r| r.version);
        records.dedup_by_key(|r| r.version);
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ConfigVersion> {
        self.records.iter()
    }

    pub fn get(&self, version: u32) -> Option<&ConfigVersion> {
        let idx = self.index_of(version)?;
        self.records.get(idx)
    }

    fn index_of(&self, version: u32) -> Option<usize> {
        self.records.binary_search_by_key(&version, |r| r.version).ok()
    }

    pub fn next_version(&self) -> u32 {
        self.records.last().map_or(1, |r| r.version + 1)
    }

    /// Newest version that has not been deleted.
    pub fn latest(&self) -> Option<&ConfigVersion> {
        self.records
            .iter()
            .rev()
            .find(|r| r.status != VersionStatus::Deleted)
    }

    pub fn find_active_by_hash(&self, content_hash: &str) -> Option<&ConfigVersion> {
        self.records
            .iter()
            .rev()
            .find(|r| r.status == VersionStatus::Active && r.content_hash == content_hash)
    }

    pub fn push(&mut self, record: ConfigVersion) {
        debug_assert!(record.version >= self.next_version());
        self.records.push(record);
    }

    /// Removes the newest record; used to undo a push whose persistence
    /// failed.
    pub fn pop(&mut self) -> Option<ConfigVersion> {
        self.records.pop()
    }

    pub fn set_status(&mut self, version: u32, status: VersionStatus) -> bool {
        match self.index_of(version) {
            Some(idx) => {
                self.records[idx].status = status;
                true
            }
            None => false
        }
    }

    /// Adds tags not already present. Returns the updated record.
    pub fn add_tags(&mut self, version: u32, tags: &[String]) -> Option<&ConfigVersion> {
        let idx = self.index_of(version)?;
        let record = &mut self.records[idx];
        for tag in tags {
            if !record.tags.contains(tag) {
                record.tags.push(tag.clone());
            }
        }
        Some(&self.records[idx])
    }

    pub fn children(&self, version: u32) -> Vec<u32> {
        self.records
            .iter()
            .filter(|r| r.parent_version == Some(version) || r.merged_from.contains(&version))
            .map(|r| r.version)
            .collect()
    }

    pub fn lineage(&self, version: u32) -> Option<VersionLineage> {
        let record = self.get(version)?;

        let mut ancestors = Vec::new();
        let mut seen = BTreeSet::from([version]);
        let mut cursor = record.parent_version;
        while let Some(parent) = cursor {
            if !seen.insert(parent) {
                break;
            }
            ancestors.push(parent);
            cursor = self.get(parent).and_then(|r| r.parent_version);
        }

        let mut descendants = Vec::new();
        let mut queue: VecDeque<u32> = self.children(version).into();
        let mut visited = BTreeSet::from([version]);
        while let Some(child) = queue.pop_front() {
            if !visited.insert(child) {
                continue;
            }
            descendants.push(child);
            queue.extend(self.children(child));
        }

        Some(VersionLineage {
            version,
            ancestors,
            descendants
        })
    }

    /// Removes `version` and renumbers every later version down by one so
    /// numbering stays contiguous. Children of the removed version are
    /// re-parented to its parent.
    pub fn remove(&mut self, version: u32) -> Option<ConfigVersion> {
        let idx = self.index_of(version)?;
        let removed = self.records.remove(idx);
        let shift = |v: u32| if v > version { v - 1 } else { v };

        for record in &mut self.records {
            record.version = shift(record.version);
            record.parent_version = match record.parent_version {
                Some(p) if p == version => removed.parent_version.map(shift),
                other => other.map(shift)
            };
            record.merged_from = record
                .merged_from
                .iter()
                .filter(|v| **v != version)
                .map(|v| shift(*v))
                .collect();
            record.tags = record
                .tags
                .iter()
                .filter_map(|tag| renumber_tag(tag, version))
                .collect();
        }
        Some(removed)
    }

    /// Records with `child_versions` filled in.
    pub fn snapshot(&self) -> Vec<ConfigVersion> {
        self.records
            .iter()
            .map(|r| {
                let mut record = r.clone();
                record.child_versions = self.children(r.version);
                record
            })
            .collect()
    }
}

/// Tag prefixes whose suffix is a version number (`rollback_to:v3`).
pub const VERSION_TAG_PREFIXES: [&str; 3] = ["rollback_to:v", "base:v", "merge:v"];

/// Rewrites a version-referencing tag after `removed` was deleted. Tags
/// naming the removed version are dropped; other tags pass through.
fn renumber_tag(tag: &str, removed: u32) -> Option<String> {
    for prefix in VERSION_TAG_PREFIXES {
        let Some(number) = tag.strip_prefix(prefix).and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        return match number.cmp(&removed) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(format!("{prefix}{}", number - 1)),
            std::cmp::Ordering::Less => Some(tag.to_string())
        };
    }
    Some(tag.to_string())
}
