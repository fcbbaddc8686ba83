//! # Error Taxonomy
//!
//! Errors shared by every crate of the configuration subsystem.
//!
//! `ConfigError` carries one variant per failure kind a caller can act on;
//! `ErrorKind` is the serializable tag of that variant, used in notification
//! payloads and machine-readable CLI output.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failures of the configuration subsystem.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("Failed to parse {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("Validation failed with {} violation(s): {}", .violations.len(), .violations.join("; "))]
    Validation { violations: Vec<String> },

    #[error("Merge failed at '{key}': {reason}")]
    Merge { key: String, reason: String },

    #[error("Load failed: {reason}")]
    Load {
        reason: String,
        #[source]
        source: Box<ConfigError>
    },

    #[error("I/O failure on {}: {source}", .path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: std::io::Error
    },

    #[error("Integrity check failed for {config_id} v{version}: {reason}")]
    Integrity {
        config_id: String,
        version: u32,
        reason: String
    },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Watcher error: {reason}")]
    Watch { reason: String }
}

/// Serializable tag of a [`ConfigError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Parse,
    Validation,
    Merge,
    Load,
    Access,
    Integrity,
    Serialization,
    Watch
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::Parse => "parse",
            Self::Validation => "validation",
            Self::Merge => "merge",
            Self::Load => "load",
            Self::Access => "access",
            Self::Integrity => "integrity",
            Self::Serialization => "serialization",
            Self::Watch => "watch"
        };
        f.write_str(name)
    }
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Merge { .. } => ErrorKind::Merge,
            Self::Load { .. } => ErrorKind::Load,
            Self::Access { .. } => ErrorKind::Access,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Watch { .. } => ErrorKind::Watch
        }
    }

    /// Kind of the innermost error, looking through `Load` wrappers.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            Self::Load { source, .. } => source.root_kind(),
            other => other.kind()
        }
    }

    /// Individual violations for validation failures, or the message itself.
    pub fn violations(&self) -> Vec<String> {
        match self {
            Self::Validation { violations } => violations.clone(),
            Self::Load { source, .. } => source.violations(),
            other => vec![other.to_string()]
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into()
        }
    }

    pub fn parse(file: impl AsRef<Path>, reason: impl fmt::Display) -> Self {
        Self::Parse {
            file: file.as_ref().display().to_string(),
            reason: reason.to_string()
        }
    }

    pub fn access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Access {
            path: path.into(),
            source
        }
    }

    pub fn serialization(reason: impl fmt::Display) -> Self {
        Self::Serialization {
            reason: reason.to_string()
        }
    }

    /// Wraps `self` as the cause of a failed load.
    pub fn into_load(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::debug!(kind = %self.kind(), %reason, "wrapping error as load failure");
        Self::Load {
            reason,
            source: Box::new(self)
        }
    }
}

/// Failures delivering a notification to one subscriber.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Subscriber {subscriber_id} disconnected")]
    Closed { subscriber_id: String },

    #[error("Subscriber {subscriber_id} queue is full")]
    Full { subscriber_id: String },

    #[error("Transport failure: {reason}")]
    Transport { reason: String }
}

impl NotifyError {
    /// Whether the subscriber should be dropped from the registry.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_validation_message_lists_violations() {
        let err = ConfigError::Validation {
            violations: vec!["a is required".to_string(), "b out of range".to_string()]
        };
        assert_eq!(
            err.to_string(),
            "Validation failed with 2 violation(s): a is required; b out of range"
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_load_wraps_source() {
        let inner = ConfigError::parse("config/default.yaml", "bad indent");
        let err = inner.into_load("reload aborted");

        assert_eq!(err.kind(), ErrorKind::Load);
        assert_eq!(err.root_kind(), ErrorKind::Parse);
        let source = err.source().map(ToString::to_string).unwrap_or_default();
        assert!(source.contains("config/default.yaml"));
    }

    #[test]
    fn test_violations_through_load() {
        let err = ConfigError::Validation {
            violations: vec!["x".to_string()]
        }
        .into_load("load");
        assert_eq!(err.violations(), vec!["x".to_string()]);

        let not_found = ConfigError::not_found("version", "main v9");
        assert_eq!(not_found.violations(), vec!["version not found: main v9".to_string()]);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
        assert_eq!(ErrorKind::Integrity.to_string(), "integrity");
    }

    #[test]
    fn test_notify_error_disconnect() {
        assert!(NotifyError::Closed {
            subscriber_id: "c1".into()
        }
        .is_disconnect());
        assert!(!NotifyError::Full {
            subscriber_id: "c1".into()
        }
        .is_disconnect());
    }
}
