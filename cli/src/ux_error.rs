use std::path::Path;

use colored::Colorize;
use errors::{ConfigError, ErrorKind};

#[derive(Debug)]
pub struct UxError {
    pub what: String,
    pub why: Option<String>,
    pub how_to_fix: Vec<String>,
    pub suggested_command: Option<String>
}

impl UxError {
    pub fn new(what: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            why: None,
            how_to_fix: Vec::new(),
            suggested_command: None
        }
    }

    pub fn why(mut self, reason: impl Into<String>) -> Self {
        self.why = Some(reason.into());
        self
    }

    pub fn fix(mut self, suggestion: impl Into<String>) -> Self {
        self.how_to_fix.push(suggestion.into());
        self
    }

    pub fn suggest(mut self, cmd: impl Into<String>) -> Self {
        self.suggested_command = Some(cmd.into());
        self
    }

    pub fn display(&self) {
        eprintln!();
        eprintln!("{} {}", "error:".red().bold(), self.what.white().bold());

        if let Some(why) = &self.why {
            for line in why.lines() {
                eprintln!("       {}", line.dimmed());
            }
        }

        if !self.how_to_fix.is_empty() {
            eprintln!();
            eprintln!("{}", "How to fix:".yellow().bold());
            for (i, fix) in self.how_to_fix.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, fix);
            }
        }

        if let Some(cmd) = &self.suggested_command {
            eprintln!();
            eprintln!("{}", "Try this:".green().bold());
            eprintln!("  $ {}", cmd.cyan());
        }
        eprintln!();
    }
}

impl std::fmt::Display for UxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.what)
    }
}

impl std::error::Error for UxError {}

pub fn config_dir_missing(path: &Path) -> UxError {
    UxError::new(format!("Configuration directory not found: '{}'", path.display()))
        .why("Expected a directory holding default.yaml and <environment>.yaml")
        .fix("Pass --config-dir or set STRATA_CONFIG_DIR")
        .fix("Create the directory with a default.yaml file")
        .suggest("strata --config-dir ./config files")
}

/// Explains a failed load, listing every violation.
pub fn load_failed(err: &ConfigError) -> UxError {
    let violations = err.violations();
    let base = UxError::new("Configuration failed to load").why(violations.join("\n"));
    match err.root_kind() {
        ErrorKind::Validation => base
            .fix("Correct the listed values in the configuration files")
            .fix("Or roll back to a known good version")
            .suggest("strata versions list"),
        ErrorKind::Parse => base
            .fix("Fix the syntax error in the named file")
            .suggest("strata files"),
        ErrorKind::NotFound | ErrorKind::Access => base
            .fix("Check that default and environment files exist and are readable")
            .suggest("strata files"),
        _ => base.suggest("strata --verbose validate")
    }
}

pub fn version_not_found(config_id: &str, version: u32) -> UxError {
    UxError::new(format!("Version not found: {config_id} v{version}"))
        .why("The version does not exist or was removed by retention")
        .fix("List stored versions to find the right number")
        .suggest("strata versions list")
}

pub fn integrity_failed(config_id: &str, version: u32, reason: &str) -> UxError {
    UxError::new(format!("Version {config_id} v{version} failed its integrity check"))
        .why(reason.to_string())
        .fix("Pick another version; this one is now marked corrupted")
        .fix("Run a full integrity check of the store")
        .suggest("strata versions verify")
}

pub fn confirmation_required(action: &str) -> UxError {
    UxError::new(format!("Refusing to {action} without confirmation"))
        .why("This permanently removes stored versions")
        .fix("Re-run with --yes")
}

/// Maps version store errors to guidance.
pub fn from_version_error(err: &ConfigError, config_id: &str, version: u32) -> UxError {
    match err {
        ConfigError::NotFound { .. } => version_not_found(config_id, version),
        ConfigError::Integrity { reason, .. } => integrity_failed(config_id, version, reason),
        other => UxError::new(other.to_string())
    }
}
