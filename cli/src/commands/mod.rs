pub mod completion;
pub mod inspect;
pub mod status;
pub mod transfer;
pub mod validate;
pub mod versions;
pub mod watch;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use config::{ConfigFormat, ConfigManager, ConfigSystem, ManagerSettings, RetentionSettings, RollbackManager};

use crate::ux_error;

#[derive(Parser)]
#[command(
    name = "strata",
    author,
    version,
    about = "Strata - layered configuration with hot reload and rollback",
    long_about = "Inspect, validate, version and roll back the layered configuration of a strata \
                  deployment.\n\nThe configuration directory and environment come from flags, \
                  STRATA_CONFIG_DIR / STRATA_ENV, or the defaults (./config, development)."
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration directory
    #[arg(long, global = true, env = "STRATA_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Environment name (development, production, testing)
    #[arg(short, long = "env", global = true, env = "STRATA_ENV")]
    pub environment: Option<String>,

    /// Version store directory (default: <config-dir>/backups)
    #[arg(long, global = true, env = "STRATA_BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Config id versions are stored under
    #[arg(long, global = true, env = "STRATA_CONFIG_ID")]
    pub config_id: Option<String>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool
}

impl GlobalArgs {
    pub fn settings(&self) -> Result<ManagerSettings> {
        let mut settings = ManagerSettings::from_env()?;
        if let Some(dir) = &self.config_dir {
            settings.config_dir = dir.clone();
        }
        if let Some(environment) = &self.environment {
            settings.environment = environment.clone();
        }
        if let Some(dir) = &self.backup_dir {
            settings.backup_dir = Some(dir.clone());
        }
        if let Some(id) = &self.config_id {
            settings.config_id = id.clone();
        }
        settings.check()?;

        if !settings.config_dir.is_dir() {
            let err = ux_error::config_dir_missing(&settings.config_dir);
            err.display();
            return Err(anyhow::anyhow!("Configuration directory not found"));
        }
        Ok(settings)
    }

    /// A loaded manager. Load failures are explained before returning.
    pub fn loaded_manager(&self) -> Result<ConfigManager> {
        let manager = ConfigManager::new(&self.settings()?);
        if let Err(e) = manager.load() {
            ux_error::load_failed(&e).display();
            return Err(anyhow::anyhow!("Configuration failed to load"));
        }
        Ok(manager)
    }

    pub fn rollback(&self) -> Result<(ManagerSettings, RollbackManager)> {
        let settings = self.settings()?;
        let rollback =
            RollbackManager::open(settings.backup_dir(), RetentionSettings::from(&settings))?;
        Ok((settings, rollback))
    }

    pub fn system(&self) -> Result<ConfigSystem> {
        Ok(ConfigSystem::new(self.settings()?)?)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum FormatArg {
    Yaml,
    Json
}

impl From<FormatArg> for ConfigFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Yaml => ConfigFormat::Yaml,
            FormatArg::Json => ConfigFormat::Json
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Print the merged configuration")]
    Show(inspect::ShowArgs),

    #[command(about = "Print one value by dotted key path")]
    Get(inspect::GetArgs),

    #[command(about = "List discovered configuration files")]
    Files(inspect::FilesArgs),

    #[command(about = "Show loader, version store and watcher status")]
    Status(status::StatusArgs),

    #[command(about = "Load and validate the configuration")]
    Validate(validate::ValidateArgs),

    #[command(about = "Export the merged configuration")]
    Export(transfer::ExportArgs),

    #[command(about = "Import a configuration and pin it over the configuration files")]
    Import(transfer::ImportArgs),

    #[command(subcommand, about = "Backup, inspect and roll back stored versions")]
    Versions(versions::VersionsCommand),

    #[command(about = "Watch for changes and serve notifications over WebSocket")]
    Watch(watch::WatchArgs),

    #[command(about = "Generate shell completions")]
    Completion(completion::CompletionArgs)
}
