use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use config::ConfigFormat;

use super::{FormatArg, GlobalArgs};
use crate::output;

#[derive(Args)]
pub struct ExportArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value = "yaml")]
    pub format: FormatArg,

    /// Leave out the _metadata block
    #[arg(long)]
    pub no_metadata: bool,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>
}

#[derive(Args)]
pub struct ImportArgs {
    /// File to import (YAML or JSON)
    pub file: PathBuf,

    /// Format of the file (default: from its extension)
    #[arg(short, long, value_enum)]
    pub format: Option<FormatArg>,

    /// Recorded as the author of the pre-import backup
    #[arg(long, default_value = "cli")]
    pub author: String,

    /// Only validate, do not write anything
    #[arg(long)]
    pub dry_run: bool
}

pub fn export(args: ExportArgs, global: &GlobalArgs) -> Result<()> {
    let manager = global.loaded_manager()?;
    let rendered = manager.export(args.format.into(), !args.no_metadata)?;

    match &args.output {
        Some(path) => {
            fs::write(path, &rendered).with_context(|| format!("cannot write {}", path.display()))?;
            output::success(&format!("Exported configuration to {}", path.display()));
        }
        None => print!("{rendered}")
    }
    Ok(())
}

pub fn import(args: ImportArgs, global: &GlobalArgs) -> Result<()> {
    let content = fs::read_to_string(&args.file)
        .with_context(|| format!("cannot read {}", args.file.display()))?;
    let format = match args.format {
        Some(format) => format.into(),
        None => ConfigFormat::from_path(&args.file).unwrap_or_default()
    };

    if args.dry_run {
        let settings = global.settings()?;
        let manager = config::ConfigManager::new(&settings);
        manager.import(&content, format)?;
        output::success(&format!("{} is a valid configuration", args.file.display()));
        output::info("Dry run mode - nothing was written.");
        return Ok(());
    }

    let system = global.system()?;
    if let Err(e) = system.manager().load() {
        output::warn(&format!("current configuration does not load: {e}"));
    }
    let backup = system.apply_import(&content, format, &args.author)?;
    output::success(&format!(
        "Imported {} into {}",
        args.file.display(),
        system.manager().restored_path().display()
    ));
    output::info(&format!("Previous configuration saved as v{}", backup.version));
    Ok(())
}
