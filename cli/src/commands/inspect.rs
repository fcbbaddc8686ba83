use anyhow::Result;
use clap::Args;
use colored::Colorize;
use config::ConfigFormat;
use serde_json::{Value, json};

use super::{FormatArg, GlobalArgs};
use crate::output;

#[derive(Args)]
pub struct ShowArgs {
    /// Only print this top-level section
    #[arg(short, long)]
    pub section: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "yaml")]
    pub format: FormatArg
}

#[derive(Args)]
pub struct GetArgs {
    /// Dotted key path, e.g. api.workers
    pub key: String,

    /// Also print which source defined the value
    #[arg(long)]
    pub source: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct FilesArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

pub fn show(args: ShowArgs, global: &GlobalArgs) -> Result<()> {
    let manager = global.loaded_manager()?;
    let mut config = manager.get_merged_config();

    if let Some(section) = &args.section {
        let Some(value) = config.get(section).cloned() else {
            output::error(&format!("Section '{section}' is not defined"));
            return Err(anyhow::anyhow!("Unknown section"));
        };
        config = json!({ section.as_str(): value });
    }

    let rendered = ConfigFormat::from(args.format).render(&config)?;
    print!("{rendered}");
    if !rendered.ends_with('\n') {
        println!();
    }
    Ok(())
}

pub fn get(args: GetArgs, global: &GlobalArgs) -> Result<()> {
    let manager = global.loaded_manager()?;
    let value = manager.get_value(&args.key, Value::Null);
    if value.is_null() {
        output::error(&format!("Key '{}' is not set", args.key));
        return Err(anyhow::anyhow!("Key not found"));
    }
    let source = manager.get_config_source(&args.key);

    if args.json {
        return output::json(&json!({
            "key": args.key,
            "value": value,
            "source": source
        }));
    }

    let text = match &value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other)?
    };
    if args.source {
        println!(
            "{} {}",
            text,
            format!("({})", source.as_deref().unwrap_or("unknown")).dimmed()
        );
    } else {
        println!("{text}");
    }
    Ok(())
}

pub fn files(args: FilesArgs, global: &GlobalArgs) -> Result<()> {
    let settings = global.settings()?;
    let manager = config::ConfigManager::new(&settings);
    let files = manager.list_config_files()?;

    if args.json {
        return output::json(&files);
    }

    output::header(&format!(
        "Configuration files ({} environment)",
        settings.environment
    ));
    println!();
    if files.is_empty() {
        output::hint("No configuration files found; create default.yaml to get started.");
        return Ok(());
    }
    for file in &files {
        println!(
            "  {:<22} {:<12} {:>8} B  {}",
            file.name.cyan(),
            file.tier.to_string(),
            file.size_bytes,
            file.path.display().to_string().dimmed()
        );
    }
    Ok(())
}
