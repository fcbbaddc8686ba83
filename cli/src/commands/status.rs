use anyhow::Result;
use clap::Args;
use colored::Colorize;

use super::GlobalArgs;
use crate::output;

#[derive(Args)]
pub struct StatusArgs {
    #[arg(long, help = "Output as JSON")]
    pub json: bool
}

pub fn run(args: StatusArgs, global: &GlobalArgs) -> Result<()> {
    let system = global.system()?;
    let load_error = system.manager().load().err();
    let status = system.status();
    let stats = system.rollback().get_version_statistics(Some(system.config_id()));

    if args.json {
        return output::json(&serde_json::json!({
            "status": status,
            "load_error": load_error.as_ref().map(ToString::to_string),
            "versions": stats
        }));
    }

    output::header("Strata Status");
    println!();

    output::subheader("Configuration:");
    output::field("directory", status.config_dir.display());
    output::field("environment", &status.environment);
    let loaded = if status.loaded { "yes".green() } else { "no".red() };
    println!("  {:<16} {}", "loaded:", loaded);
    if let Some(err) = &load_error {
        println!("  {:<16} {}", "error:", err.to_string().red());
    }
    if status.restored {
        println!("  {:<16} {}", "restored:", "pinned (strata versions release)".yellow());
    }
    let info = system.manager().config_info();
    if !info.sources.is_empty() {
        output::field("sources", info.sources.join(", "));
    }
    for warning in &info.warnings {
        output::warn(warning);
    }

    println!();
    output::subheader("Versions:");
    output::field("config id", &status.config_id);
    output::field("stored", status.version_count);
    output::field(
        "latest",
        status
            .latest_version
            .map_or_else(|| "(none)".to_string(), |v| format!("v{v}"))
    );
    output::field("compressed", format!("{} B", stats.compressed_size_bytes));
    output::field("backup dir", system.rollback().backup_dir().display());

    if load_error.is_some() {
        println!();
        output::hint("Run `strata validate` for details or `strata versions rollback <n>` to recover.");
    }
    Ok(())
}
