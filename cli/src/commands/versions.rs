use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use config::rollback::VersionQuery;
use config::{BackupMetadata, ConfigFormat, ConfigVersion, VersionType};

use super::GlobalArgs;
use crate::output;
use crate::ux_error;

#[derive(Subcommand)]
pub enum VersionsCommand {
    #[command(about = "List stored versions, newest first")]
    List(ListArgs),

    #[command(about = "Show one version's metadata and lineage")]
    Show(ShowArgs),

    #[command(about = "Store the current merged configuration as a manual version")]
    Backup(BackupArgs),

    #[command(about = "Compare two versions by top-level key")]
    Diff(DiffArgs),

    #[command(about = "Restore a version and pin it over the configuration files")]
    Rollback(RollbackArgs),

    #[command(about = "Drop the pinned restore so the configuration files apply again")]
    Release,

    #[command(about = "Add tags to a version")]
    Tag(TagArgs),

    #[command(about = "Start a branch from a version")]
    Branch(BranchArgs),

    #[command(about = "Merge one version into another")]
    Merge(MergeArgs),

    #[command(about = "Hard-delete one version")]
    Delete(DeleteArgs),

    #[command(about = "Apply retention (count or age)")]
    Cleanup(CleanupArgs),

    #[command(about = "Version store statistics")]
    Stats(StatsArgs),

    #[command(about = "Verify every stored payload")]
    Verify(JsonArgs),

    #[command(about = "Export version metadata as JSON")]
    Metadata(MetadataArgs)
}

#[derive(Args)]
pub struct JsonArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct ListArgs {
    /// Maximum number of versions
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Only versions carrying this tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Only versions of this type (manual, auto, scheduled, rollback, branch, merge)
    #[arg(long = "type")]
    pub version_type: Option<VersionType>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct ShowArgs {
    pub version: u32,

    /// Print the stored configuration as YAML
    #[arg(long)]
    pub content: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct BackupArgs {
    /// Why the backup was taken
    #[arg(short, long, default_value = "manual backup")]
    pub reason: String,

    #[arg(long, default_value = "cli")]
    pub author: String,

    /// Tags for the version (repeatable)
    #[arg(short, long)]
    pub tag: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct DiffArgs {
    pub from: u32,
    pub to: u32,

    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct RollbackArgs {
    pub version: u32,

    #[arg(long, default_value = "cli")]
    pub author: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct TagArgs {
    pub version: u32,

    #[arg(required = true)]
    pub tags: Vec<String>
}

#[derive(Args)]
pub struct BranchArgs {
    /// Version to branch from
    pub base: u32,

    /// Branch name
    pub name: String,

    #[arg(long, default_value = "cli")]
    pub author: String
}

#[derive(Args)]
pub struct MergeArgs {
    /// Version whose values win
    pub source: u32,

    /// Version merged into
    pub target: u32,

    #[arg(long, default_value = "cli")]
    pub author: String
}

#[derive(Args)]
pub struct DeleteArgs {
    pub version: u32,

    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Keep only the newest N versions
    #[arg(long, conflicts_with = "expired")]
    pub keep: Option<usize>,

    /// Remove auto/scheduled versions older than the retention age
    #[arg(long)]
    pub expired: bool,

    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool
}

#[derive(Args)]
pub struct StatsArgs {
    /// Across every config id in the store
    #[arg(long)]
    pub all: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct MetadataArgs {
    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>
}

pub fn run(cmd: VersionsCommand, global: &GlobalArgs) -> Result<()> {
    match cmd {
        VersionsCommand::List(args) => list(args, global),
        VersionsCommand::Show(args) => show(args, global),
        VersionsCommand::Backup(args) => backup(args, global),
        VersionsCommand::Diff(args) => diff(args, global),
        VersionsCommand::Rollback(args) => rollback(args, global),
        VersionsCommand::Release => release(global),
        VersionsCommand::Tag(args) => tag(args, global),
        VersionsCommand::Branch(args) => branch(args, global),
        VersionsCommand::Merge(args) => merge(args, global),
        VersionsCommand::Delete(args) => delete(args, global),
        VersionsCommand::Cleanup(args) => cleanup(args, global),
        VersionsCommand::Stats(args) => stats(args, global),
        VersionsCommand::Verify(args) => verify(args, global),
        VersionsCommand::Metadata(args) => metadata(args, global)
    }
}

fn version_error(err: errors::ConfigError, config_id: &str, version: u32) -> anyhow::Error {
    let message = err.to_string();
    ux_error::from_version_error(&err, config_id, version).display();
    anyhow::anyhow!(message)
}

fn print_version_line(v: &ConfigVersion) {
    println!(
        "  {:<5} {:<9} {:<9} {}  {:<10} {}{}",
        format!("v{}", v.version).cyan().bold(),
        v.version_type.to_string(),
        output::status_color(&v.status.to_string()),
        v.timestamp.format("%Y-%m-%d %H:%M:%S"),
        v.author,
        v.reason,
        if v.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", v.tags.join(", ")).dimmed().to_string()
        }
    );
}

fn list(args: ListArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let mut versions = store.search_versions(&VersionQuery {
        config_id: Some(settings.config_id.clone()),
        tags: args.tag.into_iter().collect(),
        version_type: args.version_type,
        ..VersionQuery::default()
    });
    versions.sort_by(|a, b| b.version.cmp(&a.version));
    versions.truncate(args.limit);

    if args.json {
        return output::json(&versions);
    }
    output::header(&format!("Versions of '{}'", settings.config_id));
    println!();
    if versions.is_empty() {
        output::hint("No versions stored yet. Create one with `strata versions backup`.");
        return Ok(());
    }
    for v in &versions {
        print_version_line(v);
    }
    Ok(())
}

fn show(args: ShowArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let id = settings.config_id.as_str();
    let details = store
        .get_version_details(id, args.version)
        .map_err(|e| version_error(e, id, args.version))?;

    if args.json {
        let mut value = serde_json::to_value(&details)?;
        if args.content {
            let content = store
                .load_version(id, args.version)
                .map_err(|e| version_error(e, id, args.version))?;
            value["content"] = content;
        }
        return output::json(&value);
    }

    let record = &details.record;
    output::header(&format!("{id} v{}", record.version));
    output::field("type", record.version_type);
    output::field("status", output::status_color(&record.status.to_string()));
    output::field("created", record.timestamp.to_rfc3339());
    output::field("author", &record.author);
    output::field("reason", &record.reason);
    output::field("environment", record.environment.as_deref().unwrap_or("-"));
    output::field("content hash", &record.content_hash);
    output::field("size", format!("{} B ({} B compressed)", record.size_bytes, record.compressed_size));
    if !record.tags.is_empty() {
        output::field("tags", record.tags.join(", "));
    }
    output::field("parent", record.parent_version.map_or_else(|| "-".to_string(), |p| format!("v{p}")));
    let join = |vs: &[u32]| vs.iter().map(|v| format!("v{v}")).collect::<Vec<_>>().join(", ");
    output::field("ancestors", join(&details.lineage.ancestors));
    output::field("descendants", join(&details.lineage.descendants));
    if !details.payload_present {
        output::warn("payload file is missing");
    }

    if args.content {
        let content = store
            .load_version(id, args.version)
            .map_err(|e| version_error(e, id, args.version))?;
        println!();
        print!("{}", ConfigFormat::Yaml.render(&content)?);
    }
    Ok(())
}

fn backup(args: BackupArgs, global: &GlobalArgs) -> Result<()> {
    let manager = global.loaded_manager()?;
    let (settings, store) = global.rollback()?;
    let mut meta = BackupMetadata::new(VersionType::Manual)
        .author(&args.author)
        .reason(&args.reason)
        .environment(&settings.environment);
    for tag in &args.tag {
        meta = meta.tag(tag);
    }
    let version = store.create_backup(&settings.config_id, &manager.get_merged_config(), meta)?;

    if args.json {
        return output::json(&version);
    }
    output::success(&format!("Stored {} v{}", settings.config_id, version.version));
    Ok(())
}

fn diff(args: DiffArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let id = settings.config_id.as_str();
    let diff = store.compare_versions(id, args.from, args.to).map_err(|e| {
        let missing = if store.get_version(id, args.from).is_none() { args.from } else { args.to };
        version_error(e, id, missing)
    })?;

    if args.json {
        return output::json(&diff);
    }
    output::header(&format!("v{} → v{}", args.from, args.to));
    if !diff.has_changes() {
        output::info("No differences");
        return Ok(());
    }
    for key in &diff.added {
        println!("  {} {}", "+".green().bold(), key);
    }
    for key in &diff.removed {
        println!("  {} {}", "-".red().bold(), key);
    }
    for key in &diff.modified {
        println!("  {} {}", "~".yellow().bold(), key);
    }
    Ok(())
}

fn rollback(args: RollbackArgs, global: &GlobalArgs) -> Result<()> {
    let system = global.system()?;
    if let Err(e) = system.manager().load() {
        output::warn(&format!("current configuration does not load: {e}"));
    }
    let id = system.config_id().to_string();
    let outcome = system
        .rollback_to_version(args.version, &args.author)
        .map_err(|e| version_error(e, &id, args.version))?;

    if args.json {
        return output::json(&outcome);
    }
    output::success(&format!(
        "Rolled back {id} to v{} (previous state saved as v{})",
        outcome.to_version, outcome.backup.version
    ));
    output::info(&format!(
        "Pinned at {}; `strata versions release` returns to the files",
        system.manager().restored_path().display()
    ));
    if !system.manager().is_loaded() {
        output::warn("restored configuration does not load; run `strata validate`");
    }
    Ok(())
}

fn release(global: &GlobalArgs) -> Result<()> {
    let system = global.system()?;
    if system.release_restore()? {
        output::success("Released the restored configuration; configuration files apply again");
    } else {
        output::info("No restored configuration is pinned");
    }
    Ok(())
}

fn tag(args: TagArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let id = settings.config_id.as_str();
    let version = store
        .tag_version(id, args.version, &args.tags)
        .map_err(|e| version_error(e, id, args.version))?;
    output::success(&format!("v{} tags: {}", version.version, version.tags.join(", ")));
    Ok(())
}

fn branch(args: BranchArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let id = settings.config_id.as_str();
    let version = store
        .create_branch(id, args.base, &args.name, &args.author)
        .map_err(|e| version_error(e, id, args.base))?;
    output::success(&format!("Branch '{}' created as v{}", args.name, version.version));
    Ok(())
}

fn merge(args: MergeArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let id = settings.config_id.as_str();
    let version = store
        .merge_versions(id, args.source, args.target, &args.author)
        .map_err(|e| version_error(e, id, args.source))?;
    output::success(&format!(
        "Merged v{} into v{} as v{}",
        args.source, args.target, version.version
    ));
    Ok(())
}

fn delete(args: DeleteArgs, global: &GlobalArgs) -> Result<()> {
    if !args.yes {
        ux_error::confirmation_required("delete a version").display();
        return Err(anyhow::anyhow!("Confirmation required"));
    }
    let (settings, store) = global.rollback()?;
    let id = settings.config_id.as_str();
    let removed = store
        .delete_version(id, args.version)
        .map_err(|e| version_error(e, id, args.version))?;
    output::success(&format!("Deleted v{}; later versions were renumbered", removed.version));
    Ok(())
}

fn cleanup(args: CleanupArgs, global: &GlobalArgs) -> Result<()> {
    if !args.yes {
        ux_error::confirmation_required("clean up versions").display();
        return Err(anyhow::anyhow!("Confirmation required"));
    }
    let (settings, store) = global.rollback()?;
    let affected = match args.keep {
        Some(keep) => store.cleanup_backups(&settings.config_id, keep)?,
        None if args.expired => store.cleanup_expired_versions()?,
        None => {
            let keep = settings.max_versions;
            store.cleanup_backups(&settings.config_id, keep)?
        }
    };
    output::success(&format!("{affected} version(s) cleaned up"));
    Ok(())
}

fn stats(args: StatsArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let scope = if args.all { None } else { Some(settings.config_id.as_str()) };
    let stats = store.get_version_statistics(scope);

    if args.json {
        return output::json(&stats);
    }
    output::header("Version statistics");
    output::field("versions", stats.total_versions);
    output::field("raw size", format!("{} B", stats.total_size_bytes));
    output::field("compressed", format!("{} B", stats.compressed_size_bytes));
    output::field("ratio", format!("{:.2}", stats.compression_ratio));
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        output::field("oldest", oldest.to_rfc3339());
        output::field("newest", newest.to_rfc3339());
    }
    for (label, counts) in [
        ("by type", &stats.by_type),
        ("by environment", &stats.by_environment),
        ("by status", &stats.by_status)
    ] {
        if !counts.is_empty() {
            let parts: Vec<String> = counts.iter().map(|(k, n)| format!("{k}={n}")).collect();
            output::field(label, parts.join(" "));
        }
    }
    Ok(())
}

fn verify(args: JsonArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let report = store.verify_integrity(&settings.config_id)?;

    if args.json {
        output::json(&report)?;
    } else if report.corrupted.is_empty() {
        output::success(&format!("{} version(s) verified", report.checked));
    } else {
        for version in &report.corrupted {
            output::error(&format!("v{version} is corrupted"));
        }
    }

    if report.corrupted.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("{} corrupted version(s)", report.corrupted.len()))
    }
}

fn metadata(args: MetadataArgs, global: &GlobalArgs) -> Result<()> {
    let (settings, store) = global.rollback()?;
    let export = store.export_version_metadata(&settings.config_id)?;
    let body = serde_json::to_string_pretty(&export)?;
    match &args.output {
        Some(path) => {
            fs::write(path, body).with_context(|| format!("cannot write {}", path.display()))?;
            output::success(&format!("Metadata written to {}", path.display()));
        }
        None => println!("{body}")
    }
    Ok(())
}
