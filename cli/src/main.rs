use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod output;
pub mod ux_error;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.global.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let global = cli.global;
    match cli.command {
        Commands::Show(args) => commands::inspect::show(args, &global),
        Commands::Get(args) => commands::inspect::get(args, &global),
        Commands::Files(args) => commands::inspect::files(args, &global),
        Commands::Status(args) => commands::status::run(args, &global),
        Commands::Validate(args) => commands::validate::run(args, &global),
        Commands::Export(args) => commands::transfer::export(args, &global),
        Commands::Import(args) => commands::transfer::import(args, &global),
        Commands::Versions(cmd) => commands::versions::run(cmd, &global),
        Commands::Watch(args) => commands::watch::run(args, &global).await,
        Commands::Completion(args) => commands::completion::run(args),
    }
}
