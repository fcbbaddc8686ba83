use std::fs::File;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory};
use clap_complete::{Shell, generate};

use super::Cli;
use crate::output;

#[derive(Args)]
pub struct CompletionArgs {
    /// Shell to generate completions for
    pub shell: Shell,

    /// Write the script to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>
}

pub fn run(args: CompletionArgs) -> Result<()> {
    let mut cmd = Cli::command();
    let bin = cmd.get_name().to_string();

    match args.output {
        Some(path) => {
            let mut file = File::create(&path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            generate(args.shell, &mut cmd, bin, &mut file);
            output::success(&format!("{} completions written to {}", args.shell, path.display()));
        }
        None => generate(args.shell, &mut cmd, bin, &mut io::stdout())
    }
    Ok(())
}
