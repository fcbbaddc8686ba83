use anyhow::Result;
use clap::Args;
use config::ConfigManager;
use serde_json::json;

use super::GlobalArgs;
use crate::output;

#[derive(Args)]
pub struct ValidateArgs {
    /// Treat warnings as errors
    #[arg(long)]
    pub strict: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool
}

pub fn run(args: ValidateArgs, global: &GlobalArgs) -> Result<()> {
    let settings = global.settings()?;
    let manager = ConfigManager::new(&settings);

    let (errors, warnings) = match manager.load() {
        Ok(_) => (Vec::new(), manager.config_info().warnings),
        Err(e) => (e.violations(), Vec::new())
    };
    let valid = errors.is_empty() && !(args.strict && !warnings.is_empty());

    if args.json {
        output::json(&json!({
            "environment": settings.environment,
            "valid": valid,
            "errors": errors,
            "warnings": warnings
        }))?;
    } else {
        for error in &errors {
            output::error(error);
        }
        for warning in &warnings {
            output::warn(warning);
        }
        if valid {
            output::success(&format!(
                "Configuration for '{}' is valid ({} warning(s))",
                settings.environment,
                warnings.len()
            ));
        }
    }

    if valid {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Validation failed: {} error(s), {} warning(s)",
            errors.len(),
            warnings.len()
        ))
    }
}
