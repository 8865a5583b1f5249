//! Configuration view and validation commands (`forge-sandbox config`).

use anyhow::Result;
use forge_sandbox::config::SandboxSettings;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = SandboxSettings::config_path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No sandbox.toml found at {}; showing defaults", config_path.display());
            }
            println!("# Effective values (with env overrides)");
            println!();
            let settings = SandboxSettings::load(project_dir)?;
            print!("{}", settings.to_redacted_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            println!("Validating configuration...");
            println!();

            let settings = SandboxSettings::load(project_dir)?;
            let warnings = settings.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("sandbox.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            SandboxSettings::default().save(&config_path)?;

            println!("Created sandbox.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [provider] template, resources and labels");
            println!("  - [health] and [circuit_breaker] thresholds");
            println!("  - [project] bootstrap commands");
        }
    }

    Ok(())
}
