//! Configuration view and validation commands (`agency config`).

use anyhow::{Context, Result};

use agency::config::{AgencyConfig, AgencyToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &AgencyConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &config.config_path;

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {} (defaults)", config_path.display());
            }
            println!("# Effective settings after environment and CLI overrides");
            println!();
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
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
                println!("agency.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory {}", parent.display())
                })?;
            }

            AgencyToml::default().save(config_path)?;
            println!("Created agency.toml at {}", config_path.display());
        }
    }

    Ok(())
}
