//! Configuration view and validation commands: `bmp config`.

use std::path::{Path, PathBuf};

use anyhow::Result;

use bmp::config::{CONFIG_FILE, PlatformConfig};

use super::super::ConfigCommands;

fn config_file(config: &PlatformConfig, config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.data_dir.join(CONFIG_FILE))
}

pub fn cmd_config(
    config: &PlatformConfig,
    config_path: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let path = config_file(config, config_path);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("bmp Configuration");
            println!("=================");
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No bmp.toml found at {}; using defaults.", path.display());
            }
            println!("Data directory: {}", config.data_dir.display());
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", config.settings.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }

    Ok(())
}
