//! Store bootstrap and listing: `bmp init`, `bmp apps`.

use std::path::Path;

use anyhow::{Context, Result};

use bmp::config::{BmpToml, CONFIG_FILE, PlatformConfig};
use bmp::platform::db::AppDb;

pub fn cmd_init(config: &PlatformConfig, config_path: Option<&Path>) -> Result<()> {
    config.ensure_directories()?;
    AppDb::new(&config.db_path())
        .with_context(|| format!("Failed to create store at {}", config.db_path().display()))?;

    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.data_dir.join(CONFIG_FILE));
    if path.exists() {
        println!("Config already exists at {}", path.display());
    } else {
        let content = BmpToml::default().to_toml()?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Created {}", path.display());
    }

    println!("Initialized bmp data directory at {}", config.data_dir.display());
    Ok(())
}

pub fn cmd_apps(config: &PlatformConfig) -> Result<()> {
    if !config.db_path().exists() {
        println!("No apps registered (store not initialized; run 'bmp init').");
        return Ok(());
    }
    let db = AppDb::new(&config.db_path())?;
    let apps = db.list_apps()?;
    if apps.is_empty() {
        println!("No apps registered.");
        return Ok(());
    }

    println!("{:<24} {:<36} {:<14} {:>6}  REPO", "NAME", "DOMAIN", "RUNTIME", "PORT");
    for app in apps {
        let port = app.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<36} {:<14} {:>6}  {}",
            app.name, app.domain, app.language_version, port, app.repo_url
        );
    }
    Ok(())
}
