//! Offline snapshot commands: `bmp export`, `bmp import`, `bmp validate`.

use std::path::Path;

use anyhow::{Context, Result};

use bmp::config::PlatformConfig;
use bmp::platform::backup::{build_snapshot, import_message, parse_snapshot};
use bmp::platform::db::AppDb;
use bmp::platform::models::ImportReport;
use bmp::platform::server::acquire_instance_lock;

fn read_snapshot_file(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

pub fn cmd_export(config: &PlatformConfig, output: Option<&Path>) -> Result<()> {
    let apps = if config.db_path().exists() {
        AppDb::new(&config.db_path())?.list_apps()?
    } else {
        Vec::new()
    };
    let snapshot = build_snapshot(&apps, config.base_domain());
    let json = serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?;

    match output {
        Some(path) => {
            std::fs::write(path, json + "\n")
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported {} app(s) to {}", snapshot.apps.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Merge into the store. Refuses while a server owns the data directory,
/// since the running control plane would not see the change.
pub fn cmd_import(config: &PlatformConfig, file: &Path) -> Result<()> {
    let snapshot = parse_snapshot(&read_snapshot_file(file)?)?;
    config.ensure_directories()?;
    let _lock = acquire_instance_lock(config)
        .context("Stop the running server or import through POST /api/import")?;

    let db = AppDb::new(&config.db_path())?;
    let outcome = db.merge_snapshot(&snapshot.apps)?;
    let report = ImportReport {
        created: outcome.created,
        updated: outcome.updated,
        unchanged: outcome.unchanged,
        requires_wipe: outcome.requires_wipe,
        ..Default::default()
    };
    println!("{}", import_message(&report));
    Ok(())
}

pub fn cmd_validate(file: &Path) -> Result<()> {
    let snapshot = parse_snapshot(&read_snapshot_file(file)?)?;
    println!("Snapshot is valid: {} app(s)", snapshot.apps.len());
    Ok(())
}
