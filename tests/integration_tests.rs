//! Integration tests for the bmp CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// bmp command rooted at `dir`, isolated from the caller's environment.
fn bmp(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("bmp");
    cmd.current_dir(dir.path())
        .arg("--data-dir")
        .arg(dir.path().join("data"))
        .env_remove("BMP_DATA_DIR")
        .env_remove("BASE_DOMAIN")
        .env_remove("CADDY_ADMIN_URL")
        .env_remove("BMP_LOG_JSON")
        .env_remove("RUST_LOG");
    cmd
}

fn snapshot(apps: &str) -> String {
    format!(r#"{{"version": 1, "apps": [{}]}}"#, apps)
}

fn entry(name: &str, build: &str) -> String {
    format!(
        r#"{{"name": "{name}", "repo_url": "https://git.example.com/{name}.git",
            "domain": "{name}.paas.local", "build_command": "{build}",
            "start_command": "./serve", "language_version": "node@20"}}"#
    )
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_bmp_help() {
        cargo_bin_cmd!("bmp")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("export"));
    }

    #[test]
    fn test_bmp_version() {
        cargo_bin_cmd!("bmp").arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_data_dir() {
        let dir = TempDir::new().unwrap();
        bmp(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized bmp data directory"));

        let data = dir.path().join("data");
        assert!(data.join("bmp.db").exists());
        assert!(data.join("bmp.toml").exists());
        assert!(data.join("apps").is_dir());

        bmp(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Config already exists"));
    }

    #[test]
    fn test_apps_empty() {
        let dir = TempDir::new().unwrap();
        bmp(&dir)
            .arg("apps")
            .assert()
            .success()
            .stdout(predicate::str::contains("No apps registered"));
    }
}

// =============================================================================
// Snapshot Tests
// =============================================================================

mod snapshots {
    use super::*;

    #[test]
    fn test_export_empty_store() {
        let dir = TempDir::new().unwrap();
        bmp(&dir)
            .arg("export")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"version\": 1"))
            .stdout(predicate::str::contains("\"apps\": []"));
    }

    #[test]
    fn test_validate_good_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("snap.json");
        fs::write(&file, snapshot(&entry("demo", "npm ci"))).unwrap();
        bmp(&dir)
            .arg("validate")
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("1 app(s)"));
    }

    #[test]
    fn test_validate_bad_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("snap.json");
        fs::write(&file, r#"{"version": 1, "apps": [{"name": "demo"}]}"#).unwrap();
        bmp(&dir)
            .arg("validate")
            .arg(&file)
            .assert()
            .failure()
            .stderr(predicate::str::contains("apps[0].repo_url"));
    }

    #[test]
    fn test_validate_unsupported_version() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("snap.json");
        fs::write(&file, r#"{"version": 7, "apps": []}"#).unwrap();
        bmp(&dir)
            .arg("validate")
            .arg(&file)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unsupported snapshot version 7"));
    }

    #[test]
    fn test_import_merges_then_exports() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.json");
        fs::write(
            &first,
            snapshot(&format!("{},{}", entry("alpha", "npm ci"), entry("beta", "npm ci"))),
        )
        .unwrap();
        bmp(&dir)
            .arg("import")
            .arg(&first)
            .assert()
            .success()
            .stdout(predicate::str::contains("2 created"));

        let second = dir.path().join("second.json");
        fs::write(&second, snapshot(&entry("alpha", "make"))).unwrap();
        bmp(&dir)
            .arg("import")
            .arg(&second)
            .assert()
            .success()
            .stdout(predicate::str::contains("1 updated"))
            .stdout(predicate::str::contains("Existing apps not in the file were kept"));

        bmp(&dir)
            .arg("apps")
            .assert()
            .success()
            .stdout(predicate::str::contains("alpha"))
            .stdout(predicate::str::contains("beta"));

        let out = dir.path().join("export.json");
        bmp(&dir).arg("export").arg("--output").arg(&out).assert().success();
        let exported = fs::read_to_string(&out).unwrap();
        assert!(exported.contains("\"make\""));
        assert!(exported.contains("beta.paas.local"));
        assert!(!exported.contains("deploy_token"));
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        bmp(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No bmp.toml found"))
            .stdout(predicate::str::contains("base_domain = \"paas.local\""));
    }

    #[test]
    fn test_config_show_reads_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("custom.toml");
        fs::write(&file, "[platform]\nbase_domain = \"apps.example.com\"\n").unwrap();
        bmp(&dir)
            .arg("--config")
            .arg(&file)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("apps.example.com"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bad.toml");
        fs::write(&file, "[ports]\nstart = 9000\nend = 8000\n").unwrap();
        bmp(&dir)
            .arg("--config")
            .arg(&file)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Empty port range"));
    }

    #[test]
    fn test_config_validate_clean() {
        let dir = TempDir::new().unwrap();
        bmp(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_invalid_config_file_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("broken.toml");
        fs::write(&file, "[ports\nstart = ").unwrap();
        bmp(&dir)
            .arg("--config")
            .arg(&file)
            .arg("apps")
            .assert()
            .failure();
    }
}
