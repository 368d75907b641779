//! Language runtime selection through `mise`.
//!
//! Without a configured `mise` binary every command runs as `sh -c`.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct RuntimeManager {
    mise_path: Option<String>,
}

impl RuntimeManager {
    pub fn new(mise_path: Option<String>) -> Self {
        Self { mise_path }
    }

    pub fn is_managed(&self) -> bool {
        self.mise_path.is_some()
    }

    /// Command running `script` under the requested runtime in `workdir`.
    ///
    /// The child gets its own process group, null stdin and piped output.
    pub fn command(&self, language_version: &str, script: &str, workdir: &Path) -> Command {
        let mut cmd = match &self.mise_path {
            Some(mise) => {
                let mut cmd = Command::new(mise);
                cmd.args(["exec", language_version, "--", "sh", "-c", script]);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", script]);
                cmd
            }
        };
        cmd.current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }

    /// `mise install` command for the checkout, or `None` when unmanaged.
    /// Writes `.tool-versions` first.
    pub fn install_command(&self, language_version: &str, workdir: &Path) -> Result<Option<Command>> {
        let Some(mise) = &self.mise_path else {
            return Ok(None);
        };
        std::fs::write(
            workdir.join(".tool-versions"),
            format!("{}\n", tool_versions_line(language_version)),
        )
        .context("Failed to write .tool-versions")?;

        let mut cmd = Command::new(mise);
        cmd.arg("install")
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        Ok(Some(cmd))
    }
}

/// `node@20` → `node 20`.
pub fn tool_versions_line(language_version: &str) -> String {
    language_version.replacen('@', " ", 1)
}
