//! Platform configuration.
//!
//! Settings are layered file → environment → CLI. The file lives at
//! `<data_dir>/bmp.toml` unless `--config` points elsewhere.
//!
//! ```toml
//! [platform]
//! base_domain = "paas.example.com"
//! dashboard_domain = "dashboard.paas.example.com"
//! listen_port = 1323
//!
//! [ports]
//! start = 8000
//! end = 9000
//!
//! [supervisor]
//! stop_grace_secs = 10
//! ready_timeout_secs = 0
//!
//! [pipeline]
//! build_timeout_secs = 1800
//! git_timeout_secs = 300
//!
//! [runtime]
//! mise_path = "/usr/local/bin/mise"
//!
//! [caddy]
//! admin_url = "http://localhost:2019"
//! sync_timeout_secs = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "bmp.toml";
pub const DEFAULT_BASE_DOMAIN: &str = "paas.local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    #[serde(default)]
    pub dashboard_domain: Option<String>,
    #[serde(default)]
    pub admin_user: Option<String>,
    #[serde(default)]
    pub admin_password_hash: Option<String>,
    /// Port the control plane API listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_base_domain() -> String {
    DEFAULT_BASE_DOMAIN.to_string()
}

fn default_listen_port() -> u16 {
    1323
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            dashboard_domain: None,
            admin_user: None,
            admin_password_hash: None,
            listen_port: default_listen_port(),
        }
    }
}

/// Half-open range `[start, end)` handed out to application processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsSection {
    #[serde(default = "default_port_start")]
    pub start: u16,
    #[serde(default = "default_port_end")]
    pub end: u16,
}

fn default_port_start() -> u16 {
    8000
}

fn default_port_end() -> u16 {
    9000
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Seconds between SIGTERM and SIGKILL.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Wait for the app to accept TCP connections on its port. 0 disables the probe.
    #[serde(default)]
    pub ready_timeout_secs: u64,
}

fn default_stop_grace() -> u64 {
    10
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace(),
            ready_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,
    /// Deploy records kept per app.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_git_timeout() -> u64 {
    300
}

fn default_history_limit() -> usize {
    20
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            build_timeout_secs: default_build_timeout(),
            git_timeout_secs: default_git_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsSection {
    /// Lines retained per application ring buffer.
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
}

fn default_log_capacity() -> usize {
    1000
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySection {
    #[serde(default = "default_telemetry_interval")]
    pub interval_secs: u64,
}

fn default_telemetry_interval() -> u64 {
    2
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: default_telemetry_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Path to the `mise` binary. When unset, commands run under plain `sh -c`.
    #[serde(default)]
    pub mise_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaddySection {
    /// Caddy admin endpoint, e.g. `http://localhost:2019`. Unset disables proxy sync.
    #[serde(default)]
    pub admin_url: Option<String>,
    /// Upper bound on a single configuration push.
    #[serde(default = "default_caddy_sync_timeout")]
    pub sync_timeout_secs: u64,
}

fn default_caddy_sync_timeout() -> u64 {
    10
}

impl Default for CaddySection {
    fn default() -> Self {
        Self {
            admin_url: None,
            sync_timeout_secs: default_caddy_sync_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Directory for daily rolling log files.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

/// Raw TOML structure for `bmp.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BmpToml {
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub ports: PortsSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub caddy: CaddySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl BmpToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse bmp.toml")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize bmp.toml")
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.ports.start >= self.ports.end {
            warnings.push(format!(
                "Empty port range {}..{}: no application can be started",
                self.ports.start, self.ports.end
            ));
        }
        if self.ports.start < 1024 {
            warnings.push(format!(
                "Port range starts at privileged port {}",
                self.ports.start
            ));
        }
        if (self.ports.start..self.ports.end).contains(&self.platform.listen_port) {
            warnings.push(format!(
                "listen_port {} lies inside the application port range",
                self.platform.listen_port
            ));
        }
        if self.platform.base_domain.trim().is_empty() {
            warnings.push("base_domain is empty".to_string());
        }
        if self.platform.admin_user.is_some() != self.platform.admin_password_hash.is_some() {
            warnings.push(
                "admin_user and admin_password_hash must be set together; dashboard auth disabled"
                    .to_string(),
            );
        }
        if self.logs.capacity == 0 {
            warnings.push("logs.capacity is 0: application output will be discarded".to_string());
        }
        if self.telemetry.interval_secs == 0 {
            warnings.push("telemetry.interval_secs is 0; using 1 second".to_string());
        }

        warnings
    }
}

/// Resolved runtime configuration: file values plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub data_dir: PathBuf,
    pub settings: BmpToml,
}

impl PlatformConfig {
    /// Load from `config_path` (or `<data_dir>/bmp.toml` when present) and apply env overrides.
    pub fn load(data_dir: Option<PathBuf>, config_path: Option<&Path>) -> Result<Self> {
        let data_dir = data_dir
            .or_else(|| std::env::var_os("BMP_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let settings = match config_path {
            Some(path) => BmpToml::load(path)?,
            None => {
                let path = data_dir.join(CONFIG_FILE);
                if path.exists() {
                    BmpToml::load(&path)?
                } else {
                    BmpToml::default()
                }
            }
        };

        let mut config = Self { data_dir, settings };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config rooted at `data_dir` with defaults only. Used by tests and `init`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            settings: BmpToml::default(),
        }
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        let platform = &mut self.settings.platform;
        if let Some(v) = get("BASE_DOMAIN").filter(|v| !v.trim().is_empty()) {
            platform.base_domain = v.trim().to_lowercase();
        }
        if let Some(v) = get("DASHBOARD_DOMAIN") {
            platform.dashboard_domain = Some(v);
        }
        if let Some(v) = get("ADMIN_USER") {
            platform.admin_user = Some(v);
        }
        if let Some(v) = get("ADMIN_PASSWORD_HASH") {
            platform.admin_password_hash = Some(v);
        }
        if let Some(v) = get("CADDY_ADMIN_URL") {
            self.settings.caddy.admin_url = Some(v);
        }
        if let Some(v) = get("MISE_PATH") {
            self.settings.runtime.mise_path = Some(v);
        }
        if let Some(v) = get("BMP_LOG_JSON") {
            self.settings.logging.json = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("bmp.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("bmp.lock")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.data_dir.join("apps")
    }

    pub fn base_domain(&self) -> &str {
        &self.settings.platform.base_domain
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.settings.supervisor.stop_grace_secs)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        match self.settings.supervisor.ready_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.pipeline.build_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.pipeline.git_timeout_secs)
    }

    pub fn caddy_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.caddy.sync_timeout_secs.max(1))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.settings.telemetry.interval_secs.max(1))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("Failed to create data directory {}", self.data_dir.display())
        })?;
        std::fs::create_dir_all(self.apps_dir()).context("Failed to create apps directory")?;
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("bmp"))
        .unwrap_or_else(|| PathBuf::from(".bmp"))
}
