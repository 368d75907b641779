use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{PlatformError, PlatformResult};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").expect("static regex"));
static DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]*[a-z0-9]$").expect("static regex"));

pub fn validate_name(name: &str) -> PlatformResult<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(PlatformError::Validation(format!(
            "Invalid app name '{}': use lowercase letters, digits and '-', starting with a letter or digit",
            name
        )))
    }
}

pub fn validate_domain(domain: &str) -> PlatformResult<()> {
    if DOMAIN_RE.is_match(domain) && !domain.contains("..") {
        Ok(())
    } else {
        Err(PlatformError::Validation(format!("Invalid domain '{}'", domain)))
    }
}

/// `family@version`, e.g. `node@20`.
pub fn validate_language_version(lv: &str) -> PlatformResult<()> {
    match lv.split_once('@') {
        Some((family, version))
            if !family.is_empty()
                && !version.is_empty()
                && !lv.chars().any(char::is_whitespace) =>
        {
            Ok(())
        }
        _ => Err(PlatformError::Validation(format!(
            "Invalid language_version '{}': expected family@version",
            lv
        ))),
    }
}

fn require_non_empty(field: &str, value: &str) -> PlatformResult<()> {
    if value.trim().is_empty() {
        Err(PlatformError::Validation(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

/// Application record as persisted by the App Store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub id: i64,
    pub name: String,
    pub repo_url: String,
    pub domain: String,
    pub language_version: String,
    pub build_command: String,
    pub start_command: String,
    pub port: Option<u16>,
    pub deploy_token: String,
    pub created_at: String,
    pub updated_at: String,
}

impl App {
    pub fn config(&self) -> AppConfig {
        AppConfig {
            repo_url: self.repo_url.clone(),
            domain: self.domain.clone(),
            language_version: self.language_version.clone(),
            build_command: self.build_command.clone(),
            start_command: self.start_command.clone(),
        }
    }
}

/// The mutable part of an application record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub repo_url: String,
    pub domain: String,
    pub language_version: String,
    pub build_command: String,
    pub start_command: String,
}

impl AppConfig {
    pub fn validate(&self) -> PlatformResult<()> {
        require_non_empty("repo_url", &self.repo_url)?;
        require_non_empty("build_command", &self.build_command)?;
        require_non_empty("start_command", &self.start_command)?;
        validate_domain(&self.domain)?;
        validate_language_version(&self.language_version)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Running,
    Stopped,
    Building,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Building => "building",
            Self::Error => "error",
        }
    }
}

impl FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "building" => Ok(Self::Building),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid app status: {}", s)),
        }
    }
}

/// Application record plus derived runtime status, as returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct AppView {
    #[serde(flatten)]
    pub app: App,
    pub status: AppStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<String>,
}

/// Body of `POST /api/apps` and `POST /api/deploy`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub name: String,
    pub repo_url: String,
    pub domain: String,
    /// Use `domain` verbatim instead of appending the base domain.
    /// Unset on `/api/deploy` means "custom if it contains a dot".
    #[serde(default)]
    pub custom_domain: Option<bool>,
    pub build_command: String,
    pub start_command: String,
    pub language_version: String,
    /// Acknowledges a destructive change when the request updates an existing app.
    #[serde(default)]
    pub confirm_wipe: bool,
}

/// Body of `PUT /api/apps/{name}` and `POST /api/apps/{name}/plan`.
/// Omitted fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub custom_domain: bool,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub language_version: Option<String>,
    #[serde(default)]
    pub confirm_wipe: bool,
}

/// Result of classifying an edit against the stored record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditPlan {
    pub requires_wipe: bool,
    /// Destructive fields that changed.
    pub reasons: Vec<String>,
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployTrigger {
    Create,
    Edit,
    Redeploy,
    Webhook,
    Import,
}

impl DeployTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Redeploy => "redeploy",
            Self::Webhook => "webhook",
            Self::Import => "import",
        }
    }
}

impl std::fmt::Display for DeployTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "edit" => Ok(Self::Edit),
            "redeploy" => Ok(Self::Redeploy),
            "webhook" => Ok(Self::Webhook),
            "import" => Ok(Self::Import),
            _ => Err(format!("Invalid deploy trigger: {}", s)),
        }
    }
}

/// `{logs, success}` outcome of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReport {
    pub app: String,
    pub trigger: DeployTrigger,
    pub success: bool,
    pub wiped: bool,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRecord {
    pub trigger: DeployTrigger,
    pub started_at: String,
    pub finished_at: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    Deploy,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Deploy => "deploy",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub seq: u64,
    pub timestamp: String,
    pub stream: LogStream,
    pub text: String,
}

/// One entry of the routing table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub domain: String,
    pub app: String,
    pub port: u16,
}

pub const SNAPSHOT_VERSION: u32 = 1;

/// Exported, secret-free configuration of every application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: String,
    #[serde(default)]
    pub base_domain: Option<String>,
    pub apps: Vec<AppSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSnapshot {
    pub name: String,
    pub repo_url: String,
    pub domain: String,
    pub build_command: String,
    pub start_command: String,
    pub language_version: String,
}

impl AppSnapshot {
    pub fn config(&self) -> AppConfig {
        AppConfig {
            repo_url: self.repo_url.clone(),
            domain: self.domain.clone(),
            language_version: self.language_version.clone(),
            build_command: self.build_command.clone(),
            start_command: self.start_command.clone(),
        }
    }
}

impl From<&App> for AppSnapshot {
    fn from(app: &App) -> Self {
        Self {
            name: app.name.clone(),
            repo_url: app.repo_url.clone(),
            domain: app.domain.clone(),
            build_command: app.build_command.clone(),
            start_command: app.start_command.clone(),
            language_version: app.language_version.clone(),
        }
    }
}

/// Per-record outcome of merging a snapshot into the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub requires_wipe: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub requires_wipe: Vec<String>,
    pub redeploy_scheduled: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryStats {
    pub total: u64,
    pub available: u64,
    pub percent: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskStats {
    pub total: u64,
    pub free: u64,
    pub percent: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub memory: MemoryStats,
    pub disk: DiskStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformStatus {
    pub accepting_deploys: bool,
    pub halt_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSettings {
    pub base_domain: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("my-app-2").is_ok());
        assert!(validate_name("0abc").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-lead").is_err());
        assert!(validate_name("Upper").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("demo.paas.local").is_ok());
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("a..b").is_err());
        assert!(validate_domain(".lead.com").is_err());
        assert!(validate_domain("trail.com.").is_err());
        assert!(validate_domain("UPPER.com").is_err());
        assert!(validate_domain("x").is_err());
    }

    #[test]
    fn test_validate_language_version() {
        assert!(validate_language_version("node@20").is_ok());
        assert!(validate_language_version("python@3.12").is_ok());
        assert!(validate_language_version("node").is_err());
        assert!(validate_language_version("@20").is_err());
        assert!(validate_language_version("node@").is_err());
        assert!(validate_language_version("node @20").is_err());
    }

    #[test]
    fn test_app_config_validate_rejects_empty_commands() {
        let config = AppConfig {
            repo_url: "https://example.com/r.git".into(),
            domain: "demo.paas.local".into(),
            language_version: "node@20".into(),
            build_command: "  ".into(),
            start_command: "npm start".into(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("build_command"));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            AppStatus::Running,
            AppStatus::Stopped,
            AppStatus::Building,
            AppStatus::Error,
        ] {
            assert_eq!(AppStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(AppStatus::from_str("paused").is_err());
    }

    #[test]
    fn test_trigger_from_str() {
        assert_eq!(DeployTrigger::from_str("webhook").unwrap(), DeployTrigger::Webhook);
        assert!(DeployTrigger::from_str("cron").is_err());
    }

    #[test]
    fn test_app_view_flattens_record() {
        let view = AppView {
            app: App {
                id: 1,
                name: "demo".into(),
                repo_url: "r1".into(),
                domain: "demo.paas.local".into(),
                language_version: "node@20".into(),
                build_command: "true".into(),
                start_command: "true".into(),
                port: Some(8000),
                deploy_token: "tok".into(),
                created_at: "now".into(),
                updated_at: "now".into(),
            },
            status: AppStatus::Running,
            status_detail: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["name"], "demo");
        assert_eq!(json["status"], "running");
        assert_eq!(json["port"], 8000);
        assert!(json.get("status_detail").is_none());
    }

    #[test]
    fn test_snapshot_entry_has_no_secrets() {
        let app = App {
            id: 7,
            name: "demo".into(),
            repo_url: "r1".into(),
            domain: "demo.paas.local".into(),
            language_version: "node@20".into(),
            build_command: "b".into(),
            start_command: "s".into(),
            port: Some(8001),
            deploy_token: "secret-token".into(),
            created_at: "t".into(),
            updated_at: "t".into(),
        };
        let json = serde_json::to_string(&AppSnapshot::from(&app)).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(!json.contains("8001"));
    }
}
