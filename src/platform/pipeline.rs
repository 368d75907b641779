//! Build & Deploy Pipeline.
//!
//! `DeployPipeline::deploy` turns the current App Store record into a running
//! process: checkout, runtime prep, build, then a Stop/Start swap. Any failure
//! before the swap leaves the live process untouched.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::logs::{LogAggregator, join_lines};
use super::models::*;
use super::runtime::RuntimeManager;
use super::supervisor::{ProcessSupervisor, StartSpec, terminate_group};
use super::ws::{PlatformEvent, broadcast_message};
use crate::errors::{PlatformError, PlatformResult};

const FINGERPRINT_FILE: &str = ".workspace.json";
const CHECKOUT_DIR: &str = "www";
/// Grace given to a timed-out step before SIGKILL.
const STEP_KILL_GRACE: Duration = Duration::from_secs(2);
/// How long to wait for output readers after a step exits.
const READER_DRAIN: Duration = Duration::from_secs(5);

/// Per-application exclusive locks.
///
/// Concurrent deploy, start, stop and delete requests for one app queue on
/// the same mutex; different apps never contend.
#[derive(Default)]
pub struct AppLockMap {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AppLockMap {
    pub fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn remove(&self, name: &str) {
        self.locks.remove(name);
    }
}

/// The source and runtime a checkout was last prepared for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceFingerprint {
    pub repo_url: String,
    pub language_version: String,
}

impl WorkspaceFingerprint {
    fn of(app: &App) -> Self {
        Self {
            repo_url: app.repo_url.clone(),
            language_version: app.language_version.clone(),
        }
    }

    fn load(home: &Path) -> anyhow::Result<Option<Self>> {
        let path = home.join(FINGERPRINT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(
            serde_json::from_str(&content).context("Failed to parse workspace fingerprint")?,
        ))
    }

    fn save(&self, home: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(home.join(FINGERPRINT_FILE), content)
            .context("Failed to write workspace fingerprint")
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub apps_dir: PathBuf,
    pub build_timeout: Duration,
    pub git_timeout: Duration,
    pub history_limit: usize,
}

pub struct DeployPipeline {
    db: DbHandle,
    supervisor: Arc<ProcessSupervisor>,
    logs: Arc<LogAggregator>,
    runtime: RuntimeManager,
    settings: PipelineSettings,
    locks: AppLockMap,
    building: DashSet<String>,
    history: DashMap<String, VecDeque<DeployRecord>>,
    ws_tx: broadcast::Sender<String>,
}

impl DeployPipeline {
    pub fn new(
        db: DbHandle,
        supervisor: Arc<ProcessSupervisor>,
        logs: Arc<LogAggregator>,
        runtime: RuntimeManager,
        settings: PipelineSettings,
        ws_tx: broadcast::Sender<String>,
    ) -> Self {
        Self {
            db,
            supervisor,
            logs,
            runtime,
            settings,
            locks: AppLockMap::default(),
            building: DashSet::new(),
            history: DashMap::new(),
            ws_tx,
        }
    }

    pub fn locks(&self) -> &AppLockMap {
        &self.locks
    }

    pub fn app_home(&self, name: &str) -> PathBuf {
        self.settings.apps_dir.join(name)
    }

    pub fn checkout_dir(&self, name: &str) -> PathBuf {
        self.app_home(name).join(CHECKOUT_DIR)
    }

    pub fn is_building(&self, name: &str) -> bool {
        self.building.contains(name)
    }

    /// Deploy history, oldest first.
    pub fn history(&self, name: &str) -> Vec<DeployRecord> {
        self.history
            .get(name)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_deploy(&self, name: &str) -> Option<DeployRecord> {
        self.history.get(name).and_then(|h| h.back().cloned())
    }

    pub fn forget(&self, name: &str) {
        self.history.remove(name);
        self.building.remove(name);
        self.locks.remove(name);
    }

    /// Run the full pipeline for `name` under its app lock.
    ///
    /// Build and process failures are reported in the returned
    /// [`DeployReport`]. Only platform-fatal errors (and a record deleted
    /// while waiting for the lock) come back as `Err`.
    pub async fn deploy(
        &self,
        name: &str,
        trigger: DeployTrigger,
        wipe: bool,
    ) -> PlatformResult<DeployReport> {
        let lock = self.locks.lock_for(name);
        let _guard = lock.lock().await;

        let owned = name.to_string();
        let app = self
            .db
            .call(move |db| Ok(db.get_app(&owned)?))
            .await?
            .ok_or_else(|| PlatformError::not_found(name))?;

        self.building.insert(name.to_string());
        broadcast_message(
            &self.ws_tx,
            &PlatformEvent::DeployStarted {
                name: name.to_string(),
                trigger,
            },
        );
        broadcast_message(
            &self.ws_tx,
            &PlatformEvent::StatusChanged {
                name: name.to_string(),
                status: AppStatus::Building,
                detail: None,
            },
        );
        tracing::info!(app = %name, %trigger, wipe, "deploy started");

        let started_at = chrono::Utc::now().to_rfc3339();
        let first_seq = self.logs.next_seq(name);
        self.note(name, format!("==> Deploy ({}) started", trigger));

        let result = self.run_steps(&app, wipe).await;

        match &result {
            Ok(()) => self.note(name, "==> Deploy succeeded"),
            Err(e) => self.note(name, format!("==> Deploy failed: {}", e)),
        }
        self.building.remove(name);

        let error = result.as_ref().err().map(|e| e.to_string());
        self.record(
            name,
            DeployRecord {
                trigger,
                started_at,
                finished_at: chrono::Utc::now().to_rfc3339(),
                success: result.is_ok(),
                error: error.clone(),
            },
        );

        let transcript: Vec<LogLine> = self
            .logs
            .since(name, first_seq.saturating_sub(1))
            .into_iter()
            .filter(|l| l.stream == LogStream::Deploy)
            .collect();

        broadcast_message(
            &self.ws_tx,
            &PlatformEvent::DeployFinished {
                name: name.to_string(),
                trigger,
                success: result.is_ok(),
                error: error.clone(),
            },
        );
        let status = match self.supervisor.status(name) {
            AppStatus::Stopped if result.is_err() => AppStatus::Error,
            status => status,
        };
        broadcast_message(
            &self.ws_tx,
            &PlatformEvent::StatusChanged {
                name: name.to_string(),
                status,
                detail: error.clone(),
            },
        );

        match result {
            Ok(()) => {
                tracing::info!(app = %name, %trigger, "deploy finished");
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(app = %name, %trigger, error = %e, "deploy hit a platform-fatal error");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(app = %name, %trigger, error = %e, "deploy failed");
            }
        }

        Ok(DeployReport {
            app: name.to_string(),
            trigger,
            success: error.is_none(),
            wiped: wipe,
            logs: join_lines(&transcript),
            error,
        })
    }

    fn note(&self, name: &str, text: impl Into<String>) {
        self.logs.append(name, LogStream::Deploy, text);
    }

    fn record(&self, name: &str, record: DeployRecord) {
        let mut history = self.history.entry(name.to_string()).or_default();
        history.push_back(record);
        while history.len() > self.settings.history_limit.max(1) {
            history.pop_front();
        }
    }

    async fn run_steps(&self, app: &App, wipe: bool) -> PlatformResult<()> {
        let name = app.name.as_str();
        let home = self.app_home(name);
        let www = home.join(CHECKOUT_DIR);

        if wipe && home.exists() {
            self.note(name, "==> Wiping working directory");
            tokio::fs::remove_dir_all(&home)
                .await
                .map_err(|e| PlatformError::build(name, format!("failed to wipe workspace: {}", e)))?;
        }

        let fingerprint = WorkspaceFingerprint::of(app);
        let existing = WorkspaceFingerprint::load(&home)
            .map_err(|e| PlatformError::build(name, format!("{:#}", e)))?;
        if let Some(existing) = existing
            && existing != fingerprint
        {
            return Err(PlatformError::build(
                name,
                "workspace belongs to a different source or runtime; redeploy with wipe to rebuild it",
            ));
        }

        tokio::fs::create_dir_all(&home)
            .await
            .map_err(|e| PlatformError::build(name, format!("failed to create {}: {}", home.display(), e)))?;

        if www.join(".git").is_dir() {
            self.note(name, "==> Fetching latest source");
            self.run_step(name, "git fetch", git(&www, &["fetch", "origin", "HEAD"]), self.settings.git_timeout)
                .await?;
            self.run_step(
                name,
                "git reset",
                git(&www, &["reset", "--hard", "FETCH_HEAD"]),
                self.settings.git_timeout,
            )
            .await?;
        } else {
            if www.exists() {
                tokio::fs::remove_dir_all(&www)
                    .await
                    .map_err(|e| PlatformError::build(name, format!("failed to clear partial checkout: {}", e)))?;
            }
            self.note(name, format!("==> Cloning {}", app.repo_url));
            self.run_step(
                name,
                "git clone",
                git(&home, &["clone", "--", app.repo_url.as_str(), CHECKOUT_DIR]),
                self.settings.git_timeout,
            )
            .await?;
        }
        fingerprint
            .save(&home)
            .map_err(|e| PlatformError::build(name, format!("{:#}", e)))?;

        if let Some(install) = self
            .runtime
            .install_command(&app.language_version, &www)
            .map_err(|e| PlatformError::build(name, format!("{:#}", e)))?
        {
            self.note(name, format!("==> Installing runtime {}", app.language_version));
            self.run_step(name, "runtime install", install, self.settings.build_timeout)
                .await?;
        }

        self.note(name, format!("==> Building: {}", app.build_command));
        let build = self
            .runtime
            .command(&app.language_version, &app.build_command, &www);
        self.run_step(name, "build", build, self.settings.build_timeout)
            .await?;

        self.note(name, "==> Restarting process");
        self.supervisor.stop(name).await?;

        let owned = name.to_string();
        let reserved: HashSet<u16> = self
            .db
            .call(move |db| Ok(db.reserved_ports(&owned)?))
            .await?
            .into_iter()
            .collect();
        let info = self
            .supervisor
            .start(StartSpec {
                name: name.to_string(),
                domain: app.domain.clone(),
                workdir: www,
                start_command: app.start_command.clone(),
                language_version: app.language_version.clone(),
                port: app.port,
                reserved,
            })
            .await?;

        if app.port != Some(info.port) {
            let owned = name.to_string();
            let port = info.port;
            self.db
                .call(move |db| Ok(db.set_port(&owned, Some(port))?))
                .await?;
        }
        self.note(name, format!("==> Running on port {}", info.port));
        Ok(())
    }

    /// Run one bounded step, streaming its output into the deploy log.
    async fn run_step(
        &self,
        name: &str,
        label: &str,
        mut cmd: Command,
        timeout: Duration,
    ) -> PlatformResult<()> {
        let mut child = cmd
            .spawn()
            .map_err(|e| PlatformError::build(name, format!("failed to run {}: {}", label, e)))?;
        let pid = child.id().unwrap_or_default();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.logs.capture(name, LogStream::Deploy, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.logs.capture(name, LogStream::Deploy, stderr));
        }

        let outcome = tokio::time::timeout(timeout, child.wait()).await;
        let result = match outcome {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(PlatformError::build(
                name,
                format!("{} failed ({})", label, status),
            )),
            Ok(Err(e)) => Err(PlatformError::build(
                name,
                format!("failed to wait for {}: {}", label, e),
            )),
            Err(_) => {
                terminate_group(&mut child, pid, STEP_KILL_GRACE).await;
                Err(PlatformError::build(
                    name,
                    format!("{} timed out after {}s", label, timeout.as_secs()),
                ))
            }
        };

        // Background children may hold the pipes open; don't wait on them forever.
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
                abort.abort();
            }
        }
        result
    }
}

fn git(dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::db::AppDb;
    use crate::platform::ports::PortPool;
    use crate::platform::router::DomainRouter;
    use crate::platform::supervisor::{ProcessState, SupervisorSettings};
    use crate::platform::test_support::git_repo;
    use tempfile::TempDir;

    struct Harness {
        pipeline: DeployPipeline,
        supervisor: Arc<ProcessSupervisor>,
        router: Arc<DomainRouter>,
        db: DbHandle,
        data: TempDir,
        repo: PathBuf,
    }

    fn harness(history_limit: usize, build_timeout: Duration) -> Harness {
        let data = tempfile::tempdir().unwrap();
        let repo = data.path().join("src-repo");
        git_repo(&repo);

        let (tx, _) = broadcast::channel(1024);
        let db = DbHandle::new(AppDb::new_in_memory().unwrap());
        let router = Arc::new(DomainRouter::new(None));
        let logs = Arc::new(LogAggregator::new(1000, tx.clone()));
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::new(PortPool::new(24400, 24600)),
            router.clone(),
            logs.clone(),
            RuntimeManager::new(None),
            SupervisorSettings {
                stop_grace: Duration::from_secs(2),
                ready_timeout: None,
            },
            tx.clone(),
        ));
        let pipeline = DeployPipeline::new(
            db.clone(),
            supervisor.clone(),
            logs,
            RuntimeManager::new(None),
            PipelineSettings {
                apps_dir: data.path().join("apps"),
                build_timeout,
                git_timeout: Duration::from_secs(60),
                history_limit,
            },
            tx,
        );
        Harness {
            pipeline,
            supervisor,
            router,
            db,
            data,
            repo,
        }
    }

    fn create(h: &Harness, name: &str, build: &str) -> App {
        let config = AppConfig {
            repo_url: h.repo.display().to_string(),
            domain: format!("{}.paas.local", name),
            language_version: "node@20".into(),
            build_command: build.into(),
            start_command: "sleep 30".into(),
        };
        h.db.lock_sync().unwrap().create_app(name, &config).unwrap()
    }

    fn update(h: &Harness, name: &str, f: impl FnOnce(&mut AppConfig)) {
        let db = h.db.lock_sync().unwrap();
        let mut config = db.get_app(name).unwrap().unwrap().config();
        f(&mut config);
        db.update_app(name, &config).unwrap();
    }

    fn pid(h: &Harness, name: &str) -> u32 {
        match h.supervisor.state(name) {
            ProcessState::Running(info) => info.pid,
            other => panic!("expected running, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deploy_clones_builds_and_starts() {
        let h = harness(20, Duration::from_secs(60));
        create(&h, "demo", "echo built > built.txt");

        let report = h
            .pipeline
            .deploy("demo", DeployTrigger::Create, false)
            .await
            .unwrap();
        assert!(report.success, "logs: {}", report.logs);
        assert!(report.logs.contains("Cloning"));

        let www = h.pipeline.checkout_dir("demo");
        assert!(www.join("app.txt").exists());
        assert!(www.join("built.txt").exists());
        assert!(h.pipeline.app_home("demo").join(FINGERPRINT_FILE).exists());

        let stored = h.db.lock_sync().unwrap().get_app("demo").unwrap().unwrap();
        let port = stored.port.expect("port persisted");
        assert_eq!(h.router.resolve("demo.paas.local"), Some(port));
        assert_eq!(h.supervisor.status("demo"), AppStatus::Running);
        assert!(!h.pipeline.is_building("demo"));

        h.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_redeploy_unchanged_replaces_process_without_wipe() {
        let h = harness(20, Duration::from_secs(60));
        create(&h, "demo", "true");
        h.pipeline.deploy("demo", DeployTrigger::Create, false).await.unwrap();
        let first_pid = pid(&h, "demo");
        // A file outside the checkout survives a non-wiping redeploy.
        let marker = h.pipeline.app_home("demo").join("data.db");
        std::fs::write(&marker, "keep").unwrap();

        let report = h
            .pipeline
            .deploy("demo", DeployTrigger::Redeploy, false)
            .await
            .unwrap();
        assert!(report.success, "logs: {}", report.logs);
        assert!(report.logs.contains("Fetching"));
        assert!(!report.wiped);
        assert!(marker.exists());
        assert_ne!(pid(&h, "demo"), first_pid);
        assert_eq!(h.supervisor.running().len(), 1);

        h.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_failing_build_keeps_previous_process() {
        let h = harness(20, Duration::from_secs(60));
        create(&h, "demo", "true");
        h.pipeline.deploy("demo", DeployTrigger::Create, false).await.unwrap();
        let before = pid(&h, "demo");
        let port = h.router.resolve("demo.paas.local");

        update(&h, "demo", |c| c.build_command = "echo broken >&2; exit 1".into());
        let report = h
            .pipeline
            .deploy("demo", DeployTrigger::Edit, false)
            .await
            .unwrap();
        assert!(!report.success);
        assert!(report.logs.contains("broken"));
        assert!(report.error.unwrap().contains("build failed"));
        assert_eq!(pid(&h, "demo"), before);
        assert_eq!(h.router.resolve("demo.paas.local"), port);
        assert!(!h.pipeline.last_deploy("demo").unwrap().success);

        h.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_runtime_change_requires_wipe() {
        let h = harness(20, Duration::from_secs(60));
        create(&h, "demo", "true");
        h.pipeline.deploy("demo", DeployTrigger::Create, false).await.unwrap();
        let marker = h.pipeline.app_home("demo").join("cache.bin");
        std::fs::write(&marker, "stale").unwrap();

        update(&h, "demo", |c| c.language_version = "python@3.12".into());
        let refused = h
            .pipeline
            .deploy("demo", DeployTrigger::Edit, false)
            .await
            .unwrap();
        assert!(!refused.success);
        assert!(refused.error.unwrap().contains("different source or runtime"));
        assert!(marker.exists());

        let wiped = h
            .pipeline
            .deploy("demo", DeployTrigger::Edit, true)
            .await
            .unwrap();
        assert!(wiped.success, "logs: {}", wiped.logs);
        assert!(wiped.wiped);
        assert!(!marker.exists());

        h.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_deploys_serialize() {
        let h = harness(20, Duration::from_secs(60));
        // The build fails if another build of the same app is running.
        create(&h, "demo", "mkdir ../busy || exit 1; sleep 0.5; rmdir ../busy");

        let (a, b) = tokio::join!(
            h.pipeline.deploy("demo", DeployTrigger::Webhook, false),
            h.pipeline.deploy("demo", DeployTrigger::Redeploy, false),
        );
        assert!(a.unwrap().success);
        assert!(b.unwrap().success);
        assert_eq!(h.pipeline.history("demo").len(), 2);
        assert_eq!(h.supervisor.running().len(), 1);

        h.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_build_timeout_kills_step() {
        let h = harness(20, Duration::from_secs(1));
        create(&h, "slow", "sleep 30");
        let started = std::time::Instant::now();
        let report = h
            .pipeline
            .deploy("slow", DeployTrigger::Create, false)
            .await
            .unwrap();
        assert!(!report.success);
        assert!(report.error.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(h.supervisor.status("slow"), AppStatus::Stopped);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let h = harness(2, Duration::from_secs(60));
        create(&h, "demo", "exit 1");
        for _ in 0..3 {
            h.pipeline.deploy("demo", DeployTrigger::Redeploy, false).await.unwrap();
        }
        assert_eq!(h.pipeline.history("demo").len(), 2);
        h.pipeline.forget("demo");
        assert!(h.pipeline.history("demo").is_empty());
    }

    #[tokio::test]
    async fn test_bad_repo_fails_clone() {
        let h = harness(20, Duration::from_secs(60));
        create(&h, "demo", "true");
        update(&h, "demo", |c| {
            c.repo_url = h.data.path().join("nope").display().to_string()
        });
        let report = h
            .pipeline
            .deploy("demo", DeployTrigger::Create, false)
            .await
            .unwrap();
        assert!(!report.success);
        assert!(report.error.unwrap().contains("git clone"));
    }

    #[tokio::test]
    async fn test_deploy_missing_app_is_not_found() {
        let h = harness(20, Duration::from_secs(60));
        let err = h
            .pipeline
            .deploy("ghost", DeployTrigger::Redeploy, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::NotFound { .. }));
    }
}
