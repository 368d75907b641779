//! Request-level operations over the platform components.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::backup::{build_snapshot, import_message, validate_snapshot};
use super::changes::{classify_edit, merge_edit};
use super::db::{AppDb, DbHandle};
use super::logs::{LogAggregator, join_lines};
use super::models::*;
use super::pipeline::{DeployPipeline, PipelineSettings};
use super::ports::PortPool;
use super::router::{CaddySink, DashboardSite, DomainRouter, RouteSink, normalize_domain};
use super::runtime::RuntimeManager;
use super::supervisor::{ProcessState, ProcessSupervisor, StartSpec, SupervisorSettings};
use super::telemetry::TelemetrySampler;
use super::webhook::find_app_by_token;
use super::ws::{PlatformEvent, broadcast_message};
use crate::config::PlatformConfig;
use crate::errors::{PlatformError, PlatformResult};

const BASE_DOMAIN_KEY: &str = "base_domain";
const DEFAULT_LOG_LINES: usize = 100;

/// Rejects mutations after a platform-fatal error until an operator resumes.
#[derive(Default)]
pub struct HaltGate {
    reason: RwLock<Option<String>>,
}

impl HaltGate {
    pub fn check(&self) -> PlatformResult<()> {
        match self.reason.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(reason) => Err(PlatformError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(reason = %reason, "platform halted; mutations disabled");
        *self.reason.write().unwrap_or_else(|e| e.into_inner()) = Some(reason);
    }

    pub fn resume(&self) {
        let previous = self.reason.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reason) = previous {
            tracing::info!(previous = %reason, "platform resumed");
        }
    }

    pub fn status(&self) -> PlatformStatus {
        let reason = self.reason.read().unwrap_or_else(|e| e.into_inner()).clone();
        PlatformStatus {
            accepting_deploys: reason.is_none(),
            halt_reason: reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsView {
    pub logs: String,
    pub lines: Vec<LogLine>,
    pub next_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub app: AppView,
    pub deploy: DeployReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub app: AppView,
    pub requires_wipe: bool,
    pub plan: EditPlan,
    pub deploy: DeployReport,
}

/// Proxy site for the dashboard itself, upstream to the control plane's
/// own listener.
pub fn dashboard_site(config: &PlatformConfig) -> Option<DashboardSite> {
    let platform = &config.settings.platform;
    platform.dashboard_domain.as_ref().map(|domain| DashboardSite {
        domain: domain.clone(),
        upstream_port: platform.listen_port,
        basic_auth: platform
            .admin_user
            .clone()
            .zip(platform.admin_password_hash.clone()),
    })
}

pub struct ControlPlane {
    db: DbHandle,
    supervisor: Arc<ProcessSupervisor>,
    pipeline: Arc<DeployPipeline>,
    router: Arc<DomainRouter>,
    logs: Arc<LogAggregator>,
    telemetry: TelemetrySampler,
    halt: HaltGate,
    default_base_domain: String,
    ws_tx: broadcast::Sender<String>,
}

impl ControlPlane {
    /// Wire every component from configuration.
    pub fn new(
        config: &PlatformConfig,
        db: AppDb,
        ws_tx: broadcast::Sender<String>,
    ) -> anyhow::Result<Arc<Self>> {
        let settings = &config.settings;
        let sink: Option<Arc<dyn RouteSink>> = match settings.caddy.admin_url.as_deref() {
            Some(url) => Some(Arc::new(CaddySink::new(
                url,
                dashboard_site(config),
                config.caddy_sync_timeout(),
            )?) as Arc<dyn RouteSink>),
            None => None,
        };

        let db = DbHandle::new(db);
        let router = Arc::new(DomainRouter::new(sink).with_sync_timeout(config.caddy_sync_timeout()));
        let logs = Arc::new(LogAggregator::new(settings.logs.capacity, ws_tx.clone()));
        let runtime = RuntimeManager::new(settings.runtime.mise_path.clone());
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::new(PortPool::new(settings.ports.start, settings.ports.end)),
            router.clone(),
            logs.clone(),
            runtime.clone(),
            SupervisorSettings {
                stop_grace: config.stop_grace(),
                ready_timeout: config.ready_timeout(),
            },
            ws_tx.clone(),
        ));
        let pipeline = Arc::new(DeployPipeline::new(
            db.clone(),
            supervisor.clone(),
            logs.clone(),
            runtime,
            PipelineSettings {
                apps_dir: config.apps_dir(),
                build_timeout: config.build_timeout(),
                git_timeout: config.git_timeout(),
                history_limit: settings.pipeline.history_limit,
            },
            ws_tx.clone(),
        ));

        Ok(Arc::new(Self {
            db,
            supervisor,
            pipeline,
            router,
            logs,
            telemetry: TelemetrySampler::new(config.telemetry_interval()),
            halt: HaltGate::default(),
            default_base_domain: config.base_domain().to_string(),
            ws_tx,
        }))
    }

    pub fn halt_gate(&self) -> &HaltGate {
        &self.halt
    }

    /// Record platform-fatal errors on the halt gate before passing them on.
    fn guard<T>(&self, result: PlatformResult<T>) -> PlatformResult<T> {
        if let Err(e) = &result
            && e.is_fatal()
        {
            self.halt.halt(e.to_string());
        }
        result
    }

    fn emit(&self, event: PlatformEvent) {
        broadcast_message(&self.ws_tx, &event);
    }

    async fn load(&self, name: &str) -> PlatformResult<App> {
        let owned = name.to_string();
        self.db
            .call(move |db| Ok(db.get_app(&owned)?))
            .await?
            .ok_or_else(|| PlatformError::not_found(name))
    }

    fn derive_status(&self, name: &str) -> (AppStatus, Option<String>) {
        if self.pipeline.is_building(name) {
            return (AppStatus::Building, None);
        }
        match self.supervisor.state(name) {
            ProcessState::Running(_) => (AppStatus::Running, None),
            ProcessState::Failed(detail) => (AppStatus::Error, Some(detail)),
            ProcessState::Stopped => match self.pipeline.last_deploy(name) {
                Some(last) if !last.success => (AppStatus::Error, last.error),
                _ => (AppStatus::Stopped, None),
            },
        }
    }

    fn view(&self, app: App) -> AppView {
        let (status, status_detail) = self.derive_status(&app.name);
        AppView {
            app,
            status,
            status_detail,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub async fn list_apps(&self) -> PlatformResult<Vec<AppView>> {
        let apps = self.db.call(|db| Ok(db.list_apps()?)).await?;
        Ok(apps.into_iter().map(|app| self.view(app)).collect())
    }

    pub async fn get_app(&self, name: &str) -> PlatformResult<AppView> {
        Ok(self.view(self.load(name).await?))
    }

    pub async fn logs(&self, name: &str, lines: Option<usize>, since: Option<u64>) -> PlatformResult<LogsView> {
        self.load(name).await?;
        let selected = match since {
            Some(seq) => self.logs.since(name, seq),
            None => self.logs.tail(name, lines.unwrap_or(DEFAULT_LOG_LINES)),
        };
        Ok(LogsView {
            logs: join_lines(&selected),
            next_seq: self.logs.next_seq(name),
            lines: selected,
        })
    }

    pub async fn deploys(&self, name: &str) -> PlatformResult<Vec<DeployRecord>> {
        self.load(name).await?;
        Ok(self.pipeline.history(name))
    }

    pub fn routes(&self) -> Vec<Route> {
        self.router.routes()
    }

    pub fn system_stats(&self) -> SystemStats {
        self.telemetry.latest()
    }

    pub fn status(&self) -> PlatformStatus {
        self.halt.status()
    }

    pub fn resume(&self) -> PlatformStatus {
        self.halt.resume();
        self.halt.status()
    }

    pub async fn base_domain(&self) -> PlatformResult<String> {
        let stored = self
            .db
            .call(|db| Ok(db.get_setting(BASE_DOMAIN_KEY)?))
            .await?;
        Ok(stored.unwrap_or_else(|| self.default_base_domain.clone()))
    }

    pub async fn set_base_domain(&self, value: &str) -> PlatformResult<PlatformSettings> {
        self.halt.check()?;
        let value = value.trim().trim_end_matches('.').to_lowercase();
        validate_domain(&value)?;
        let stored = value.clone();
        let result = self
            .db
            .call(move |db| Ok(db.set_setting(BASE_DOMAIN_KEY, &stored)?))
            .await;
        self.guard(result)?;
        tracing::info!(base_domain = %value, "base domain updated");
        Ok(PlatformSettings { base_domain: value })
    }

    // ── Mutations ────────────────────────────────────────────────────

    async fn run_deploy(&self, name: &str, trigger: DeployTrigger, wipe: bool) -> PlatformResult<DeployReport> {
        let result = self.pipeline.deploy(name, trigger, wipe).await;
        self.guard(result)
    }

    /// Validate, insert and deploy a new app.
    pub async fn create_app(&self, req: DeployRequest) -> PlatformResult<CreateOutcome> {
        self.halt.check()?;
        validate_name(&req.name)?;
        let base = self.base_domain().await?;
        let config = AppConfig {
            repo_url: req.repo_url.trim().to_string(),
            domain: normalize_domain(&req.domain, &base, req.custom_domain.unwrap_or(false))?,
            language_version: req.language_version.trim().to_string(),
            build_command: req.build_command.trim().to_string(),
            start_command: req.start_command.trim().to_string(),
        };
        config.validate()?;

        let name = req.name.clone();
        let result = self
            .db
            .call(move |db| db.create_app(&name, &config))
            .await;
        let app = self.guard(result)?;
        tracing::info!(app = %app.name, domain = %app.domain, "app created");
        self.emit(PlatformEvent::AppCreated { app: app.clone() });

        let deploy = self.run_deploy(&app.name, DeployTrigger::Create, false).await?;
        let app = self.get_app(&req.name).await?;
        Ok(CreateOutcome { app, deploy })
    }

    pub async fn plan_edit(&self, name: &str, req: &EditRequest) -> PlatformResult<EditPlan> {
        let current = self.load(name).await?;
        let base = self.base_domain().await?;
        let next = merge_edit(&current, req, &base)?;
        Ok(classify_edit(&current.config(), &next))
    }

    /// Apply an edit. Destructive edits need `confirm_wipe`.
    pub async fn apply_edit(&self, name: &str, req: EditRequest) -> PlatformResult<EditOutcome> {
        self.halt.check()?;
        let current = self.load(name).await?;
        let base = self.base_domain().await?;
        let next = merge_edit(&current, &req, &base)?;
        let plan = classify_edit(&current.config(), &next);
        if plan.requires_wipe && !req.confirm_wipe {
            return Err(PlatformError::ConfirmationRequired {
                name: name.to_string(),
                reasons: plan.reasons,
            });
        }

        let app = {
            // An in-flight deploy finishes on the old record before the route moves.
            let lock = self.pipeline.locks().lock_for(name);
            let _guard = lock.lock().await;
            let owned = name.to_string();
            let config = next.clone();
            let result = self
                .db
                .call(move |db| db.update_app(&owned, &config))
                .await;
            let app = self.guard(result)?;
            if current.domain != next.domain {
                self.supervisor.reroute(name, &next.domain).await?;
            }
            app
        };
        tracing::info!(app = %name, changed = ?plan.changed_fields, wipe = plan.requires_wipe, "app updated");
        self.emit(PlatformEvent::AppUpdated {
            app,
            requires_wipe: plan.requires_wipe,
        });

        let deploy = self
            .run_deploy(name, DeployTrigger::Edit, plan.requires_wipe)
            .await?;
        Ok(EditOutcome {
            app: self.get_app(name).await?,
            requires_wipe: plan.requires_wipe,
            plan,
            deploy,
        })
    }

    /// Create-or-update used by the `/api/deploy` endpoint.
    ///
    /// Without an explicit `custom_domain`, a domain containing a dot is
    /// taken as custom and kept verbatim.
    pub async fn deploy_request(&self, mut req: DeployRequest) -> PlatformResult<(AppView, DeployReport)> {
        let custom = req
            .custom_domain
            .unwrap_or_else(|| req.domain.trim().trim_end_matches('.').contains('.'));
        req.custom_domain = Some(custom);
        let owned = req.name.clone();
        let exists = self
            .db
            .call(move |db| Ok(db.get_app(&owned)?))
            .await?
            .is_some();
        if !exists {
            let outcome = self.create_app(req).await?;
            return Ok((outcome.app, outcome.deploy));
        }
        let edit = EditRequest {
            name: Some(req.name.clone()),
            repo_url: Some(req.repo_url),
            domain: Some(req.domain),
            custom_domain: custom,
            build_command: Some(req.build_command),
            start_command: Some(req.start_command),
            language_version: Some(req.language_version),
            confirm_wipe: req.confirm_wipe,
        };
        let outcome = self.apply_edit(&req.name, edit).await?;
        Ok((outcome.app, outcome.deploy))
    }

    pub async fn redeploy(&self, name: &str, wipe: bool) -> PlatformResult<DeployReport> {
        self.halt.check()?;
        self.load(name).await?;
        self.run_deploy(name, DeployTrigger::Redeploy, wipe).await
    }

    pub async fn start_app(&self, name: &str) -> PlatformResult<AppView> {
        self.halt.check()?;
        let lock = self.pipeline.locks().lock_for(name);
        let _guard = lock.lock().await;
        let result = self.start_locked(name).await;
        self.guard(result)?;
        self.get_app(name).await
    }

    async fn start_locked(&self, name: &str) -> PlatformResult<()> {
        let app = self.load(name).await?;
        let workdir = self.pipeline.checkout_dir(name);
        if !workdir.is_dir() {
            return Err(PlatformError::process(name, "app has not been built yet; redeploy it first"));
        }
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
                workdir,
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
        Ok(())
    }

    pub async fn stop_app(&self, name: &str) -> PlatformResult<AppView> {
        self.halt.check()?;
        self.load(name).await?;
        let lock = self.pipeline.locks().lock_for(name);
        let _guard = lock.lock().await;
        self.supervisor.stop(name).await?;
        self.get_app(name).await
    }

    /// Stop the process, release port and route, delete on-disk artifacts,
    /// then remove the record. Waits for any in-flight deploy first.
    pub async fn delete_app(&self, name: &str) -> PlatformResult<()> {
        self.halt.check()?;
        self.load(name).await?;
        {
            let lock = self.pipeline.locks().lock_for(name);
            let _guard = lock.lock().await;

            self.supervisor.remove(name).await?;
            let home = self.pipeline.app_home(name);
            if home.exists() {
                tokio::fs::remove_dir_all(&home).await.map_err(|e| {
                    PlatformError::process(name, format!("failed to remove {}: {}", home.display(), e))
                })?;
            }
            self.logs.remove(name);

            let owned = name.to_string();
            let result = self.db.call(move |db| Ok(db.delete_app(&owned)?)).await;
            self.guard(result)?;
        }
        self.pipeline.forget(name);
        tracing::info!(app = %name, "app deleted");
        self.emit(PlatformEvent::AppDeleted {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Authenticate a webhook and queue a deploy for the owning app.
    pub async fn handle_webhook(self: &Arc<Self>, token: &str) -> PlatformResult<String> {
        self.halt.check()?;
        let candidates = self.db.call(|db| Ok(db.list_tokens()?)).await?;
        let name = match find_app_by_token(token, &candidates) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!("webhook rejected: unknown deploy token");
                return Err(e);
            }
        };
        tracing::info!(app = %name, "webhook accepted");
        self.spawn_deploy(name.clone(), DeployTrigger::Webhook, false);
        Ok(name)
    }

    fn spawn_deploy(self: &Arc<Self>, name: String, trigger: DeployTrigger, wipe: bool) {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = control.run_deploy(&name, trigger, wipe).await {
                tracing::warn!(app = %name, %trigger, error = %e, "background deploy failed");
            }
        });
    }

    // ── Backup / restore ─────────────────────────────────────────────

    pub async fn export(&self) -> PlatformResult<Snapshot> {
        let apps = self.db.call(|db| Ok(db.list_apps()?)).await?;
        let base = self.base_domain().await?;
        Ok(build_snapshot(&apps, &base))
    }

    pub fn validate_snapshot(&self, value: &Value) -> PlatformResult<usize> {
        Ok(validate_snapshot(value)?.apps.len())
    }

    /// Merge a snapshot into the store, optionally redeploying every app in it.
    pub async fn import(
        self: &Arc<Self>,
        value: &Value,
        redeploy: bool,
        confirm_wipe: bool,
    ) -> PlatformResult<ImportReport> {
        self.halt.check()?;
        let snapshot = validate_snapshot(value)?;
        let entries = snapshot.apps;
        let result = self
            .db
            .call(move |db| db.merge_snapshot(&entries))
            .await;
        let outcome = self.guard(result)?;

        let mut report = ImportReport {
            created: outcome.created,
            updated: outcome.updated,
            unchanged: outcome.unchanged,
            requires_wipe: outcome.requires_wipe,
            ..Default::default()
        };

        for name in report.created.iter().chain(report.updated.iter()) {
            let owned = name.clone();
            if let Some(app) = self.db.call(move |db| Ok(db.get_app(&owned)?)).await? {
                let requires_wipe = report.requires_wipe.contains(name);
                if report.created.contains(name) {
                    self.emit(PlatformEvent::AppCreated { app });
                } else {
                    self.emit(PlatformEvent::AppUpdated { app, requires_wipe });
                }
            }
        }

        if redeploy {
            let targets: Vec<String> = report
                .created
                .iter()
                .chain(report.updated.iter())
                .chain(report.unchanged.iter())
                .cloned()
                .collect();
            for name in targets {
                let wipe = report.requires_wipe.contains(&name);
                if wipe && !confirm_wipe {
                    continue;
                }
                self.spawn_deploy(name.clone(), DeployTrigger::Import, wipe);
                report.redeploy_scheduled.push(name);
            }
        }

        report.message = import_message(&report);
        tracing::info!(
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            scheduled = report.redeploy_scheduled.len(),
            "snapshot imported"
        );
        Ok(report)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start every app that already has a built checkout. Failures are
    /// recorded per app and never abort startup.
    pub async fn restore(&self) -> PlatformResult<()> {
        let apps = self.db.call(|db| Ok(db.list_apps()?)).await?;
        for app in apps {
            if !self.pipeline.checkout_dir(&app.name).is_dir() {
                continue;
            }
            let lock = self.pipeline.locks().lock_for(&app.name);
            let _guard = lock.lock().await;
            match self.start_locked(&app.name).await {
                Ok(()) => tracing::info!(app = %app.name, "restored"),
                Err(PlatformError::PortsExhausted) => {
                    self.halt.halt(PlatformError::PortsExhausted.to_string());
                    break;
                }
                Err(e) => tracing::warn!(app = %app.name, error = %e, "failed to restore app"),
            }
        }
        Ok(())
    }

    pub fn start_telemetry(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.telemetry.start(cancel)
    }

    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
    }
}
