//! Process Supervisor: one live OS process per application.
//!
//! Each app has a slot holding its process state and an operation lock that
//! serializes Start/Stop. A running process is owned by a watcher task which
//! either observes an unexpected exit or performs the SIGTERM → SIGKILL
//! sequence on request.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot};

use super::logs::LogAggregator;
use super::models::{AppStatus, LogStream};
use super::ports::PortPool;
use super::router::DomainRouter;
use super::runtime::RuntimeManager;
use super::ws::{PlatformEvent, broadcast_message};
use crate::errors::{PlatformError, PlatformResult};

/// Upper bound on waiting for a child after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(100);

/// Everything needed to launch an app's start command.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub name: String,
    pub domain: String,
    pub workdir: PathBuf,
    pub start_command: String,
    pub language_version: String,
    /// Port persisted for this app, if any.
    pub port: Option<u16>,
    /// Ports recorded in the store for other apps.
    pub reserved: HashSet<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub port: u16,
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ProcessState {
    #[default]
    Stopped,
    Running(ProcessInfo),
    /// Unexpected exit or failed start.
    Failed(String),
}

impl ProcessState {
    pub fn status(&self) -> AppStatus {
        match self {
            Self::Stopped => AppStatus::Stopped,
            Self::Running(_) => AppStatus::Running,
            Self::Failed(_) => AppStatus::Error,
        }
    }
}

type StopRequest = oneshot::Sender<()>;

#[derive(Default)]
struct SlotState {
    process: ProcessState,
    generation: u64,
    /// Present while a watcher owns a live child and no stop is in progress.
    control: Option<oneshot::Sender<StopRequest>>,
}

#[derive(Default)]
struct Slot {
    op: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn state(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub stop_grace: Duration,
    pub ready_timeout: Option<Duration>,
}

pub struct ProcessSupervisor {
    slots: DashMap<String, Arc<Slot>>,
    ports: Arc<PortPool>,
    router: Arc<DomainRouter>,
    logs: Arc<LogAggregator>,
    runtime: RuntimeManager,
    settings: SupervisorSettings,
    ws_tx: broadcast::Sender<String>,
}

impl ProcessSupervisor {
    pub fn new(
        ports: Arc<PortPool>,
        router: Arc<DomainRouter>,
        logs: Arc<LogAggregator>,
        runtime: RuntimeManager,
        settings: SupervisorSettings,
        ws_tx: broadcast::Sender<String>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            ports,
            router,
            logs,
            runtime,
            settings,
            ws_tx,
        }
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Slot::default()))
            .clone()
    }

    pub fn state(&self, name: &str) -> ProcessState {
        self.slots
            .get(name)
            .map(|slot| slot.state().process.clone())
            .unwrap_or_default()
    }

    pub fn status(&self, name: &str) -> AppStatus {
        self.state(name).status()
    }

    fn publish_status(&self, name: &str, state: &ProcessState) {
        let detail = match state {
            ProcessState::Failed(detail) => Some(detail.clone()),
            _ => None,
        };
        broadcast_message(
            &self.ws_tx,
            &PlatformEvent::StatusChanged {
                name: name.to_string(),
                status: state.status(),
                detail,
            },
        );
    }

    fn set_failed(&self, slot: &Slot, name: &str, detail: String) {
        let state = ProcessState::Failed(detail.clone());
        slot.state().process = state.clone();
        self.logs.append(name, LogStream::System, detail);
        self.publish_status(name, &state);
    }

    /// Start the app. A live process is returned as-is instead of spawning another.
    pub async fn start(self: &Arc<Self>, spec: StartSpec) -> PlatformResult<ProcessInfo> {
        let slot = self.slot(&spec.name);
        let _op = slot.op.lock().await;

        if let ProcessState::Running(info) = &slot.state().process {
            tracing::debug!(app = %spec.name, pid = info.pid, "start coalesced with live process");
            return Ok(info.clone());
        }

        match self.launch(&slot, &spec).await {
            Ok(info) => Ok(info),
            Err(e) => {
                if !matches!(e, PlatformError::PortsExhausted) {
                    self.set_failed(&slot, &spec.name, format!("Start failed: {}", e));
                }
                Err(e)
            }
        }
    }

    async fn launch(self: &Arc<Self>, slot: &Arc<Slot>, spec: &StartSpec) -> PlatformResult<ProcessInfo> {
        let name = spec.name.as_str();
        if !spec.workdir.is_dir() {
            return Err(PlatformError::process(
                name,
                format!("working directory {} does not exist", spec.workdir.display()),
            ));
        }

        let port = match spec.port {
            Some(port) => {
                self.ports.lease(name, port)?;
                port
            }
            None => self.ports.allocate(name, &spec.reserved)?,
        };

        let mut cmd = self
            .runtime
            .command(&spec.language_version, &spec.start_command, &spec.workdir);
        cmd.env("PORT", port.to_string());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(name, port);
                return Err(PlatformError::process(name, format!("failed to spawn: {}", e)));
            }
        };
        let Some(pid) = child.id() else {
            self.ports.release(name, port);
            return Err(PlatformError::process(name, "process exited before it could be tracked"));
        };

        if let Some(stdout) = child.stdout.take() {
            self.logs.capture(name, LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.logs.capture(name, LogStream::Stderr, stderr);
        }

        if let Some(timeout) = self.settings.ready_timeout
            && let Err(e) = wait_ready(&mut child, port, timeout).await
        {
            terminate_group(&mut child, pid, self.settings.stop_grace).await;
            self.ports.release(name, port);
            return Err(PlatformError::process(name, e));
        }

        if let Err(e) = self.router.register(&spec.domain, name, port).await {
            terminate_group(&mut child, pid, self.settings.stop_grace).await;
            self.ports.release(name, port);
            return Err(e);
        }

        let info = ProcessInfo {
            pid,
            port,
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let (control_tx, control_rx) = oneshot::channel();
        let generation = {
            let mut state = slot.state();
            state.generation += 1;
            state.process = ProcessState::Running(info.clone());
            state.control = Some(control_tx);
            state.generation
        };

        let supervisor = Arc::clone(self);
        let watch_slot = Arc::clone(slot);
        let app = name.to_string();
        tokio::spawn(async move {
            supervisor
                .watch(watch_slot, app, child, pid, port, generation, control_rx)
                .await;
        });

        tracing::info!(app = %name, pid, port, "process started");
        self.logs.append(
            name,
            LogStream::System,
            format!("Started on port {} (pid {})", port, pid),
        );
        self.publish_status(name, &ProcessState::Running(info.clone()));
        Ok(info)
    }

    #[allow(clippy::too_many_arguments)]
    async fn watch(
        &self,
        slot: Arc<Slot>,
        app: String,
        mut child: Child,
        pid: u32,
        port: u16,
        generation: u64,
        control_rx: oneshot::Receiver<StopRequest>,
    ) {
        enum Outcome {
            Exited(std::io::Result<ExitStatus>),
            Stop(Option<StopRequest>),
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            request = control_rx => Outcome::Stop(request.ok()),
        };

        match outcome {
            Outcome::Stop(reply) => {
                terminate_group(&mut child, pid, self.settings.stop_grace).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Outcome::Exited(status) => {
                let unexpected = {
                    let mut state = slot.state();
                    // A taken control handle means Stop is already tearing down.
                    if state.generation == generation && state.control.take().is_some() {
                        state.process = ProcessState::Stopped;
                        true
                    } else {
                        false
                    }
                };
                if !unexpected {
                    return;
                }
                // Reap anything the shell left behind.
                signal_group(pid, libc::SIGKILL);
                self.router.unregister_app(&app).await;
                self.ports.release(&app, port);
                let detail = match status {
                    Ok(status) => match status.code() {
                        Some(code) => format!("Process exited unexpectedly with code {}", code),
                        None => format!("Process terminated unexpectedly ({})", status),
                    },
                    Err(e) => format!("Lost track of process: {}", e),
                };
                tracing::warn!(app = %app, pid, detail = %detail, "process exited");
                // Only record the failure if no new start happened meanwhile.
                let still_current = slot.state().generation == generation;
                if still_current {
                    self.set_failed(&slot, &app, detail);
                }
            }
        }
    }

    /// Stop the app: unregister the route, then terminate the process group.
    /// Idempotent for stopped apps.
    pub async fn stop(&self, name: &str) -> PlatformResult<()> {
        let slot = self.slot(name);
        let _op = slot.op.lock().await;

        let (control, port) = {
            let mut state = slot.state();
            let port = match &state.process {
                ProcessState::Running(info) => Some(info.port),
                _ => None,
            };
            (state.control.take(), port)
        };

        self.router.unregister_app(name).await;

        if let Some(control) = control {
            let (reply_tx, reply_rx) = oneshot::channel();
            if control.send(reply_tx).is_ok() {
                let bound = self.settings.stop_grace + KILL_WAIT + KILL_WAIT;
                if tokio::time::timeout(bound, reply_rx).await.is_err() {
                    tracing::warn!(app = %name, "process did not confirm termination in time");
                }
            }
        }
        if let Some(port) = port {
            self.ports.release(name, port);
        }

        let was = std::mem::replace(&mut slot.state().process, ProcessState::Stopped);
        if was != ProcessState::Stopped {
            tracing::info!(app = %name, "process stopped");
            self.logs.append(name, LogStream::System, "Stopped");
            self.publish_status(name, &ProcessState::Stopped);
        }
        Ok(())
    }

    /// Point a running app at a new domain.
    pub async fn reroute(&self, name: &str, domain: &str) -> PlatformResult<()> {
        if let ProcessState::Running(info) = self.state(name) {
            self.router.register(domain, name, info.port).await?;
        }
        Ok(())
    }

    /// Stop the app and forget its slot.
    pub async fn remove(&self, name: &str) -> PlatformResult<()> {
        self.stop(name).await?;
        self.slots.remove(name);
        Ok(())
    }

    /// Stop every supervised process. Used on shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::warn!(app = %name, error = %e, "failed to stop during shutdown");
            }
        }
    }

    pub fn running(&self) -> Vec<(String, ProcessInfo)> {
        self.slots
            .iter()
            .filter_map(|entry| match &entry.value().state().process {
                ProcessState::Running(info) => Some((entry.key().clone(), info.clone())),
                _ => None,
            })
            .collect()
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the process group we created
    // with process_group(0); it has no memory-safety preconditions.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

/// SIGTERM the child's process group, wait `grace`, then SIGKILL.
pub async fn terminate_group(child: &mut Child, pid: u32, grace: Duration) {
    signal_group(pid, libc::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        signal_group(pid, libc::SIGKILL);
        return;
    }
    tracing::debug!(pid, "grace period elapsed; sending SIGKILL");
    signal_group(pid, libc::SIGKILL);
    let _ = child.start_kill();
    let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
}

/// Poll until `127.0.0.1:port` accepts a connection.
async fn wait_ready(child: &mut Child, port: u16, timeout: Duration) -> Result<(), String> {
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(format!("process exited during startup ({})", status));
        }
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "port {} not ready after {}s",
                port,
                timeout.as_secs()
            ));
        }
        tokio::time::sleep(READY_POLL).await;
    }
}
