//! Platform control plane: deploy, supervise and route git-backed apps.
//!
//! ## Overview
//!
//! Each application is a git repository plus a language runtime, a build
//! command and a start command. A deploy clones or updates the checkout,
//! installs the runtime, builds, then swaps the running process and points
//! the app's domain at its new port. Operators drive it over HTTP, the CLI
//! or webhooks, and watch progress over a WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig, lock)    │
//! │  / CLI   │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         v                                        │
//!                       │  control.rs  (ControlPlane, HaltGate)            │
//!                       │         │                                        │
//!                       │         │ DeployPipeline::deploy()               │
//!                       │         v                                        │
//!                       │  pipeline.rs  (AppLockMap, workspace, steps)     │
//!                       │         │                                        │
//!                       │         │ ProcessSupervisor::start()/stop()      │
//!                       │         v                                        │
//!                       │  supervisor.rs  (watchers, signals, readiness)   │
//!                       │         │                                        │
//!                       │         ├─ ports.rs   (PortPool)                 │
//!                       │         ├─ router.rs  (DomainRouter, Caddy)      │
//!                       │         └─ logs.rs    (LogAggregator)            │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `models`    | Shared types: `App`, `AppConfig`, `DeployReport`, ...   |
//! | `db`        | SQLite App Store via `DbHandle` (thin `Arc<Mutex<_>>`)  |
//! | `changes`   | Destructive-edit classification                         |
//! | `webhook`   | Constant-time deploy-token lookup                       |
//! | `backup`    | Snapshot export and validation                          |
//! | `runtime`   | `mise` wrapping for per-app language runtimes           |
//! | `telemetry` | Periodic CPU / memory / disk sampling                   |
//! | `ws`        | `PlatformEvent` enum + `broadcast_message()` helper     |

pub mod api;
pub mod backup;
pub mod changes;
pub mod control;
pub mod db;
pub mod logs;
pub mod models;
pub mod pipeline;
pub mod ports;
pub mod router;
pub mod runtime;
pub mod server;
pub mod supervisor;
pub mod telemetry;
pub mod webhook;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command;

    /// Initialise a one-commit git repository at `dir`.
    pub(crate) fn git_repo(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir)
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-q"]);
        std::fs::write(dir.join("app.txt"), "v1\n").unwrap();
        run(&["add", "."]);
        run(&[
            "-c",
            "user.email=ci@example.com",
            "-c",
            "user.name=ci",
            "commit",
            "-q",
            "-m",
            "init",
        ]);
    }
}
