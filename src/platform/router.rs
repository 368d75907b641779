//! Domain → port routing table with optional reverse-proxy sync.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;

use super::models::{Route, validate_domain};
use crate::errors::{PlatformError, PlatformResult};

/// Receives the full routing table after every change.
#[async_trait]
pub trait RouteSink: Send + Sync {
    async fn sync(&self, routes: &[Route]) -> Result<()>;
}

/// Build the routing key for an app.
///
/// A bare label gets `.<base_domain>` appended; a value already under the
/// base domain, or any value when `custom` is set, is used as given.
pub fn normalize_domain(input: &str, base_domain: &str, custom: bool) -> PlatformResult<String> {
    let input = input.trim().trim_end_matches('.').to_lowercase();
    let base = base_domain.trim().to_lowercase();
    let domain = if custom || input == base || input.ends_with(&format!(".{}", base)) {
        input
    } else {
        format!("{}.{}", input, base)
    };
    validate_domain(&domain)?;
    Ok(domain)
}

/// Default bound on a single sink push.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DomainRouter {
    table: RwLock<HashMap<String, Route>>,
    sink: Option<Arc<dyn RouteSink>>,
    // Pushes are serialized so the sink always ends on the latest table.
    sync_lock: tokio::sync::Mutex<()>,
    sync_timeout: Duration,
}

impl DomainRouter {
    pub fn new(sink: Option<Arc<dyn RouteSink>>) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            sink,
            sync_lock: tokio::sync::Mutex::new(()),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Route>> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Route>> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Point `domain` at `app`'s port. Fails if another app owns the domain.
    pub async fn register(&self, domain: &str, app: &str, port: u16) -> PlatformResult<()> {
        {
            let mut table = self.write_table();
            if let Some(existing) = table.get(domain)
                && existing.app != app
            {
                return Err(PlatformError::Conflict(format!(
                    "Domain '{}' is routed to '{}'",
                    domain, existing.app
                )));
            }
            // One route per app: drop any stale domain it held.
            table.retain(|_, r| r.app != app);
            table.insert(
                domain.to_string(),
                Route {
                    domain: domain.to_string(),
                    app: app.to_string(),
                    port,
                },
            );
        }
        tracing::info!(domain, app, port, "route registered");
        self.push().await;
        Ok(())
    }

    pub async fn unregister(&self, domain: &str) {
        let removed = self.write_table().remove(domain);
        if let Some(route) = removed {
            tracing::info!(domain, app = %route.app, "route removed");
            self.push().await;
        }
    }

    /// Remove whatever route `app` currently holds.
    pub async fn unregister_app(&self, app: &str) {
        let changed = {
            let mut table = self.write_table();
            let before = table.len();
            table.retain(|_, r| r.app != app);
            table.len() != before
        };
        if changed {
            tracing::info!(app, "routes removed");
            self.push().await;
        }
    }

    pub fn resolve(&self, domain: &str) -> Option<u16> {
        self.read_table().get(domain).map(|r| r.port)
    }

    pub fn route_for_app(&self, app: &str) -> Option<Route> {
        self.read_table().values().find(|r| r.app == app).cloned()
    }

    /// All routes sorted by domain.
    pub fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.read_table().values().cloned().collect();
        routes.sort_by(|a, b| a.domain.cmp(&b.domain));
        routes
    }

    /// Push the current table to the sink. Failures and timeouts only warn;
    /// the next change pushes the full table again.
    pub async fn push(&self) {
        let Some(sink) = &self.sink else {
            return;
        };
        let _guard = self.sync_lock.lock().await;
        let routes = self.routes();
        match tokio::time::timeout(self.sync_timeout, sink.sync(&routes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %format!("{:#}", e), "reverse proxy sync failed");
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.sync_timeout.as_secs_f64(),
                    "reverse proxy sync timed out"
                );
            }
        }
    }
}

// ── Caddy ────────────────────────────────────────────────────────────

/// Dashboard site fronting the control plane itself.
#[derive(Debug, Clone)]
pub struct DashboardSite {
    pub domain: String,
    pub upstream_port: u16,
    /// `(user, bcrypt hash)` for basic auth on everything except webhooks.
    pub basic_auth: Option<(String, String)>,
}

/// Render a complete Caddyfile for the given routes.
pub fn render_caddyfile(routes: &[Route], dashboard: Option<&DashboardSite>) -> String {
    let mut lines = vec!["{".to_string(), "    debug".to_string(), "}".to_string()];

    if let Some(site) = dashboard {
        lines.push(format!("{} {{", site.domain));
        if let Some((user, hash)) = &site.basic_auth {
            lines.push("    @secure {".to_string());
            lines.push("        not path /api/hooks/*".to_string());
            lines.push("    }".to_string());
            lines.push("    basic_auth @secure {".to_string());
            lines.push(format!("        {} {}", user, hash));
            lines.push("    }".to_string());
        }
        lines.push(format!("    reverse_proxy localhost:{}", site.upstream_port));
        lines.push("}".to_string());
    }

    for route in routes {
        lines.push(format!("{} {{", route.domain));
        lines.push(format!("    reverse_proxy localhost:{}", route.port));
        lines.push("}".to_string());
    }

    lines.join("\n")
}

/// Loads the rendered Caddyfile through Caddy's admin API.
pub struct CaddySink {
    client: reqwest::Client,
    admin_url: String,
    dashboard: Option<DashboardSite>,
}

impl CaddySink {
    /// Every request to the admin API gives up after `timeout`.
    pub fn new(admin_url: &str, dashboard: Option<DashboardSite>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create Caddy admin client: {}", e))?;
        Ok(Self {
            client,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            dashboard,
        })
    }
}

#[async_trait]
impl RouteSink for CaddySink {
    async fn sync(&self, routes: &[Route]) -> Result<()> {
        let body = render_caddyfile(routes, self.dashboard.as_ref());
        self.client
            .post(format!("{}/load", self.admin_url))
            .header("Content-Type", "text/caddyfile")
            .body(body)
            .send()
            .await
            .context("Failed to reach Caddy admin API")?
            .error_for_status()
            .context("Caddy rejected the configuration")?;
        tracing::debug!(routes = routes.len(), "caddy configuration loaded");
        Ok(())
    }
}
