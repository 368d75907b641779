use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::{PlatformError, PlatformResult};

/// Async-safe handle to the App Store.
///
/// Wraps `AppDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<AppDb>>,
}

impl DbHandle {
    pub fn new(db: AppDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> PlatformResult<R>
    where
        F: FnOnce(&AppDb) -> PlatformResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used by CLI commands and
    /// tests, never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, AppDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct AppDb {
    conn: Connection,
}

const APP_COLUMNS: &str = "id, name, repo_url, domain, language_version, build_command, start_command, port, deploy_token, created_at, updated_at";

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<App> {
    Ok(App {
        id: row.get(0)?,
        name: row.get(1)?,
        repo_url: row.get(2)?,
        domain: row.get(3)?,
        language_version: row.get(4)?,
        build_command: row.get(5)?,
        start_command: row.get(6)?,
        port: row.get(7)?,
        deploy_token: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn new_deploy_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl AppDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS apps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    repo_url TEXT NOT NULL,
                    domain TEXT NOT NULL UNIQUE,
                    language_version TEXT NOT NULL,
                    build_command TEXT NOT NULL,
                    start_command TEXT NOT NULL,
                    port INTEGER,
                    deploy_token TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── App CRUD ──────────────────────────────────────────────────────

    /// Insert a new record. Name and domain uniqueness are checked under the
    /// same connection lock as the insert.
    pub fn create_app(&self, name: &str, config: &AppConfig) -> PlatformResult<App> {
        if self.get_app(name)?.is_some() {
            return Err(PlatformError::Conflict(format!(
                "App '{}' already exists",
                name
            )));
        }
        if let Some(owner) = self.get_app_by_domain(&config.domain)? {
            return Err(PlatformError::Conflict(format!(
                "Domain '{}' is already used by '{}'",
                config.domain, owner.name
            )));
        }
        insert_app(&self.conn, name, config)?;
        Ok(self
            .get_app(name)?
            .context("App not found after insert")?)
    }

    pub fn list_apps(&self) -> Result<Vec<App>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM apps ORDER BY name", APP_COLUMNS))
            .context("Failed to prepare list_apps")?;
        let rows = stmt
            .query_map([], app_from_row)
            .context("Failed to query apps")?;
        let mut apps = Vec::new();
        for row in rows {
            apps.push(row.context("Failed to read app row")?);
        }
        Ok(apps)
    }

    pub fn get_app(&self, name: &str) -> Result<Option<App>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM apps WHERE name = ?1", APP_COLUMNS),
                params![name],
                app_from_row,
            )
            .optional()
            .context("Failed to query app")
    }

    pub fn get_app_by_domain(&self, domain: &str) -> Result<Option<App>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM apps WHERE domain = ?1", APP_COLUMNS),
                params![domain],
                app_from_row,
            )
            .optional()
            .context("Failed to query app by domain")
    }

    /// `(name, deploy_token)` for every record, used by the webhook gateway.
    pub fn list_tokens(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, deploy_token FROM apps")
            .context("Failed to prepare list_tokens")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query tokens")?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row.context("Failed to read token row")?);
        }
        Ok(tokens)
    }

    /// Replace the mutable fields of `name`. The domain must not belong to
    /// another record.
    pub fn update_app(&self, name: &str, config: &AppConfig) -> PlatformResult<App> {
        if let Some(owner) = self.get_app_by_domain(&config.domain)?
            && owner.name != name
        {
            return Err(PlatformError::Conflict(format!(
                "Domain '{}' is already used by '{}'",
                config.domain, owner.name
            )));
        }
        let count = update_app_fields(&self.conn, name, config)?;
        if count == 0 {
            return Err(PlatformError::not_found(name));
        }
        Ok(self
            .get_app(name)?
            .context("App not found after update")?)
    }

    pub fn set_port(&self, name: &str, port: Option<u16>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE apps SET port = ?1, updated_at = ?2 WHERE name = ?3",
                params![port, now(), name],
            )
            .context("Failed to update app port")?;
        Ok(())
    }

    /// Ports recorded for every record other than `except`.
    pub fn reserved_ports(&self, except: &str) -> Result<Vec<u16>> {
        let mut stmt = self
            .conn
            .prepare("SELECT port FROM apps WHERE port IS NOT NULL AND name != ?1")
            .context("Failed to prepare reserved_ports")?;
        let rows = stmt
            .query_map(params![except], |row| row.get::<_, u16>(0))
            .context("Failed to query reserved ports")?;
        let mut ports = Vec::new();
        for row in rows {
            ports.push(row.context("Failed to read port row")?);
        }
        Ok(ports)
    }

    pub fn delete_app(&self, name: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM apps WHERE name = ?1", params![name])
            .context("Failed to delete app")?;
        Ok(count > 0)
    }

    // ── Snapshot merge ────────────────────────────────────────────────

    /// Merge snapshot entries into the store in one transaction.
    ///
    /// Matching names are updated in place (token, port, id and created_at
    /// preserved), new names are inserted with a fresh token, and nothing is
    /// ever deleted. Any error rolls the whole merge back.
    pub fn merge_snapshot(&self, entries: &[AppSnapshot]) -> PlatformResult<MergeOutcome> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let mut outcome = MergeOutcome::default();
        for entry in entries {
            let config = entry.config();
            if let Some(owner) = self.get_app_by_domain(&entry.domain)?
                && owner.name != entry.name
            {
                return Err(PlatformError::Validation(format!(
                    "Domain '{}' of '{}' already belongs to '{}'",
                    entry.domain, entry.name, owner.name
                )));
            }

            match self.get_app(&entry.name)? {
                Some(existing) if existing.config() == config => {
                    outcome.unchanged.push(entry.name.clone());
                }
                Some(existing) => {
                    if existing.repo_url != config.repo_url
                        || existing.language_version != config.language_version
                    {
                        outcome.requires_wipe.push(entry.name.clone());
                    }
                    update_app_fields(&tx, &entry.name, &config)?;
                    outcome.updated.push(entry.name.clone());
                }
                None => {
                    insert_app(&tx, &entry.name, &config)?;
                    outcome.created.push(entry.name.clone());
                }
            }
        }

        tx.commit().context("Failed to commit snapshot merge")?;
        Ok(outcome)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now()],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }
}

fn insert_app(conn: &Connection, name: &str, config: &AppConfig) -> Result<()> {
    let ts = now();
    conn.execute(
        "INSERT INTO apps (name, repo_url, domain, language_version, build_command, start_command, deploy_token, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            name,
            config.repo_url,
            config.domain,
            config.language_version,
            config.build_command,
            config.start_command,
            new_deploy_token(),
            ts,
        ],
    )
    .context("Failed to insert app")?;
    Ok(())
}

fn update_app_fields(conn: &Connection, name: &str, config: &AppConfig) -> Result<usize> {
    conn.execute(
        "UPDATE apps SET repo_url = ?1, domain = ?2, language_version = ?3, build_command = ?4,
             start_command = ?5, updated_at = ?6
         WHERE name = ?7",
        params![
            config.repo_url,
            config.domain,
            config.language_version,
            config.build_command,
            config.start_command,
            now(),
            name,
        ],
    )
    .context("Failed to update app")
}

// ── Tests ─────────────────────────────────────────────────────────────
