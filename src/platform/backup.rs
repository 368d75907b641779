//! Snapshot export and validation.
//!
//! A snapshot is the secret-free configuration of every app. Import is a
//! merge (see `AppDb::merge_snapshot`): it never deletes records and never
//! touches deploy tokens or ports.

use std::collections::HashSet;

use serde_json::Value;

use super::models::*;
use crate::errors::{PlatformError, PlatformResult};

const SNAPSHOT_FIELDS: [&str; 6] = [
    "name",
    "repo_url",
    "domain",
    "build_command",
    "start_command",
    "language_version",
];

pub fn build_snapshot(apps: &[App], base_domain: &str) -> Snapshot {
    let mut entries: Vec<AppSnapshot> = apps.iter().map(AppSnapshot::from).collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Snapshot {
        version: SNAPSHOT_VERSION,
        exported_at: chrono::Utc::now().to_rfc3339(),
        base_domain: Some(base_domain.to_string()),
        apps: entries,
    }
}

fn invalid(msg: impl Into<String>) -> PlatformError {
    PlatformError::Validation(msg.into())
}

/// Check the shape of a snapshot document before anything is mutated.
pub fn validate_snapshot(value: &Value) -> PlatformResult<Snapshot> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid("Snapshot must be a JSON object"))?;

    match obj.get("version").and_then(Value::as_u64) {
        Some(v) if v == u64::from(SNAPSHOT_VERSION) => {}
        Some(v) => return Err(invalid(format!("Unsupported snapshot version {}", v))),
        None => return Err(invalid("Snapshot is missing a numeric 'version'")),
    }

    let apps = obj
        .get("apps")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("Snapshot is missing an 'apps' array"))?;

    let mut names = HashSet::new();
    let mut domains = HashSet::new();
    let mut entries = Vec::with_capacity(apps.len());

    for (index, app) in apps.iter().enumerate() {
        let fields = app
            .as_object()
            .ok_or_else(|| invalid(format!("apps[{}] must be an object", index)))?;
        let mut values = Vec::with_capacity(SNAPSHOT_FIELDS.len());
        for field in SNAPSHOT_FIELDS {
            let value = fields
                .get(field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    invalid(format!("apps[{}].{} must be a non-empty string", index, field))
                })?;
            values.push(value.to_string());
        }
        let [name, repo_url, domain, build_command, start_command, language_version]: [String; 6] =
            values
                .try_into()
                .map_err(|_| invalid(format!("apps[{}] is incomplete", index)))?;

        validate_name(&name)?;
        let entry = AppSnapshot {
            name,
            repo_url,
            domain: domain.to_lowercase(),
            build_command,
            start_command,
            language_version,
        };
        entry.config().validate()?;

        if !names.insert(entry.name.clone()) {
            return Err(invalid(format!("Duplicate app name '{}' in snapshot", entry.name)));
        }
        if !domains.insert(entry.domain.clone()) {
            return Err(invalid(format!("Duplicate domain '{}' in snapshot", entry.domain)));
        }
        entries.push(entry);
    }

    Ok(Snapshot {
        version: SNAPSHOT_VERSION,
        exported_at: obj
            .get("exported_at")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        base_domain: obj
            .get("base_domain")
            .and_then(Value::as_str)
            .map(str::to_string),
        apps: entries,
    })
}

/// Parse and validate snapshot text.
pub fn parse_snapshot(text: &str) -> PlatformResult<Snapshot> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| invalid(format!("Snapshot is not valid JSON: {}", e)))?;
    validate_snapshot(&value)
}

pub fn import_message(report: &ImportReport) -> String {
    let mut msg = format!(
        "Merged {} app(s): {} created, {} updated, {} unchanged. Existing apps not in the file were kept; deploy tokens were not changed.",
        report.created.len() + report.updated.len() + report.unchanged.len(),
        report.created.len(),
        report.updated.len(),
        report.unchanged.len(),
    );
    if !report.redeploy_scheduled.is_empty() {
        msg.push_str(&format!(
            " Redeploy scheduled for {}.",
            report.redeploy_scheduled.join(", ")
        ));
    }
    let skipped: Vec<&str> = report
        .requires_wipe
        .iter()
        .filter(|n| !report.redeploy_scheduled.contains(*n))
        .map(String::as_str)
        .collect();
    if !skipped.is_empty() {
        msg.push_str(&format!(
            " {} changed source or runtime and need a confirmed wipe before redeploy.",
            skipped.join(", ")
        ));
    }
    msg
}
