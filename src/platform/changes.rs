//! Destructive-change detection for app edits.
//!
//! Changing the source repository or the language runtime invalidates the
//! checkout and every cache built from it, so such edits wipe the app home
//! before the next build. Everything else applies in place.

use super::models::{App, AppConfig, EditPlan, EditRequest};
use super::router::normalize_domain;
use crate::errors::{PlatformError, PlatformResult};

/// Fields whose change forces a wipe.
pub const DESTRUCTIVE_FIELDS: [&str; 2] = ["repo_url", "language_version"];

pub fn classify_edit(prev: &AppConfig, next: &AppConfig) -> EditPlan {
    let fields: [(&str, &str, &str); 5] = [
        ("repo_url", prev.repo_url.as_str(), next.repo_url.as_str()),
        ("domain", prev.domain.as_str(), next.domain.as_str()),
        ("language_version", prev.language_version.as_str(), next.language_version.as_str()),
        ("build_command", prev.build_command.as_str(), next.build_command.as_str()),
        ("start_command", prev.start_command.as_str(), next.start_command.as_str()),
    ];

    let changed_fields: Vec<String> = fields
        .iter()
        .filter(|(_, a, b)| a != b)
        .map(|(field, _, _)| field.to_string())
        .collect();
    let reasons: Vec<String> = changed_fields
        .iter()
        .filter(|f| DESTRUCTIVE_FIELDS.contains(&f.as_str()))
        .cloned()
        .collect();

    EditPlan {
        requires_wipe: !reasons.is_empty(),
        reasons,
        changed_fields,
    }
}

/// Resolve an edit request against the stored record into the full new config.
pub fn merge_edit(current: &App, req: &EditRequest, base_domain: &str) -> PlatformResult<AppConfig> {
    if let Some(name) = &req.name
        && name != &current.name
    {
        return Err(PlatformError::Validation(format!(
            "App name is immutable (path '{}', body '{}')",
            current.name, name
        )));
    }

    let domain = match &req.domain {
        Some(domain) => normalize_domain(domain, base_domain, req.custom_domain)?,
        None => current.domain.clone(),
    };
    let pick = |new: &Option<String>, old: &str| {
        new.as_deref().map(str::trim).unwrap_or(old).to_string()
    };

    let config = AppConfig {
        repo_url: pick(&req.repo_url, &current.repo_url),
        domain,
        language_version: pick(&req.language_version, &current.language_version),
        build_command: pick(&req.build_command, &current.build_command),
        start_command: pick(&req.start_command, &current.start_command),
    };
    config.validate()?;
    Ok(config)
}
