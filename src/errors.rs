//! Typed error hierarchy for the platform control plane.
//!
//! `PlatformError` is the single taxonomy every component reports through.
//! Store and pipeline internals use `anyhow` with context and convert into
//! `PlatformError::Store` at the component boundary.

use thiserror::Error;

/// Errors surfaced by the control plane and mapped onto the HTTP boundary.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Bad input, malformed snapshot or an invariant the request would break.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Name or domain already owned by another record.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A destructive edit was submitted without the wipe acknowledgement.
    #[error("Changing {} of '{name}' wipes its working directory; resubmit with confirm_wipe", reasons.join(" and "))]
    ConfirmationRequired { name: String, reasons: Vec<String> },

    #[error("Build failed for '{name}': {message}")]
    BuildFailed { name: String, message: String },

    #[error("Process error for '{name}': {message}")]
    Process { name: String, message: String },

    /// Webhook token mismatch. Deliberately carries no detail.
    #[error("Invalid deploy token")]
    Unauthorized,

    #[error("App '{name}' not found")]
    NotFound { name: String },

    #[error("No free ports left in the configured range")]
    PortsExhausted,

    #[error("Platform is not accepting changes: {0}")]
    Halted(String),

    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl PlatformError {
    pub fn not_found(name: &str) -> Self {
        Self::NotFound {
            name: name.to_string(),
        }
    }

    pub fn process(name: &str, message: impl Into<String>) -> Self {
        Self::Process {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn build(name: &str, message: impl Into<String>) -> Self {
        Self::BuildFailed {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Platform-fatal errors halt new deploys (store corruption, resource exhaustion).
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::PortsExhausted | Self::Store(_) => true,
            Self::BuildFailed { message, .. } => message.contains("No space left on device"),
            _ => false,
        }
    }
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;
