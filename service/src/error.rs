use std::path::PathBuf;

use tsmux_types::ProjectKey;

/// Errors surfaced by service resolution and service requests.
///
/// `Clone` so one start attempt's outcome can be handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("no project config found for {}", path.display())]
    ProjectNotFound { path: PathBuf },
    #[error("failed to start service for {key}: {message}")]
    ServiceStartFailed { key: ProjectKey, message: String },
    #[error("request '{command}' failed: {message}")]
    RequestFailed { command: String, message: String },
    #[error("request '{command}' timed out")]
    Timeout { command: String },
    #[error("service connection closed")]
    Disconnected,
}

impl ServiceError {
    /// Whether this error means "no backend for this file" rather than a fault.
    #[must_use]
    pub fn is_project_not_found(&self) -> bool {
        matches!(self, Self::ProjectNotFound { .. })
    }
}
