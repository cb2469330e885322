//! Interfaces the host editor provides to the orchestrator.
//!
//! tsmux renders nothing itself. Diagnostics go to a [`DiagnosticsSink`]
//! obtained from the host's [`DiagnosticsRegistry`]; request and service
//! state go to a [`StatusDisplay`]. Both are optional.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tsmux_service::PendingRequest;
use tsmux_types::{BindingId, Diagnostic, DiagnosticCategory, ProjectKey, ServiceId};

/// Registration details for a diagnostics sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDescriptor {
    pub name: String,
}

/// Host facility that hands out diagnostics sinks.
pub trait DiagnosticsRegistry {
    fn register(&mut self, descriptor: &SinkDescriptor) -> Box<dyn DiagnosticsSink>;
}

/// Where rendering-ready diagnostics are delivered.
pub trait DiagnosticsSink: Send {
    /// Replace the diagnostics of one (file, category) pair. Empty clears it.
    fn set_errors(&mut self, category: DiagnosticCategory, path: &Path, items: &[Diagnostic]);

    /// Drop everything previously delivered.
    fn clear(&mut self);
}

/// An existing tile in the host's status area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTile {
    pub name: String,
    pub priority: i32,
}

/// What the status display shows for the focused document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveStatus {
    pub binding: BindingId,
    pub path: Option<PathBuf>,
    pub service: Option<ServiceId>,
    #[serde(skip)]
    pub project: Option<ProjectKey>,
    pub pending: Vec<PendingRequest>,
}

/// Host status area.
pub trait StatusDisplay: Send {
    fn right_tiles(&self) -> Vec<StatusTile>;

    fn add_right_tile(&mut self, priority: i32);

    /// Every outstanding request across all services.
    fn set_pending(&mut self, pending: &[PendingRequest]);

    fn set_active(&mut self, status: &ActiveStatus);

    fn clear_active(&mut self);

    fn show_error(&mut self, message: &str);
}

/// State handed back by the host across restarts. Nothing is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {}
