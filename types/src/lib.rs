//! Core domain types for tsmux.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the multiplexer.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod clock;
mod diagnostic;
mod env;
mod ids;
mod project;

pub use clock::{DiagnosticClock, Stamp};
pub use diagnostic::{
    Diagnostic, DiagnosticCategory, DiagnosticSeverity, DiagnosticsSnapshot, FileDiagnostics,
    Position,
};
pub use env::ENV_SECRET_DENYLIST;
pub use ids::{BindingId, DocumentId, ServiceId};
pub use project::{InvalidProjectKey, ProjectKey};
