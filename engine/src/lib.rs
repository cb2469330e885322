//! Document-binding layer for tsmux.
//!
//! The [`Orchestrator`] turns host editor events into work against the
//! compiler services owned by a [`tsmux_service::ServiceResolver`]: every
//! open document gets a [`DocumentBinding`], saves and edits raise check
//! signals that a [`RequestCoalescer`] batches per service, and diagnostics
//! pushed back by the services land in a [`DiagnosticAggregator`] before
//! being forwarded to the host's sink.

pub mod aggregator;
pub mod binding;
pub mod coalescer;
pub mod config;
pub mod host;
pub mod providers;

mod context;
mod event;
mod orchestrator;

pub use aggregator::DiagnosticAggregator;
pub use binding::{BindingState, DocumentBinding};
pub use coalescer::RequestCoalescer;
pub use config::{CheckConfig, ConfigError, LanguageConfig, StatusConfig, TsmuxConfig};
pub use context::EngineContext;
pub use event::EngineEvent;
pub use host::{
    ActiveStatus, DiagnosticsRegistry, DiagnosticsSink, PersistedState, SinkDescriptor,
    StatusDisplay, StatusTile,
};
pub use orchestrator::{OpenDocument, Orchestrator, SINK_NAME};
pub use providers::{
    AutocompleteProvider, NavigationProvider, ProjectConfig, load_project_config,
};
