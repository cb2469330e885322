use std::path::PathBuf;
use std::sync::Arc;

use tsmux_service::{ServiceError, ServiceInstance};
use tsmux_types::{BindingId, ServiceId};

/// Completion of work the orchestrator spawned.
///
/// Spawned tasks never touch orchestrator state; they post one of these and
/// the orchestrator applies it if the addressee still exists.
#[derive(Debug)]
pub enum EngineEvent {
    /// Resolution of `path` for `binding` finished.
    Resolved {
        binding: BindingId,
        path: PathBuf,
        result: Result<Arc<ServiceInstance>, ServiceError>,
    },
    /// The debounce window of `service` elapsed.
    CheckDue { service: ServiceId, generation: u64 },
}
