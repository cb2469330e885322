//! The opaque RPC seam between tsmux and a compiler service.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tsmux_types::{Diagnostic, DiagnosticCategory, DiagnosticClock, ProjectKey, ServiceId, Stamp};

use crate::error::ServiceError;
use crate::instance::PendingRequest;

/// Service request future type alias.
pub type RpcFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ServiceError>> + Send + 'a>>;

/// One established request/response channel to a compiler service.
pub trait Connection: Send + Sync {
    /// Send `command` with `args` and resolve with the response body.
    fn request<'a>(&'a self, command: &'a str, args: Value) -> RpcFut<'a, Value>;

    /// Send `command` with `args` without expecting a response. Resolves once
    /// the message is handed to the backend.
    fn notify<'a>(&'a self, command: &'a str, args: Value) -> RpcFut<'a, ()>;

    /// Close the channel and release the backend. Must be idempotent.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Establishes [`Connection`]s for projects.
pub trait Connector: Send + Sync {
    /// Start a backend for `key`. Unsolicited pushes from it go to `push`.
    fn connect<'a>(&'a self, key: &'a ProjectKey, push: PushSink) -> RpcFut<'a, Arc<dyn Connection>>;
}

/// Why a service connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The backend closed its output cleanly.
    Exited,
    /// The backend broke the protocol or the channel failed.
    Failed(String),
}

/// Everything a [`crate::ServiceResolver`] reports about its instances.
///
/// Events of one instance arrive in the order the instance emitted them.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// The set of outstanding requests of an instance changed.
    PendingRequestsChanged {
        service: ServiceId,
        key: ProjectKey,
        pending: Vec<PendingRequest>,
    },
    /// The service pushed diagnostics for one (file, category) pair.
    Diagnostics {
        service: ServiceId,
        key: ProjectKey,
        category: DiagnosticCategory,
        path: PathBuf,
        items: Vec<Diagnostic>,
        stamp: Stamp,
    },
    /// The connection died; the instance is no longer usable.
    Stopped {
        service: ServiceId,
        key: ProjectKey,
        reason: StopReason,
    },
}

/// Handed to a [`Connector`] so the backend can push unsolicited events.
///
/// Pushes are attributed to the instance they were created for and stamped
/// on the shared diagnostic clock at the moment of the push.
#[derive(Clone)]
pub struct PushSink {
    service: ServiceId,
    key: ProjectKey,
    clock: DiagnosticClock,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ServiceEvent>,
}

impl PushSink {
    pub(crate) fn new(
        service: ServiceId,
        key: ProjectKey,
        clock: DiagnosticClock,
        alive: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<ServiceEvent>,
    ) -> Self {
        Self {
            service,
            key,
            clock,
            alive,
            events,
        }
    }

    #[must_use]
    pub fn service(&self) -> ServiceId {
        self.service
    }

    #[must_use]
    pub fn key(&self) -> &ProjectKey {
        &self.key
    }

    /// Replace the diagnostics of `category` for `path`.
    pub fn diagnostics(&self, category: DiagnosticCategory, path: PathBuf, items: Vec<Diagnostic>) {
        if !self.alive.load(Ordering::Acquire) {
            tracing::trace!(service = %self.service, "Dropping diagnostics from stopped service");
            return;
        }
        let stamp = self.clock.tick();
        let _ = self.events.send(ServiceEvent::Diagnostics {
            service: self.service,
            key: self.key.clone(),
            category,
            path,
            items,
            stamp,
        });
    }

    /// Report that the connection is gone. Only the first report is delivered.
    pub fn closed(&self, reason: StopReason) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.events.send(ServiceEvent::Stopped {
            service: self.service,
            key: self.key.clone(),
            reason,
        });
    }
}

impl fmt::Debug for PushSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSink")
            .field("service", &self.service)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
