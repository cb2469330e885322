//! A live compiler-service connection bound to one project.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tsmux_types::{Position, ProjectKey, ServiceId};

use crate::connection::{Connection, ServiceEvent};
use crate::error::ServiceError;
use crate::protocol::{self, CompletionEntry, Location, ProjectInfo, commands};

/// One request that has been issued and not yet answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRequest {
    seq: u64,
    command: String,
    #[serde(skip)]
    started_at: Instant,
}

impl PendingRequest {
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// Outstanding requests of one instance, used for the "working" indicator.
///
/// Membership is exactly the set of issued-but-unsettled requests.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    next_seq: u64,
    requests: BTreeMap<u64, PendingRequest>,
}

impl PendingRegistry {
    /// Record a newly issued request and return its registry sequence number.
    pub fn begin(&mut self, command: &str) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.requests.insert(
            seq,
            PendingRequest {
                seq,
                command: command.to_string(),
                started_at: Instant::now(),
            },
        );
        seq
    }

    /// Settle a request. Returns false if it was not outstanding.
    pub fn finish(&mut self, seq: u64) -> bool {
        self.requests.remove(&seq).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Outstanding requests in issue order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingRequest> {
        self.requests.values().cloned().collect()
    }
}

/// Settles its request when dropped, whether the request completed, failed,
/// timed out, or the awaiting future was abandoned.
struct InFlight<'a> {
    instance: &'a ServiceInstance,
    seq: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.instance.settle(self.seq);
    }
}

/// One backend connection scoped to a project root.
///
/// Owned by the [`crate::ServiceResolver`]; everyone else holds `Arc` handles
/// and must check [`ServiceInstance::is_alive`] instead of assuming.
pub struct ServiceInstance {
    id: ServiceId,
    key: ProjectKey,
    connection: Arc<dyn Connection>,
    pending: Mutex<PendingRegistry>,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ServiceEvent>,
    request_timeout: Duration,
}

impl ServiceInstance {
    pub(crate) fn new(
        id: ServiceId,
        key: ProjectKey,
        connection: Arc<dyn Connection>,
        alive: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<ServiceEvent>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            key,
            connection,
            pending: Mutex::new(PendingRegistry::default()),
            alive,
            events,
            request_timeout,
        }
    }

    #[must_use]
    pub fn id(&self) -> ServiceId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &ProjectKey {
        &self.key
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Requests issued but not yet settled, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    fn track(&self, command: &str) -> InFlight<'_> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = pending.begin(command);
        // Emit under the lock so snapshots reach subscribers in mutation order.
        self.announce_pending(&pending);
        InFlight {
            instance: self,
            seq,
        }
    }

    fn settle(&self, seq: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.finish(seq) {
            self.announce_pending(&pending);
        }
    }

    fn announce_pending(&self, pending: &PendingRegistry) {
        let _ = self.events.send(ServiceEvent::PendingRequestsChanged {
            service: self.id,
            key: self.key.clone(),
            pending: pending.snapshot(),
        });
    }

    /// Send a raw request and wait for its response body.
    pub async fn send_request(&self, command: &str, args: Value) -> Result<Value, ServiceError> {
        if !self.is_alive() {
            return Err(ServiceError::Disconnected);
        }
        let _in_flight = self.track(command);
        tracing::trace!(service = %self.id, command, "Sending service request");
        match tokio::time::timeout(self.request_timeout, self.connection.request(command, args))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                command: command.to_string(),
            }),
        }
    }

    /// Send a command the service never answers. It is not tracked as
    /// pending, since nothing would ever settle it.
    pub async fn send_notification(&self, command: &str, args: Value) -> Result<(), ServiceError> {
        if !self.is_alive() {
            return Err(ServiceError::Disconnected);
        }
        tracing::trace!(service = %self.id, command, "Sending service notification");
        match tokio::time::timeout(self.request_timeout, self.connection.notify(command, args))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                command: command.to_string(),
            }),
        }
    }

    /// Tell the service a file is open, optionally with unsaved contents.
    pub async fn open_file(&self, path: &Path, content: Option<&str>) -> Result<(), ServiceError> {
        self.send_notification(commands::OPEN, protocol::open_args(path, content))
            .await
    }

    /// Replace the service's view of an open file's text.
    pub async fn update_file(&self, path: &Path, content: &str) -> Result<(), ServiceError> {
        self.send_request(commands::UPDATE_OPEN, protocol::update_open_args(path, content))
            .await
            .map(drop)
    }

    pub async fn close_file(&self, path: &Path) -> Result<(), ServiceError> {
        self.send_notification(commands::CLOSE, protocol::close_args(path))
            .await
    }

    /// Ask for diagnostics of `files`, checked in order with `delay` between
    /// them. Results arrive as diagnostics pushes, not in the response.
    pub async fn get_err(&self, files: &[PathBuf], delay: Duration) -> Result<(), ServiceError> {
        self.send_request(commands::GETERR, protocol::geterr_args(files, delay))
            .await
            .map(drop)
    }

    pub async fn project_info(&self, path: &Path) -> Result<ProjectInfo, ServiceError> {
        let body = self
            .send_request(commands::PROJECT_INFO, protocol::project_info_args(path))
            .await?;
        serde_json::from_value(body).map_err(|e| malformed(commands::PROJECT_INFO, &e))
    }

    pub async fn completions(
        &self,
        path: &Path,
        position: Position,
        prefix: &str,
    ) -> Result<Vec<CompletionEntry>, ServiceError> {
        let body = self
            .send_request(
                commands::COMPLETIONS,
                protocol::location_args(path, position, Some(prefix)),
            )
            .await?;
        protocol::parse_completions(body).map_err(|e| malformed(commands::COMPLETIONS, &e))
    }

    pub async fn definition(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Vec<Location>, ServiceError> {
        let body = self
            .send_request(
                commands::DEFINITION,
                protocol::location_args(path, position, None),
            )
            .await?;
        protocol::parse_locations(body).map_err(|e| malformed(commands::DEFINITION, &e))
    }

    /// Mark the instance dead and release its connection.
    pub(crate) async fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        self.connection.shutdown().await;
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

fn malformed(command: &str, err: &serde_json::Error) -> ServiceError {
    ServiceError::RequestFailed {
        command: command.to_string(),
        message: format!("malformed response body: {err}"),
    }
}
