//! Orchestrator: the single owner of document bindings and diagnostics.
//!
//! The host drives it with lifecycle and document events. Everything slow
//! (resolution, requests, debounce timers) runs in spawned tasks that report
//! back through channels; the host drains those with [`Orchestrator::poll_events`]
//! or [`Orchestrator::process_next`]. All state changes happen inside
//! `&mut self` methods, so nothing here needs a lock.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tsmux_service::{
    Connector, PendingRequest, ServiceError, ServiceEvent, ServiceInstance, ServiceResolver,
    StopReason,
};
use tsmux_types::{
    BindingId, DiagnosticCategory, DiagnosticClock, DiagnosticsSnapshot, DocumentId,
    FileDiagnostics, ServiceId,
};

use crate::aggregator::DiagnosticAggregator;
use crate::binding::DocumentBinding;
use crate::coalescer::{self, RequestCoalescer};
use crate::config::TsmuxConfig;
use crate::context::{EngineContext, SyncOp};
use crate::event::EngineEvent;
use crate::host::{DiagnosticsRegistry, DiagnosticsSink, PersistedState, SinkDescriptor, StatusDisplay};

/// Name the diagnostics sink is registered under.
pub const SINK_NAME: &str = "tsmux";

/// A document the host just opened.
#[derive(Debug, Clone)]
pub struct OpenDocument {
    pub document: DocumentId,
    /// `None` for an unsaved buffer.
    pub path: Option<PathBuf>,
    pub language_id: Option<String>,
    pub text: Option<String>,
}

impl OpenDocument {
    #[must_use]
    pub fn new(document: DocumentId, path: impl Into<PathBuf>) -> Self {
        Self {
            document,
            path: Some(path.into()),
            language_id: None,
            text: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_language(mut self, language_id: impl Into<String>) -> Self {
        self.language_id = Some(language_id.into());
        self
    }
}

/// Channels and shared context that exist only while activated.
struct Running {
    ctx: EngineContext,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    service_rx: mpsc::UnboundedReceiver<ServiceEvent>,
}

enum Incoming {
    Service(ServiceEvent),
    Engine(EngineEvent),
}

pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    config: TsmuxConfig,
    clock: DiagnosticClock,
    running: Option<Running>,
    bindings: BTreeMap<BindingId, DocumentBinding>,
    documents: HashMap<DocumentId, BindingId>,
    /// The focused binding. Reported to the status display once bound.
    active: Option<BindingId>,
    next_binding: u64,
    aggregator: DiagnosticAggregator,
    coalescer: RequestCoalescer,
    sink: Option<Box<dyn DiagnosticsSink>>,
    status: Option<Box<dyn StatusDisplay>>,
    tile_placed: bool,
}

impl Orchestrator {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: TsmuxConfig) -> Self {
        let clock = DiagnosticClock::new();
        let coalescer = RequestCoalescer::new(config.check.debounce());
        Self {
            connector,
            config,
            aggregator: DiagnosticAggregator::new(clock.clone()),
            clock,
            running: None,
            bindings: BTreeMap::new(),
            documents: HashMap::new(),
            active: None,
            next_binding: 1,
            coalescer,
            sink: None,
            status: None,
            tile_placed: false,
        }
    }

    // ------------------------------------------------------------------
    // Host lifecycle
    // ------------------------------------------------------------------

    /// Start accepting document events.
    pub fn activate(&mut self, _prior: PersistedState) {
        if self.running.is_some() {
            tracing::debug!("Orchestrator already active");
            return;
        }
        let (ctx, engine_rx, service_rx) =
            EngineContext::new(Arc::clone(&self.connector), &self.config, self.clock.clone());
        self.running = Some(Running {
            ctx,
            engine_rx,
            service_rx,
        });
        tracing::info!("tsmux activated");
        self.place_status_tile();
    }

    /// Dispose every binding and shut down every service.
    ///
    /// Idempotent; a no-op before [`Self::activate`]. Work still in flight
    /// reports into dropped channels and is ignored.
    pub async fn deactivate(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.coalescer.cancel_all();

        let ids: Vec<BindingId> = self.bindings.keys().copied().collect();
        for id in ids {
            self.dispose(id, false);
        }
        self.active = None;
        if let Some(status) = self.status.as_mut() {
            status.clear_active();
            status.set_pending(&[]);
        }

        running.ctx.resolver().shutdown_all().await;
        tracing::info!("tsmux deactivated");
    }

    /// Nothing survives a restart.
    #[must_use]
    pub fn serialize(&self) -> PersistedState {
        PersistedState::default()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    /// Register with the host's diagnostics facility and replay what we have.
    pub fn consume_diagnostics_sink(&mut self, registry: &mut dyn DiagnosticsRegistry) {
        let mut sink = registry.register(&SinkDescriptor {
            name: SINK_NAME.to_string(),
        });
        for file in self.aggregator.snapshot().files() {
            for category in DiagnosticCategory::ALL {
                let items = file.category(category);
                if !items.is_empty() {
                    sink.set_errors(category, file.path(), items);
                }
            }
        }
        self.sink = Some(sink);
    }

    pub fn consume_status_display(&mut self, display: Box<dyn StatusDisplay>) {
        self.status = Some(display);
        self.tile_placed = false;
        self.place_status_tile();
        self.refresh_pending();
        self.refresh_active();
    }

    fn place_status_tile(&mut self) {
        if self.tile_placed || self.running.is_none() {
            return;
        }
        let Some(status) = self.status.as_mut() else {
            return;
        };
        let settings = &self.config.status;
        let priority = status
            .right_tiles()
            .iter()
            .find(|tile| tile.name == settings.reference_tile)
            .map_or(settings.default_priority, |tile| tile.priority - 1);
        status.add_right_tile(priority);
        self.tile_placed = true;
    }

    // ------------------------------------------------------------------
    // Host document events
    // ------------------------------------------------------------------

    /// Create a binding for a newly opened document.
    ///
    /// Every document gets a binding; ones that are not the target language
    /// or have no path simply never check. Returns `None` while inactive.
    pub fn document_opened(&mut self, doc: OpenDocument) -> Option<BindingId> {
        let running = self.running.as_ref()?;
        if let Some(existing) = self.documents.get(&doc.document) {
            tracing::debug!(document = %doc.document, "Document already bound");
            return Some(*existing);
        }

        let is_target = running
            .ctx
            .languages()
            .is_target(doc.path.as_deref(), doc.language_id.as_deref());
        let id = BindingId::new(self.next_binding);
        self.next_binding += 1;
        let binding = DocumentBinding::new(
            id,
            doc.document,
            doc.path,
            doc.language_id,
            doc.text,
            is_target,
        );
        tracing::debug!(
            binding = %id,
            document = %doc.document,
            path = ?binding.file_path(),
            target = is_target,
            "Document opened"
        );
        self.bindings.insert(id, binding);
        self.documents.insert(doc.document, id);
        self.start_resolve(id);
        Some(id)
    }

    /// Dispose the binding of a closed document.
    pub fn document_closed(&mut self, document: DocumentId) {
        if self.running.is_none() {
            return;
        }
        let Some(id) = self.documents.get(&document).copied() else {
            return;
        };
        self.dispose(id, true);
    }

    pub fn focus_gained(&mut self, document: DocumentId) {
        if self.running.is_none() {
            return;
        }
        let Some(id) = self.documents.get(&document).copied() else {
            return;
        };
        if self.active == Some(id) {
            return;
        }
        // The previous binding's deactivation completes before this one activates.
        self.deactivate_current();

        if let Some(binding) = self.bindings.get_mut(&id) {
            binding.activate(Instant::now());
            self.active = Some(id);
            tracing::debug!(binding = %id, "Binding focused");
        }
        self.refresh_active();
    }

    pub fn focus_lost(&mut self, document: DocumentId) {
        if self.running.is_none() {
            return;
        }
        if let Some(id) = self.documents.get(&document).copied()
            && self.active == Some(id)
        {
            self.deactivate_current();
        }
    }

    /// The document was written to `path`, possibly a new one.
    pub fn document_saved(&mut self, document: DocumentId, path: PathBuf) {
        let Some(running) = self.running.as_ref() else {
            return;
        };
        let Some(id) = self.documents.get(&document).copied() else {
            return;
        };
        let Some(binding) = self.bindings.get_mut(&id) else {
            return;
        };

        if binding.file_path() == Some(path.as_path()) {
            self.signal_check(id);
            return;
        }

        tracing::debug!(binding = %id, path = %path.display(), "Document saved under a new path");
        let old_path = binding.file_path().map(Path::to_path_buf);
        if let (Some(service), Some(old)) = (binding.service().cloned(), old_path.clone()) {
            running.ctx.spawn_sync(service, SyncOp::Close { path: old });
        }
        let is_target = running
            .ctx
            .languages()
            .is_target(Some(&path), binding.language_id());
        binding.retarget(path, is_target);

        if let Some(old) = old_path {
            self.clear_file(&old);
        }
        if self.active == Some(id) {
            self.refresh_active();
        }
        self.start_resolve(id);
    }

    /// The document's text changed.
    pub fn document_changed(&mut self, document: DocumentId, text: String) {
        let Some(running) = self.running.as_ref() else {
            return;
        };
        let Some(id) = self.documents.get(&document).copied() else {
            return;
        };
        let Some(binding) = self.bindings.get_mut(&id) else {
            return;
        };
        if let (Some(service), Some(path)) = (binding.service().cloned(), binding.file_path())
            && binding.is_target_language()
        {
            running.ctx.spawn_sync(
                service,
                SyncOp::Update {
                    path: path.to_path_buf(),
                    text: text.clone(),
                },
            );
        }
        binding.set_text(text);
        self.signal_check(id);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Drop every diagnostic, here and in the sink.
    pub fn clear_errors(&mut self) {
        self.aggregator.clear_all();
        if let Some(sink) = self.sink.as_mut() {
            sink.clear();
        }
    }

    /// The service for `path`: the instance of an open document with that
    /// path, else whatever the resolver gives.
    pub async fn service_for(&self, path: &Path) -> Result<Arc<ServiceInstance>, ServiceError> {
        let Some(running) = self.running.as_ref() else {
            return Err(ServiceError::Disconnected);
        };
        let open = self
            .bindings
            .values()
            .filter(|b| b.file_path() == Some(path))
            .find_map(|b| b.service().filter(|s| s.is_alive()).cloned());
        match open {
            Some(service) => Ok(service),
            None => running.ctx.resolver().resolve(path).await,
        }
    }

    /// Request a check of every open file sharing `binding`'s service.
    ///
    /// Unbound bindings are (re)resolved first; the check follows the bind.
    pub fn signal_check(&mut self, id: BindingId) {
        let Some(running) = self.running.as_ref() else {
            return;
        };
        let Some(binding) = self.bindings.get_mut(&id) else {
            return;
        };
        if binding.is_inert() {
            return;
        }
        if binding.service().is_some_and(|s| !s.is_alive()) {
            binding.unbind();
        }
        match binding.service_id() {
            Some(service) => self.coalescer.signal(service, running.ctx.events()),
            None => self.start_resolve(id),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    #[must_use]
    pub fn binding(&self, id: BindingId) -> Option<&DocumentBinding> {
        self.bindings.get(&id)
    }

    #[must_use]
    pub fn binding_for(&self, document: DocumentId) -> Option<&DocumentBinding> {
        self.documents
            .get(&document)
            .and_then(|id| self.bindings.get(id))
    }

    pub fn bindings(&self) -> impl Iterator<Item = &DocumentBinding> {
        self.bindings.values()
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn active_binding(&self) -> Option<BindingId> {
        self.active
    }

    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.aggregator.snapshot()
    }

    #[must_use]
    pub fn diagnostics_for(&self, path: &Path) -> Option<FileDiagnostics> {
        self.aggregator.get(path)
    }

    #[must_use]
    pub fn resolver(&self) -> Option<&Arc<ServiceResolver>> {
        self.running.as_ref().map(|r| r.ctx.resolver())
    }

    #[must_use]
    pub fn context(&self) -> Option<&EngineContext> {
        self.running.as_ref().map(|r| &r.ctx)
    }

    // ------------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------------

    /// Apply queued events, up to `budget`. Never blocks.
    pub fn poll_events(&mut self, budget: usize) -> usize {
        let mut count = 0;
        while count < budget {
            let Some(event) = self.try_next() else {
                break;
            };
            self.handle(event);
            count += 1;
        }
        count
    }

    fn try_next(&mut self) -> Option<Incoming> {
        let running = self.running.as_mut()?;
        if let Ok(event) = running.service_rx.try_recv() {
            return Some(Incoming::Service(event));
        }
        running.engine_rx.try_recv().ok().map(Incoming::Engine)
    }

    /// Wait for the next event and apply it.
    ///
    /// Returns `false` once inactive.
    pub async fn process_next(&mut self) -> bool {
        let event = {
            let Some(running) = self.running.as_mut() else {
                return false;
            };
            tokio::select! {
                biased;
                Some(event) = running.service_rx.recv() => Incoming::Service(event),
                Some(event) = running.engine_rx.recv() => Incoming::Engine(event),
                else => return false,
            }
        };
        self.handle(event);
        true
    }

    fn handle(&mut self, event: Incoming) {
        match event {
            Incoming::Service(event) => self.handle_service_event(event),
            Incoming::Engine(event) => self.handle_engine_event(event),
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Resolved {
                binding,
                path,
                result,
            } => self.finish_resolve(binding, &path, result),
            EngineEvent::CheckDue {
                service,
                generation,
            } => {
                if self.coalescer.take_due(service, generation) {
                    self.flush_check(service);
                }
            }
        }
    }

    fn handle_service_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::PendingRequestsChanged { service, .. } => {
                self.refresh_pending();
                if self.active_service() == Some(service) {
                    self.refresh_active();
                }
            }
            ServiceEvent::Diagnostics {
                service,
                key,
                category,
                path,
                items,
                stamp,
            } => {
                let current = self
                    .resolver()
                    .and_then(|r| r.get(&key))
                    .map(|instance| instance.id());
                if current != Some(service) {
                    tracing::debug!(service = %service, path = %path.display(), "Dropping diagnostics from replaced service");
                    return;
                }
                // A check issued before a close can still report afterwards.
                if !self.bindings.values().any(|b| b.file_path() == Some(path.as_path())) {
                    tracing::debug!(service = %service, path = %path.display(), "Dropping diagnostics for closed file");
                    return;
                }
                tracing::debug!(
                    service = %service,
                    path = %path.display(),
                    category = category.as_str(),
                    count = items.len(),
                    "Diagnostics updated"
                );
                let applied =
                    self.aggregator
                        .set_diagnostics(stamp, category, path.clone(), items.clone());
                if applied && let Some(sink) = self.sink.as_mut() {
                    sink.set_errors(category, &path, &items);
                }
            }
            ServiceEvent::Stopped {
                service,
                key,
                reason,
            } => self.service_stopped(service, &key.to_string(), &reason),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn start_resolve(&mut self, id: BindingId) {
        let Some(running) = self.running.as_ref() else {
            return;
        };
        let Some(path) = self.bindings.get_mut(&id).and_then(DocumentBinding::begin_resolve) else {
            return;
        };
        tracing::debug!(binding = %id, path = %path.display(), "Resolving service");
        running.ctx.spawn_resolve(id, path);
    }

    fn finish_resolve(
        &mut self,
        id: BindingId,
        path: &Path,
        result: Result<Arc<ServiceInstance>, ServiceError>,
    ) {
        let Some(running) = self.running.as_ref() else {
            return;
        };
        let Some(binding) = self.bindings.get_mut(&id) else {
            tracing::debug!(binding = %id, "Resolution finished for closed document");
            return;
        };
        if !binding.finish_resolve(path) {
            tracing::debug!(binding = %id, path = %path.display(), "Ignoring stale resolution");
            return;
        }

        match result {
            Ok(instance) if instance.is_alive() => {
                tracing::debug!(binding = %id, service = %instance.id(), "Binding bound");
                running.ctx.spawn_sync(
                    Arc::clone(&instance),
                    SyncOp::Open {
                        path: path.to_path_buf(),
                        text: binding.text().map(str::to_string),
                    },
                );
                binding.bind(instance);
                if self.active == Some(id) {
                    self.refresh_active();
                }
                self.signal_check(id);
            }
            Ok(instance) => {
                tracing::debug!(binding = %id, service = %instance.id(), "Resolved service already stopped");
            }
            Err(ServiceError::ProjectNotFound { path: missing }) => {
                tracing::debug!(binding = %id, path = %missing.display(), "No project; document will not be checked");
                binding.mark_no_project();
            }
            Err(err @ ServiceError::ServiceStartFailed { .. }) => {
                tracing::warn!(binding = %id, error = %err, "Could not start compiler service");
                if let Some(status) = self.status.as_mut() {
                    status.show_error(&err.to_string());
                }
            }
            Err(err) => {
                tracing::warn!(binding = %id, error = %err, "Service resolution failed");
            }
        }
    }

    fn flush_check(&mut self, service: ServiceId) {
        let Some(running) = self.running.as_ref() else {
            return;
        };
        let Some(instance) = self
            .bindings
            .values()
            .filter_map(DocumentBinding::service)
            .find(|s| s.id() == service && s.is_alive())
            .cloned()
        else {
            return;
        };
        let files = coalescer::batch_files(self.bindings.values(), service);
        if files.is_empty() {
            return;
        }
        running.ctx.spawn_check(instance, files);
    }

    fn service_stopped(&mut self, service: ServiceId, key: &str, reason: &StopReason) {
        match reason {
            StopReason::Exited => tracing::info!(service = %service, key, "Compiler service exited"),
            StopReason::Failed(msg) => {
                tracing::warn!(service = %service, key, error = %msg, "Compiler service failed");
            }
        }
        if let Some(resolver) = self.resolver() {
            resolver.evict(service);
        }
        self.coalescer.cancel(service);

        let mut active_affected = false;
        for binding in self.bindings.values_mut() {
            if binding.service_id() == Some(service) {
                binding.unbind();
                active_affected |= self.active == Some(binding.id());
            }
        }
        self.refresh_pending();
        if active_affected {
            self.refresh_active();
        }
    }

    /// Remove a binding and everything derived from it.
    ///
    /// With `notify_service` the service is told the file closed.
    fn dispose(&mut self, id: BindingId, notify_service: bool) {
        let Some(mut binding) = self.bindings.remove(&id) else {
            return;
        };
        self.documents.remove(&binding.document());
        if self.active == Some(id) {
            self.active = None;
            if let Some(status) = self.status.as_mut() {
                status.clear_active();
            }
        }

        let service = binding.unbind();
        if let Some(path) = binding.file_path().map(Path::to_path_buf) {
            let still_open = self.bindings.values().any(|b| b.file_path() == Some(&path));
            if notify_service
                && !still_open
                && let (Some(service), Some(running)) = (service, self.running.as_ref())
            {
                running.ctx.spawn_sync(service, SyncOp::Close { path: path.clone() });
            }
            if !still_open {
                self.clear_file(&path);
            }
        }
        tracing::debug!(binding = %id, "Binding disposed");
    }

    fn clear_file(&mut self, path: &Path) {
        self.aggregator.clear_file(path);
        if let Some(sink) = self.sink.as_mut() {
            for category in DiagnosticCategory::ALL {
                sink.set_errors(category, path, &[]);
            }
        }
    }

    fn deactivate_current(&mut self) {
        let Some(id) = self.active.take() else {
            return;
        };
        if let Some(binding) = self.bindings.get_mut(&id) {
            binding.deactivate();
            tracing::debug!(binding = %id, "Binding unfocused");
        }
        if let Some(status) = self.status.as_mut() {
            status.clear_active();
        }
    }

    fn active_service(&self) -> Option<ServiceId> {
        self.active
            .and_then(|id| self.bindings.get(&id))
            .and_then(DocumentBinding::service_id)
    }

    /// Push the focused binding's state to the status display, if it is bound.
    fn refresh_active(&mut self) {
        let Some(status) = self.status.as_mut() else {
            return;
        };
        let Some(binding) = self.active.and_then(|id| self.bindings.get(&id)) else {
            return;
        };
        if binding.service().is_some() {
            status.set_active(&binding.active_status());
        } else {
            status.clear_active();
        }
    }

    fn refresh_pending(&mut self) {
        let Some(status) = self.status.as_mut() else {
            return;
        };
        let mut pending: Vec<PendingRequest> = self
            .running
            .as_ref()
            .map(|r| r.ctx.resolver().list_instances())
            .unwrap_or_default()
            .iter()
            .flat_map(|instance| instance.pending())
            .collect();
        pending.sort_by_key(PendingRequest::started_at);
        status.set_pending(&pending);
    }
}
