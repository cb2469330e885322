//! Everything the orchestrator's collaborators share while it is active.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tsmux_service::{Connector, ServiceError, ServiceEvent, ServiceInstance, ServiceResolver};
use tsmux_types::{BindingId, DiagnosticClock};

use crate::config::{CheckConfig, LanguageConfig, StatusConfig, TsmuxConfig};
use crate::event::EngineEvent;

/// Text synchronisation sent to a service without waiting on the result.
#[derive(Debug)]
pub(crate) enum SyncOp {
    Open { path: PathBuf, text: Option<String> },
    Update { path: PathBuf, text: String },
    Close { path: PathBuf },
}

/// Created by [`crate::Orchestrator::activate`], dropped on deactivate.
pub struct EngineContext {
    resolver: Arc<ServiceResolver>,
    clock: DiagnosticClock,
    check: CheckConfig,
    status: StatusConfig,
    languages: LanguageConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineContext {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        config: &TsmuxConfig,
        clock: DiagnosticClock,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<EngineEvent>,
        mpsc::UnboundedReceiver<ServiceEvent>,
    ) {
        let (resolver, service_rx) = ServiceResolver::new(connector, &config.service, clock.clone());
        let (events, engine_rx) = mpsc::unbounded_channel();
        let ctx = Self {
            resolver: Arc::new(resolver),
            clock,
            check: config.check.clone(),
            status: config.status.clone(),
            languages: config.languages.clone(),
            events,
        };
        (ctx, engine_rx, service_rx)
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<ServiceResolver> {
        &self.resolver
    }

    #[must_use]
    pub fn clock(&self) -> &DiagnosticClock {
        &self.clock
    }

    #[must_use]
    pub fn check(&self) -> &CheckConfig {
        &self.check
    }

    #[must_use]
    pub fn status(&self) -> &StatusConfig {
        &self.status
    }

    #[must_use]
    pub fn languages(&self) -> &LanguageConfig {
        &self.languages
    }

    pub(crate) fn events(&self) -> &mpsc::UnboundedSender<EngineEvent> {
        &self.events
    }

    /// Resolve `path` in the background and report back as `Resolved`.
    pub(crate) fn spawn_resolve(&self, binding: BindingId, path: PathBuf) {
        let resolver = Arc::clone(&self.resolver);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = resolver.resolve(&path).await;
            let _ = events.send(EngineEvent::Resolved {
                binding,
                path,
                result,
            });
        });
    }

    /// Send one batched check. Results arrive as diagnostics pushes.
    pub(crate) fn spawn_check(&self, instance: Arc<ServiceInstance>, files: Vec<PathBuf>) {
        let delay = self.check.delay();
        tokio::spawn(async move {
            tracing::debug!(service = %instance.id(), files = files.len(), "Requesting project check");
            if let Err(e) = instance.get_err(&files, delay).await {
                tracing::warn!(service = %instance.id(), error = %e, "Project check failed");
            }
        });
    }

    pub(crate) fn spawn_sync(&self, instance: Arc<ServiceInstance>, op: SyncOp) {
        tokio::spawn(async move {
            let (path, result) = match &op {
                SyncOp::Open { path, text } => (path, instance.open_file(path, text.as_deref()).await),
                SyncOp::Update { path, text } => (path, instance.update_file(path, text).await),
                SyncOp::Close { path } => (path, instance.close_file(path).await),
            };
            if let Err(e) = result {
                log_sync_failure(&instance, path, &e);
            }
        });
    }
}

fn log_sync_failure(instance: &ServiceInstance, path: &Path, error: &ServiceError) {
    tracing::warn!(
        service = %instance.id(),
        path = %path.display(),
        error = %error,
        "Failed to sync document with service"
    );
}
