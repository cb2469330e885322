//! One open host document and the service instance it is bound to.
//!
//! ```text
//! Unbound ──bind──▶ Bound ──focus──▶ Active ◀──▶ Inactive
//!    ▲                 │                 │
//!    └──service died───┴─────────────────┘        close ─▶ removed
//! ```
//!
//! A disposed binding is simply gone from the orchestrator's collection;
//! there is no stored "disposed" value to check.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::Instant;
use tsmux_service::ServiceInstance;
use tsmux_types::{BindingId, DocumentId, ServiceId};

use crate::host::ActiveStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// No live service yet: resolving, no project, not the target language,
    /// or the service died.
    Unbound,
    /// Bound and never focused.
    Bound,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Never,
    Focused,
    Blurred,
}

#[derive(Debug)]
pub struct DocumentBinding {
    id: BindingId,
    document: DocumentId,
    file_path: Option<PathBuf>,
    language_id: Option<String>,
    is_target_language: bool,
    /// Last text the host gave us; sent with `open` on bind.
    text: Option<String>,
    service: Option<Arc<ServiceInstance>>,
    /// Path of the resolution in flight, if any.
    resolving: Option<PathBuf>,
    /// The current path has no enclosing project.
    no_project: bool,
    focus: Focus,
    active_at: Instant,
}

impl DocumentBinding {
    #[must_use]
    pub fn new(
        id: BindingId,
        document: DocumentId,
        file_path: Option<PathBuf>,
        language_id: Option<String>,
        text: Option<String>,
        is_target_language: bool,
    ) -> Self {
        Self {
            id,
            document,
            file_path,
            language_id,
            is_target_language,
            text,
            service: None,
            resolving: None,
            no_project: false,
            focus: Focus::Never,
            active_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> BindingId {
        self.id
    }

    #[must_use]
    pub fn document(&self) -> DocumentId {
        self.document
    }

    #[must_use]
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    #[must_use]
    pub fn language_id(&self) -> Option<&str> {
        self.language_id.as_deref()
    }

    #[must_use]
    pub fn is_target_language(&self) -> bool {
        self.is_target_language
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    #[must_use]
    pub fn service(&self) -> Option<&Arc<ServiceInstance>> {
        self.service.as_ref()
    }

    #[must_use]
    pub fn service_id(&self) -> Option<ServiceId> {
        self.service.as_ref().map(|s| s.id())
    }

    #[must_use]
    pub fn active_at(&self) -> Instant {
        self.active_at
    }

    #[must_use]
    pub fn is_resolving(&self) -> bool {
        self.resolving.is_some()
    }

    #[must_use]
    pub fn has_no_project(&self) -> bool {
        self.no_project
    }

    #[must_use]
    pub fn state(&self) -> BindingState {
        if self.service.is_none() {
            return BindingState::Unbound;
        }
        match self.focus {
            Focus::Never => BindingState::Bound,
            Focus::Focused => BindingState::Active,
            Focus::Blurred => BindingState::Inactive,
        }
    }

    /// Whether this binding takes part in project checks.
    #[must_use]
    pub fn is_checkable(&self) -> bool {
        self.is_target_language && self.file_path.is_some() && self.service.is_some()
    }

    /// Inert bindings never resolve and never issue checks.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        !self.is_target_language || self.file_path.is_none() || self.no_project
    }

    /// Start a resolution if one is due; returns the path to resolve.
    pub(crate) fn begin_resolve(&mut self) -> Option<PathBuf> {
        if self.is_inert() || self.service.is_some() || self.resolving.is_some() {
            return None;
        }
        self.resolving = self.file_path.clone();
        self.resolving.clone()
    }

    /// Accept a resolution result for `path`; `false` if it is stale.
    pub(crate) fn finish_resolve(&mut self, path: &Path) -> bool {
        if self.resolving.as_deref() != Some(path) {
            return false;
        }
        self.resolving = None;
        true
    }

    pub(crate) fn bind(&mut self, service: Arc<ServiceInstance>) {
        self.service = Some(service);
    }

    /// Forget the service. Returns it if one was bound.
    pub(crate) fn unbind(&mut self) -> Option<Arc<ServiceInstance>> {
        self.service.take()
    }

    pub(crate) fn mark_no_project(&mut self) {
        self.no_project = true;
    }

    /// The document was saved under a new path.
    pub(crate) fn retarget(&mut self, path: PathBuf, is_target_language: bool) {
        self.file_path = Some(path);
        self.is_target_language = is_target_language;
        self.service = None;
        self.resolving = None;
        self.no_project = false;
    }

    pub(crate) fn set_text(&mut self, text: String) {
        self.text = Some(text);
    }

    pub(crate) fn activate(&mut self, now: Instant) {
        self.focus = Focus::Focused;
        self.active_at = now;
    }

    pub(crate) fn deactivate(&mut self) {
        if self.focus == Focus::Focused {
            self.focus = Focus::Blurred;
        }
    }

    #[must_use]
    pub fn active_status(&self) -> ActiveStatus {
        ActiveStatus {
            binding: self.id,
            path: self.file_path.clone(),
            service: self.service_id(),
            project: self.service.as_ref().map(|s| s.key().clone()),
            pending: self
                .service
                .as_ref()
                .map(|s| s.pending())
                .unwrap_or_default(),
        }
    }
}
