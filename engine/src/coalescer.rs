//! Trailing-edge debounce of project checks, one window per service instance.
//!
//! Each signal restarts the window of its service. When a window elapses a
//! timer task posts [`EngineEvent::CheckDue`] stamped with the generation it
//! was started for; only the newest generation is honoured. The file list is
//! computed when the window closes, not when it opens.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tsmux_types::ServiceId;

use crate::binding::DocumentBinding;
use crate::event::EngineEvent;

struct Window {
    generation: u64,
    timer: JoinHandle<()>,
}

pub struct RequestCoalescer {
    window: Duration,
    next_generation: u64,
    windows: HashMap<ServiceId, Window>,
}

impl RequestCoalescer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            next_generation: 1,
            windows: HashMap::new(),
        }
    }

    /// Open or restart the window of `service`.
    pub fn signal(&mut self, service: ServiceId, events: &mpsc::UnboundedSender<EngineEvent>) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let window = self.window;
        let events = events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = events.send(EngineEvent::CheckDue {
                service,
                generation,
            });
        });

        if let Some(previous) = self.windows.insert(service, Window { generation, timer }) {
            previous.timer.abort();
        }
    }

    /// Close the window if `generation` is still the newest for `service`.
    pub fn take_due(&mut self, service: ServiceId, generation: u64) -> bool {
        match self.windows.get(&service) {
            Some(window) if window.generation == generation => {
                self.windows.remove(&service);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_pending(&self, service: ServiceId) -> bool {
        self.windows.contains_key(&service)
    }

    pub fn cancel(&mut self, service: ServiceId) {
        if let Some(window) = self.windows.remove(&service) {
            window.timer.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, window) in self.windows.drain() {
            window.timer.abort();
        }
    }
}

impl Drop for RequestCoalescer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Files to check for `service`: every checkable binding on it, least
/// recently activated first.
pub fn batch_files<'a>(
    bindings: impl IntoIterator<Item = &'a DocumentBinding>,
    service: ServiceId,
) -> Vec<PathBuf> {
    let mut members: Vec<&DocumentBinding> = bindings
        .into_iter()
        .filter(|b| b.is_checkable() && b.service_id() == Some(service))
        .collect();
    members.sort_by_key(|b| (b.active_at(), b.id()));

    let mut files: Vec<PathBuf> = Vec::with_capacity(members.len());
    for binding in members {
        if let Some(path) = binding.file_path()
            && !files.iter().any(|f| f == path)
        {
            files.push(path.to_path_buf());
        }
    }
    files
}
