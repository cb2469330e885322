//! Host-side adapters that turn orchestrator callbacks into JSON lines.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tsmux_engine::{
    ActiveStatus, DiagnosticsRegistry, DiagnosticsSink, ProjectConfig, SinkDescriptor,
    StatusDisplay, StatusTile,
};
use tsmux_service::{CompletionEntry, Location, PendingRequest};
use tsmux_types::{Diagnostic, DiagnosticCategory};

/// One line written to stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostOutput<'a> {
    Diagnostics {
        path: &'a Path,
        category: DiagnosticCategory,
        items: &'a [Diagnostic],
    },
    ClearDiagnostics,
    Tile {
        priority: i32,
    },
    Pending {
        requests: &'a [PendingRequest],
    },
    Active {
        #[serde(flatten)]
        status: &'a ActiveStatus,
    },
    Inactive,
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        message: &'a str,
    },
    Completions {
        id: Option<u64>,
        entries: &'a [CompletionEntry],
    },
    Definition {
        id: Option<u64>,
        locations: &'a [Location],
    },
    Project {
        id: Option<u64>,
        path: &'a Path,
        config: &'a Value,
    },
}

impl HostOutput<'_> {
    pub fn project(id: Option<u64>, project: &ProjectConfig) -> HostOutput<'_> {
        HostOutput::Project {
            id,
            path: &project.path,
            config: &project.config,
        }
    }
}

/// Cloneable handle onto the stdout writer task.
#[derive(Clone)]
pub struct Output {
    tx: mpsc::UnboundedSender<String>,
}

impl Output {
    /// Start the writer. It exits once every `Output` is dropped.
    pub fn spawn(stdout: Stdout) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(stdout, rx));
        (Self { tx }, writer)
    }

    #[cfg(test)]
    fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, message: &HostOutput<'_>) {
        match serde_json::to_string(message) {
            Ok(line) => {
                if self.tx.send(line).is_err() {
                    tracing::debug!("Output closed; dropping message");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize host output"),
        }
    }

    pub fn error(&self, id: Option<u64>, message: &str) {
        self.emit(&HostOutput::Error { id, message });
    }
}

async fn write_lines(mut stdout: Stdout, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "Failed to write to stdout");
            return;
        }
        if let Err(e) = stdout.flush().await {
            tracing::warn!(error = %e, "Failed to flush stdout");
            return;
        }
    }
}

pub struct JsonRegistry {
    pub out: Output,
}

impl DiagnosticsRegistry for JsonRegistry {
    fn register(&mut self, descriptor: &SinkDescriptor) -> Box<dyn DiagnosticsSink> {
        tracing::info!(name = %descriptor.name, "Diagnostics sink registered");
        Box::new(JsonSink {
            out: self.out.clone(),
        })
    }
}

struct JsonSink {
    out: Output,
}

impl DiagnosticsSink for JsonSink {
    fn set_errors(&mut self, category: DiagnosticCategory, path: &Path, items: &[Diagnostic]) {
        self.out.emit(&HostOutput::Diagnostics {
            path,
            category,
            items,
        });
    }

    fn clear(&mut self) {
        self.out.emit(&HostOutput::ClearDiagnostics);
    }
}

/// A headless host has no status bar of its own; tile placement is still
/// reported so a front end can mirror it.
pub struct JsonStatus {
    out: Output,
    last_pending: Vec<PendingRequest>,
}

impl JsonStatus {
    pub fn new(out: Output) -> Self {
        Self {
            out,
            last_pending: Vec::new(),
        }
    }
}

impl StatusDisplay for JsonStatus {
    fn right_tiles(&self) -> Vec<StatusTile> {
        Vec::new()
    }

    fn add_right_tile(&mut self, priority: i32) {
        self.out.emit(&HostOutput::Tile { priority });
    }

    fn set_pending(&mut self, pending: &[PendingRequest]) {
        if self.last_pending == pending {
            return;
        }
        self.last_pending = pending.to_vec();
        self.out.emit(&HostOutput::Pending { requests: pending });
    }

    fn set_active(&mut self, status: &ActiveStatus) {
        self.out.emit(&HostOutput::Active { status });
    }

    fn clear_active(&mut self) {
        self.out.emit(&HostOutput::Inactive);
    }

    fn show_error(&mut self, message: &str) {
        self.out.error(None, message);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tsmux_types::{BindingId, DiagnosticSeverity, Position, ServiceId};

    use super::*;

    fn lines(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[test]
    fn test_sink_emits_tagged_diagnostics() {
        let (out, mut rx) = Output::channel();
        let mut sink = JsonRegistry { out }.register(&SinkDescriptor {
            name: "tsmux".to_string(),
        });
        let item = Diagnostic::new(
            DiagnosticSeverity::Error,
            "Cannot find name 'x'.".to_string(),
            Position::new(0, 4),
            Position::new(0, 5),
            Some(2304),
            "ts".to_string(),
        );
        sink.set_errors(DiagnosticCategory::Semantic, Path::new("/p/a.ts"), &[item]);
        sink.clear();

        let lines = lines(&mut rx);
        assert_eq!(lines[0]["type"], "diagnostics");
        assert_eq!(lines[0]["category"], "semantic");
        assert_eq!(lines[0]["path"], "/p/a.ts");
        assert_eq!(lines[0]["items"][0]["code"], 2304);
        assert_eq!(lines[1]["type"], "clear_diagnostics");
    }

    #[test]
    fn test_status_flattens_active_binding() {
        let (out, mut rx) = Output::channel();
        let mut status = JsonStatus::new(out);
        status.add_right_tile(99);
        status.set_active(&ActiveStatus {
            binding: BindingId::new(3),
            path: Some(PathBuf::from("/p/a.ts")),
            service: Some(ServiceId::new(1)),
            project: None,
            pending: Vec::new(),
        });
        status.clear_active();

        let lines = lines(&mut rx);
        assert_eq!(lines[0]["priority"], 99);
        assert_eq!(lines[1]["type"], "active");
        assert_eq!(lines[1]["binding"], 3);
        assert_eq!(lines[1]["path"], "/p/a.ts");
        assert_eq!(lines[2]["type"], "inactive");
    }

    #[test]
    fn test_unchanged_pending_is_not_repeated() {
        let (out, mut rx) = Output::channel();
        let mut status = JsonStatus::new(out);
        status.set_pending(&[]);
        status.show_error("service failed to start");

        let lines = lines(&mut rx);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "error");
        assert!(lines[0].get("id").is_none());
    }
}
