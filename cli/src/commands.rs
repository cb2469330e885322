//! Host events read from stdin, one JSON object per line.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tsmux_engine::{
    AutocompleteProvider, NavigationProvider, OpenDocument, Orchestrator, load_project_config,
};
use tsmux_service::ServiceResolver;
use tsmux_types::{DocumentId, Position};

use crate::host::{HostOutput, Output};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    Open {
        document: DocumentId,
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Close {
        document: DocumentId,
    },
    Focus {
        document: DocumentId,
    },
    Blur {
        document: DocumentId,
    },
    Save {
        document: DocumentId,
        path: PathBuf,
    },
    Change {
        document: DocumentId,
        text: String,
    },
    Completions {
        #[serde(default)]
        id: Option<u64>,
        path: PathBuf,
        line: u32,
        col: u32,
        #[serde(default)]
        prefix: String,
    },
    Definition {
        #[serde(default)]
        id: Option<u64>,
        path: PathBuf,
        line: u32,
        col: u32,
    },
    Project {
        #[serde(default)]
        id: Option<u64>,
        path: PathBuf,
    },
    Clear,
}

impl HostCommand {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Apply one host event. Queries run in the background and answer on `out`.
pub fn dispatch(orch: &mut Orchestrator, out: &Output, command: HostCommand) {
    match command {
        HostCommand::Open {
            document,
            path,
            language,
            text,
        } => {
            orch.document_opened(OpenDocument {
                document,
                path,
                language_id: language,
                text,
            });
        }
        HostCommand::Close { document } => orch.document_closed(document),
        HostCommand::Focus { document } => orch.focus_gained(document),
        HostCommand::Blur { document } => orch.focus_lost(document),
        HostCommand::Save { document, path } => orch.document_saved(document, path),
        HostCommand::Change { document, text } => orch.document_changed(document, text),
        HostCommand::Clear => orch.clear_errors(),
        HostCommand::Completions {
            id,
            path,
            line,
            col,
            prefix,
        } => {
            let Some(resolver) = resolver(orch, out, id) else {
                return;
            };
            let out = out.clone();
            tokio::spawn(async move {
                let provider = AutocompleteProvider::new(resolver);
                match provider
                    .completions(&path, Position::new(line, col), &prefix)
                    .await
                {
                    Ok(entries) => out.emit(&HostOutput::Completions {
                        id,
                        entries: &entries,
                    }),
                    Err(e) => out.error(id, &e.to_string()),
                }
            });
        }
        HostCommand::Definition { id, path, line, col } => {
            let Some(resolver) = resolver(orch, out, id) else {
                return;
            };
            let out = out.clone();
            tokio::spawn(async move {
                let provider = NavigationProvider::new(resolver);
                match provider.definition(&path, Position::new(line, col)).await {
                    Ok(locations) => out.emit(&HostOutput::Definition {
                        id,
                        locations: &locations,
                    }),
                    Err(e) => out.error(id, &e.to_string()),
                }
            });
        }
        HostCommand::Project { id, path } => {
            let Some(resolver) = resolver(orch, out, id) else {
                return;
            };
            let out = out.clone();
            tokio::spawn(async move {
                match load_project_config(&resolver, &path).await {
                    Ok(project) => out.emit(&HostOutput::project(id, &project)),
                    Err(e) => out.error(id, &format!("{e:#}")),
                }
            });
        }
    }
}

fn resolver(orch: &Orchestrator, out: &Output, id: Option<u64>) -> Option<Arc<ServiceResolver>> {
    let resolver = orch.resolver().cloned();
    if resolver.is_none() {
        out.error(id, "tsmux is not active");
    }
    resolver
}
