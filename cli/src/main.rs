//! tsmux - headless host for the compiler-service multiplexer.
//!
//! ```text
//! stdin (JSON lines) -> HostCommand -> Orchestrator -> services
//!                                           |
//!                                           v
//!                      stdout (JSON lines) <- sink / status / query answers
//! ```
//!
//! Stdout carries the host protocol only, so logs go to a file.

mod commands;
mod host;

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tsmux_engine::{Orchestrator, PersistedState, TsmuxConfig};
use tsmux_service::ProcessConnector;

use crate::commands::HostCommand;
use crate::host::{JsonRegistry, JsonStatus, Output};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: stay silent rather than interleave logs with the protocol.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tsmux/logs/tsmux.log
    if let Some(config_path) = TsmuxConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("tsmux.log"));
    }

    // Fallback: ./.tsmux/logs/tsmux.log
    candidates.push(PathBuf::from(".tsmux").join("logs").join("tsmux.log"));

    candidates
}

fn load_config() -> TsmuxConfig {
    match TsmuxConfig::load() {
        Ok(Some(config)) => config,
        Ok(None) => {
            tracing::info!("No config file; using defaults");
            TsmuxConfig::default()
        }
        Err(e) => {
            tracing::warn!(path = %e.path().display(), error = %e, "Ignoring unusable config");
            TsmuxConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config();
    let connector = Arc::new(ProcessConnector::new(config.service.clone()));
    let (out, writer) = Output::spawn(tokio::io::stdout());

    let mut orch = Orchestrator::new(connector, config);
    orch.consume_diagnostics_sink(&mut JsonRegistry { out: out.clone() });
    orch.consume_status_display(Box::new(JsonStatus::new(out.clone())));
    orch.activate(PersistedState::default());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match HostCommand::parse(&line) {
                        Ok(command) => commands::dispatch(&mut orch, &out, command),
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed host event");
                            out.error(None, &format!("malformed event: {e}"));
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("Host closed stdin");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read host events");
                    break;
                }
            },
            active = orch.process_next() => {
                if !active {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    orch.deactivate().await;
    // The sink and status display hold output handles too.
    drop(orch);
    drop(out);
    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "Output writer failed");
    }
    Ok(())
}
