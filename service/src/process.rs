//! Process connector: one child process per project, tsserver-style stdio.

use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tsmux_types::{ENV_SECRET_DENYLIST, ProjectKey};

use crate::codec::{FrameReader, LineWriter};
use crate::config::ServiceConfig;
use crate::connection::{Connection, Connector, PushSink, RpcFut, StopReason};
use crate::error::ServiceError;
use crate::protocol::{self, Incoming, Request, commands};

const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

const WRITER_CHANNEL_CAPACITY: usize = 64;

type Reply = Result<Value, ServiceError>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

enum WriterCommand {
    Send(Value),
    Shutdown,
}

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
/// Both pattern and key are compared in uppercase.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.starts_with('*'), pat.ends_with('*')) {
        (true, true) if pat.len() >= 2 => key_upper.contains(&pat[1..pat.len() - 1]),
        (true, true) => true,
        (true, false) => key_upper.ends_with(&pat[1..]),
        (false, true) => key_upper.starts_with(&pat[..pat.len() - 1]),
        (false, false) => key_upper == pat,
    }
}

fn is_secret_env(key: &str) -> bool {
    let upper = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pat| env_glob_matches(pat, &upper))
}

/// Starts the configured service command as a child process per project.
pub struct ProcessConnector {
    config: ServiceConfig,
}

impl ProcessConnector {
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    fn spawn(&self, key: &ProjectKey) -> Result<Child, String> {
        let resolved = which::which(&self.config.command)
            .map_err(|e| format!("{} not found in PATH: {e}", self.config.command))?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&self.config.args)
            .current_dir(key.root())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for (name, _) in env::vars() {
            if is_secret_env(&name) {
                cmd.env_remove(&name);
            }
        }
        // Explicitly configured variables are passed through as given.
        cmd.envs(&self.config.env);

        cmd.spawn()
            .map_err(|e| format!("spawning {}: {e}", self.config.command))
    }
}

impl Connector for ProcessConnector {
    fn connect<'a>(&'a self, key: &'a ProjectKey, push: PushSink) -> RpcFut<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let start_failed = |message: String| ServiceError::ServiceStartFailed {
                key: key.clone(),
                message,
            };

            let mut child = self.spawn(key).map_err(start_failed)?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| start_failed("no stdout from child".to_string()))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| start_failed("no stdin from child".to_string()))?;
            tracing::debug!(key = %key, pid = ?child.id(), "Spawned service process");

            let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

            let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
            let writer_key = key.clone();
            tokio::spawn(async move {
                let mut writer = LineWriter::new(stdin);
                while let Some(cmd) = writer_rx.recv().await {
                    match cmd {
                        WriterCommand::Send(message) => {
                            if let Err(e) = writer.write_message(&message).await {
                                tracing::warn!(key = %writer_key, "Service write error: {e:#}");
                                break;
                            }
                        }
                        WriterCommand::Shutdown => break,
                    }
                }
            });

            let reader_pending = Arc::clone(&pending);
            tokio::spawn(async move {
                let mut reader = FrameReader::new(stdout);
                let reason = loop {
                    match reader.read_frame().await {
                        Ok(Some(frame)) => dispatch_frame(frame, &reader_pending, &push),
                        Ok(None) => {
                            tracing::info!(key = %push.key(), "Service closed stdout");
                            break StopReason::Exited;
                        }
                        Err(e) => {
                            tracing::warn!(key = %push.key(), "Service reader error: {e:#}");
                            break StopReason::Failed(format!("{e:#}"));
                        }
                    }
                };
                // Dropping the senders fails every waiter with Disconnected.
                reader_pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                push.closed(reason);
            });

            let connection: Arc<dyn Connection> = Arc::new(ProcessConnection {
                child: tokio::sync::Mutex::new(Some(child)),
                writer_tx,
                next_seq: AtomicU64::new(1),
                pending,
            });
            Ok(connection)
        })
    }
}

/// Route one frame from the service: responses and `requestCompleted` events
/// settle pending requests, diagnostics events go to `push`.
fn dispatch_frame(frame: Value, pending: &PendingMap, push: &PushSink) {
    let incoming = match serde_json::from_value::<Incoming>(frame) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::trace!(key = %push.key(), "Ignoring unrecognized service frame: {e}");
            return;
        }
    };

    match incoming {
        Incoming::Response(response) => {
            let reply = if response.success {
                Ok(response.body)
            } else {
                Err(ServiceError::RequestFailed {
                    command: response.command,
                    message: response
                        .message
                        .unwrap_or_else(|| "request failed".to_string()),
                })
            };
            complete(pending, response.request_seq, reply);
        }
        Incoming::Event(event) if event.event == protocol::REQUEST_COMPLETED_EVENT => {
            if let Some(seq) = protocol::completed_request_seq(&event.body) {
                complete(pending, seq, Ok(Value::Null));
            }
        }
        Incoming::Event(event) => {
            match protocol::parse_diagnostics_event(&event.event, event.body) {
                Some((category, path, items)) => push.diagnostics(category, path, items),
                None => {
                    tracing::trace!(key = %push.key(), event = %event.event, "Ignoring service event");
                }
            }
        }
    }
}

fn complete(pending: &PendingMap, seq: u64, reply: Reply) {
    let sender = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&seq);
    if let Some(tx) = sender {
        let _ = tx.send(reply);
    }
}

/// Removes a pending entry when its request future is dropped early.
struct PendingEntry<'a> {
    pending: &'a PendingMap,
    seq: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.seq);
    }
}

struct ProcessConnection {
    child: tokio::sync::Mutex<Option<Child>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_seq: AtomicU64,
    pending: PendingMap,
}

impl ProcessConnection {
    async fn write(&self, seq: u64, command: &str, args: Value) -> Result<(), ServiceError> {
        let frame = serde_json::to_value(Request::new(seq, command, args)).map_err(|e| {
            ServiceError::RequestFailed {
                command: command.to_string(),
                message: format!("serializing request: {e}"),
            }
        })?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| ServiceError::Disconnected)
    }
}

impl Connection for ProcessConnection {
    fn request<'a>(&'a self, command: &'a str, args: Value) -> RpcFut<'a, Value> {
        Box::pin(async move {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(seq, tx);
            let _entry = PendingEntry {
                pending: &self.pending,
                seq,
            };

            self.write(seq, command, args).await?;
            rx.await.unwrap_or(Err(ServiceError::Disconnected))
        })
    }

    fn notify<'a>(&'a self, command: &'a str, args: Value) -> RpcFut<'a, ()> {
        Box::pin(async move {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.write(seq, command, args).await
        })
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(mut child) = self.child.lock().await.take() else {
                return;
            };

            let _ = self.notify(commands::EXIT, Value::Null).await;
            let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

            let exited =
                tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), child.wait()).await;
            if exited.is_err() {
                tracing::debug!(pid = ?child.id(), "Service didn't exit in time, killing");
                let _ = child.kill().await;
            }
        })
    }
}
