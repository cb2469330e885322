//! Scripted in-memory connector for tests.
//!
//! [`ScriptedConnector`] records every connect and request, answers from a
//! per-command script, and lets a test push diagnostics or kill a connection
//! as if the backend had done it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tsmux_types::{Diagnostic, DiagnosticCategory, ProjectKey};

use crate::connection::{Connection, Connector, PushSink, RpcFut, StopReason};
use crate::error::ServiceError;

/// A request as the scripted backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub key: ProjectKey,
    pub command: String,
    pub args: Value,
}

#[derive(Default)]
struct Script {
    connects: Vec<ProjectKey>,
    requests: Vec<RecordedRequest>,
    shutdowns: Vec<ProjectKey>,
    sinks: HashMap<ProjectKey, PushSink>,
    failing_keys: HashSet<ProjectKey>,
    failing_commands: HashSet<String>,
    responses: HashMap<String, Value>,
    gates: HashMap<String, watch::Sender<bool>>,
    connect_delay: Duration,
}

/// In-memory [`Connector`]. Clones share one script.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every connect take `delay` before completing.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.script().connect_delay = delay;
        self
    }

    /// Make connects for `key` fail with `ServiceStartFailed`.
    pub fn fail_connect(&self, key: &ProjectKey) {
        self.script().failing_keys.insert(key.clone());
    }

    pub fn allow_connect(&self, key: &ProjectKey) {
        self.script().failing_keys.remove(key);
    }

    /// Answer `command` with `body` from now on.
    pub fn respond(&self, command: &str, body: Value) {
        self.script().responses.insert(command.to_string(), body);
    }

    /// Fail every `command` request with `RequestFailed`, and every
    /// `command` notification with `Disconnected`.
    pub fn fail_command(&self, command: &str) {
        self.script().failing_commands.insert(command.to_string());
    }

    /// Keep `command` requests unanswered until [`Self::release`].
    pub fn hold(&self, command: &str) {
        let (tx, _rx) = watch::channel(false);
        self.script().gates.insert(command.to_string(), tx);
    }

    /// Answer every held and future `command` request.
    pub fn release(&self, command: &str) {
        if let Some(gate) = self.script().gates.remove(command) {
            let _ = gate.send(true);
        }
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.script().connects.len()
    }

    #[must_use]
    pub fn connects(&self) -> Vec<ProjectKey> {
        self.script().connects.clone()
    }

    #[must_use]
    pub fn shutdowns(&self) -> Vec<ProjectKey> {
        self.script().shutdowns.clone()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script().requests.clone()
    }

    #[must_use]
    pub fn requests_for(&self, command: &str) -> Vec<RecordedRequest> {
        self.script()
            .requests
            .iter()
            .filter(|r| r.command == command)
            .cloned()
            .collect()
    }

    /// Push diagnostics as the backend for `key`. Returns false if `key`
    /// was never connected.
    pub fn push_diagnostics(
        &self,
        key: &ProjectKey,
        category: DiagnosticCategory,
        path: impl Into<PathBuf>,
        items: Vec<Diagnostic>,
    ) -> bool {
        let sink = self.script().sinks.get(key).cloned();
        match sink {
            Some(sink) => {
                sink.diagnostics(category, path.into(), items);
                true
            }
            None => false,
        }
    }

    /// Simulate the backend for `key` dying.
    pub fn kill(&self, key: &ProjectKey, reason: StopReason) {
        let sink = self.script().sinks.get(key).cloned();
        if let Some(sink) = sink {
            sink.closed(reason);
        }
    }
}

impl Connector for ScriptedConnector {
    fn connect<'a>(&'a self, key: &'a ProjectKey, push: PushSink) -> RpcFut<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            // Yield so concurrent resolutions genuinely overlap.
            tokio::task::yield_now().await;
            let delay = self.script().connect_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut script = self.script();
            script.connects.push(key.clone());
            if script.failing_keys.contains(key) {
                return Err(ServiceError::ServiceStartFailed {
                    key: key.clone(),
                    message: "scripted connect failure".to_string(),
                });
            }
            script.sinks.insert(key.clone(), push);
            let connection: Arc<dyn Connection> = Arc::new(ScriptedConnection {
                key: key.clone(),
                script: Arc::clone(&self.script),
            });
            Ok(connection)
        })
    }
}

struct ScriptedConnection {
    key: ProjectKey,
    script: Arc<Mutex<Script>>,
}

impl Connection for ScriptedConnection {
    fn request<'a>(&'a self, command: &'a str, args: Value) -> RpcFut<'a, Value> {
        Box::pin(async move {
            let gate = {
                let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
                script.requests.push(RecordedRequest {
                    key: self.key.clone(),
                    command: command.to_string(),
                    args,
                });
                script.gates.get(command).map(watch::Sender::subscribe)
            };
            if let Some(mut gate) = gate {
                // A dropped gate counts as released.
                let _ = gate.wait_for(|open| *open).await;
            }

            let script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            if script.failing_commands.contains(command) {
                return Err(ServiceError::RequestFailed {
                    command: command.to_string(),
                    message: "scripted request failure".to_string(),
                });
            }
            Ok(script.responses.get(command).cloned().unwrap_or(Value::Null))
        })
    }

    fn notify<'a>(&'a self, command: &'a str, args: Value) -> RpcFut<'a, ()> {
        Box::pin(async move {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            script.requests.push(RecordedRequest {
                key: self.key.clone(),
                command: command.to_string(),
                args,
            });
            if script.failing_commands.contains(command) {
                return Err(ServiceError::Disconnected);
            }
            Ok(())
        })
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .shutdowns
                .push(self.key.clone());
        })
    }
}
