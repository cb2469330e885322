//! ServiceResolver: maps files to the service instance of their project.
//!
//! One instance per [`ProjectKey`], started lazily on the first resolve for a
//! file of that project. Concurrent resolves for a key that is still starting
//! share the single start attempt (singleflight): the first caller connects,
//! the rest wait on a `watch` channel for its outcome.
//!
//! Instances live in the resolver's map until evicted. Eviction happens when
//! a connection dies or on [`ServiceResolver::shutdown_all`]; idle instances
//! are kept.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tsmux_types::{DiagnosticClock, ProjectKey, ServiceId};

use crate::config::ServiceConfig;
use crate::connection::{Connector, PushSink, ServiceEvent};
use crate::error::ServiceError;
use crate::instance::ServiceInstance;

type StartOutcome = Option<Result<Arc<ServiceInstance>, ServiceError>>;

/// Find the nearest enclosing project config for `file`.
///
/// Walks from the file's directory up to the filesystem root; in each
/// directory the markers are tried in order.
#[must_use]
pub fn discover_project(file: &Path, markers: &[String]) -> Option<ProjectKey> {
    let start = file.parent()?;
    for dir in start.ancestors() {
        for marker in markers {
            let candidate = dir.join(marker);
            if candidate.is_file() {
                return ProjectKey::new(candidate).ok();
            }
        }
    }
    None
}

#[derive(Default)]
struct ResolverState {
    instances: HashMap<ProjectKey, Arc<ServiceInstance>>,
    starting: HashMap<ProjectKey, watch::Receiver<StartOutcome>>,
    closed: bool,
}

enum Role {
    Leader(watch::Sender<StartOutcome>),
    Waiter(watch::Receiver<StartOutcome>),
}

/// Clears the `starting` entry if the leader is abandoned mid-start, so
/// waiters retry instead of waiting forever.
struct StartGuard<'a> {
    resolver: &'a ServiceResolver,
    key: ProjectKey,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.resolver.state().starting.remove(&self.key);
        }
    }
}

/// Owns every [`ServiceInstance`] and resolves files to them.
pub struct ServiceResolver {
    connector: Arc<dyn Connector>,
    project_markers: Vec<String>,
    request_timeout: Duration,
    clock: DiagnosticClock,
    events: mpsc::UnboundedSender<ServiceEvent>,
    next_id: AtomicU64,
    state: Mutex<ResolverState>,
}

impl ServiceResolver {
    /// Create a resolver and the receiving end of its event stream.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &ServiceConfig,
        clock: DiagnosticClock,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let resolver = Self {
            connector,
            project_markers: config.project_markers.clone(),
            request_timeout: config.request_timeout(),
            clock,
            events,
            next_id: AtomicU64::new(1),
            state: Mutex::new(ResolverState::default()),
        };
        (resolver, rx)
    }

    fn state(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The project `file` belongs to, if any.
    #[must_use]
    pub fn project_for(&self, file: &Path) -> Option<ProjectKey> {
        discover_project(file, &self.project_markers)
    }

    /// Resolve `file` to the live instance of its project, starting one if needed.
    pub async fn resolve(&self, file: &Path) -> Result<Arc<ServiceInstance>, ServiceError> {
        let key = self
            .project_for(file)
            .ok_or_else(|| ServiceError::ProjectNotFound {
                path: file.to_path_buf(),
            })?;
        self.resolve_key(key).await
    }

    /// Resolve a known project key to its live instance.
    pub async fn resolve_key(&self, key: ProjectKey) -> Result<Arc<ServiceInstance>, ServiceError> {
        loop {
            let role = {
                let mut state = self.state();
                if state.closed {
                    return Err(ServiceError::Disconnected);
                }
                if let Some(instance) = state.instances.get(&key) {
                    if instance.is_alive() {
                        return Ok(Arc::clone(instance));
                    }
                    tracing::debug!(service = %instance.id(), key = %key, "Replacing dead service");
                    state.instances.remove(&key);
                }
                match state.starting.get(&key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        state.starting.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => return self.start(key, tx).await,
                Role::Waiter(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => outcome.clone(),
                        // Leader abandoned; try again, possibly as the new leader.
                        Err(_) => None,
                    };
                    if let Some(result) = outcome {
                        return result;
                    }
                }
            }
        }
    }

    async fn start(
        &self,
        key: ProjectKey,
        tx: watch::Sender<StartOutcome>,
    ) -> Result<Arc<ServiceInstance>, ServiceError> {
        let mut guard = StartGuard {
            resolver: self,
            key: key.clone(),
            armed: true,
        };

        let id = ServiceId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let alive = Arc::new(AtomicBool::new(true));
        let push = PushSink::new(
            id,
            key.clone(),
            self.clock.clone(),
            Arc::clone(&alive),
            self.events.clone(),
        );

        tracing::info!(service = %id, key = %key, "Starting compiler service");
        let connected = self.connector.connect(&key, push).await;

        let result = match connected {
            Ok(connection) => {
                let instance = Arc::new(ServiceInstance::new(
                    id,
                    key.clone(),
                    connection,
                    alive,
                    self.events.clone(),
                    self.request_timeout,
                ));
                let closed = {
                    let mut state = self.state();
                    state.starting.remove(&key);
                    if !state.closed {
                        state.instances.insert(key.clone(), Arc::clone(&instance));
                    }
                    state.closed
                };
                if closed {
                    // Shut down while we were connecting.
                    instance.shutdown().await;
                    Err(ServiceError::Disconnected)
                } else {
                    tracing::info!(service = %id, key = %key, "Compiler service started");
                    Ok(instance)
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to start compiler service");
                self.state().starting.remove(&key);
                Err(e)
            }
        };

        guard.armed = false;
        let _ = tx.send(Some(result.clone()));
        result
    }

    /// Every instance currently owned by the resolver.
    #[must_use]
    pub fn list_instances(&self) -> Vec<Arc<ServiceInstance>> {
        let mut instances: Vec<_> = self.state().instances.values().cloned().collect();
        instances.sort_by_key(|i| i.id());
        instances
    }

    /// The live instance for `key`, without starting one.
    #[must_use]
    pub fn get(&self, key: &ProjectKey) -> Option<Arc<ServiceInstance>> {
        self.state()
            .instances
            .get(key)
            .filter(|i| i.is_alive())
            .cloned()
    }

    /// Remove the instance with `id` if it is still the current one for its key.
    ///
    /// Returns the evicted instance. A stale id (already replaced) is a no-op.
    pub fn evict(&self, id: ServiceId) -> Option<Arc<ServiceInstance>> {
        let mut state = self.state();
        let key = state
            .instances
            .iter()
            .find(|(_, instance)| instance.id() == id)
            .map(|(key, _)| key.clone())?;
        let evicted = state.instances.remove(&key);
        if evicted.is_some() {
            tracing::info!(service = %id, key = %key, "Evicted compiler service");
        }
        evicted
    }

    /// Shut down every instance and refuse further resolution.
    ///
    /// Starts still in progress are shut down as soon as they connect.
    pub async fn shutdown_all(&self) {
        let instances: Vec<_> = {
            let mut state = self.state();
            state.closed = true;
            state.instances.drain().map(|(_, i)| i).collect()
        };
        for instance in instances {
            tracing::info!(service = %instance.id(), key = %instance.key(), "Shutting down compiler service");
            instance.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::connection::StopReason;
    use crate::testing::ScriptedConnector;
    use tsmux_types::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Position};

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn project(&self, name: &str) -> PathBuf {
            let root = self.dir.path().join(name);
            fs::create_dir_all(&root).unwrap();
            fs::write(root.join("tsconfig.json"), "{}").unwrap();
            root
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }
    }

    fn resolver(
        connector: &ScriptedConnector,
    ) -> (ServiceResolver, mpsc::UnboundedReceiver<ServiceEvent>) {
        ServiceResolver::new(
            Arc::new(connector.clone()),
            &ServiceConfig::default(),
            DiagnosticClock::new(),
        )
    }

    #[test]
    fn test_discover_nearest_config() {
        let fx = Fixture::new();
        let outer = fx.project("mono");
        let inner = fx.project("mono/packages/app");
        let markers = ServiceConfig::default().project_markers;

        let key = discover_project(&inner.join("src/index.ts"), &markers).unwrap();
        assert_eq!(key.config_file(), inner.join("tsconfig.json"));

        let key = discover_project(&outer.join("scripts/build.ts"), &markers).unwrap();
        assert_eq!(key.config_file(), outer.join("tsconfig.json"));
    }

    #[test]
    fn test_discover_marker_priority() {
        let fx = Fixture::new();
        let root = fx.path("js");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("jsconfig.json"), "{}").unwrap();
        let markers = ServiceConfig::default().project_markers;
        let key = discover_project(&root.join("a.js"), &markers).unwrap();
        assert_eq!(key.config_file(), root.join("jsconfig.json"));

        fs::write(root.join("tsconfig.json"), "{}").unwrap();
        let key = discover_project(&root.join("a.js"), &markers).unwrap();
        assert_eq!(key.config_file(), root.join("tsconfig.json"));
    }

    #[test]
    fn test_discover_ignores_directories_named_like_markers() {
        let fx = Fixture::new();
        let root = fx.path("odd");
        fs::create_dir_all(root.join("tsconfig.json")).unwrap();
        let markers = vec!["tsconfig.json".to_string()];
        // A directory is not a config file; nothing above the tempdir has one either.
        assert!(
            discover_project(&root.join("a.ts"), &markers)
                .is_none_or(|key| !key.config_file().starts_with(fx.dir.path()))
        );
    }

    #[tokio::test]
    async fn test_project_not_found() {
        let fx = Fixture::new();
        let connector = ScriptedConnector::new();
        let (resolver, _rx) = ServiceResolver::new(
            Arc::new(connector.clone()),
            &ServiceConfig {
                project_markers: vec!["tsmux-test-marker-that-does-not-exist.json".to_string()],
                ..ServiceConfig::default()
            },
            DiagnosticClock::new(),
        );

        let err = resolver.resolve(&fx.path("a.ts")).await.unwrap_err();
        assert!(err.is_project_not_found());
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_files_of_one_project_share_an_instance() {
        let fx = Fixture::new();
        let root = fx.project("proj");
        let connector = ScriptedConnector::new();
        let (resolver, _rx) = resolver(&connector);

        let a = resolver.resolve(&root.join("a.ts")).await.unwrap();
        let b = resolver.resolve(&root.join("b.ts")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(resolver.list_instances().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_share_one_start() {
        let fx = Fixture::new();
        let root = fx.project("proj");
        let connector = ScriptedConnector::new().with_connect_delay(Duration::from_millis(20));
        let (resolver, _rx) = resolver(&connector);
        let resolver = Arc::new(resolver);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let resolver = Arc::clone(&resolver);
            let file = root.join(format!("f{i}.ts"));
            tasks.push(tokio::spawn(async move { resolver.resolve(&file).await }));
        }

        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await.unwrap().unwrap());
        }
        assert_eq!(connector.connect_count(), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failure_is_shared_and_not_cached() {
        let fx = Fixture::new();
        let root = fx.project("proj");
        let connector = ScriptedConnector::new().with_connect_delay(Duration::from_millis(5));
        let (resolver, _rx) = resolver(&connector);
        let key = resolver.project_for(&root.join("a.ts")).unwrap();
        connector.fail_connect(&key);

        let a_path = root.join("a.ts");
        let b_path = root.join("b.ts");
        let (a, b) = tokio::join!(resolver.resolve(&a_path), resolver.resolve(&b_path));
        assert!(matches!(a, Err(ServiceError::ServiceStartFailed { .. })));
        assert!(matches!(b, Err(ServiceError::ServiceStartFailed { .. })));
        assert_eq!(connector.connect_count(), 1);

        // The next explicit resolve retries.
        connector.allow_connect(&key);
        assert!(resolver.resolve(&root.join("a.ts")).await.is_ok());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_leader_lets_waiter_retry() {
        let fx = Fixture::new();
        let root = fx.project("proj");
        let connector = ScriptedConnector::new().with_connect_delay(Duration::from_millis(50));
        let (resolver, _rx) = resolver(&connector);

        // Leader gives up before its connect finishes.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), resolver.resolve(&root.join("a.ts")))
                .await;
        assert!(abandoned.is_err());

        let instance = resolver.resolve(&root.join("a.ts")).await.unwrap();
        assert!(instance.is_alive());
        assert_eq!(resolver.list_instances().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_projects_get_distinct_instances() {
        let fx = Fixture::new();
        let one = fx.project("one");
        let two = fx.project("two");
        let connector = ScriptedConnector::new();
        let (resolver, _rx) = resolver(&connector);

        let a = resolver.resolve(&one.join("a.ts")).await.unwrap();
        let c = resolver.resolve(&two.join("c.ts")).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.id(), c.id());
        assert_eq!(resolver.list_instances().len(), 2);
    }

    #[tokio::test]
    async fn test_dead_instance_is_replaced_and_evict_ignores_stale_id() {
        let fx = Fixture::new();
        let root = fx.project("proj");
        let connector = ScriptedConnector::new();
        let (resolver, mut rx) = resolver(&connector);

        let first = resolver.resolve(&root.join("a.ts")).await.unwrap();
        connector.kill(first.key(), StopReason::Exited);
        assert!(!first.is_alive());
        match rx.recv().await.unwrap() {
            ServiceEvent::Stopped { service, .. } => assert_eq!(service, first.id()),
            other => panic!("expected Stopped, got {other:?}"),
        }

        let second = resolver.resolve(&root.join("a.ts")).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(resolver.evict(first.id()).is_none());
        assert!(resolver.get(second.key()).is_some());

        assert!(resolver.evict(second.id()).is_some());
        assert!(resolver.list_instances().is_empty());
    }

    #[tokio::test]
    async fn test_diagnostics_push_is_attributed() {
        let fx = Fixture::new();
        let root = fx.project("proj");
        let connector = ScriptedConnector::new();
        let (resolver, mut rx) = resolver(&connector);

        let instance = resolver.resolve(&root.join("a.ts")).await.unwrap();
        let diag = Diagnostic::new(
            DiagnosticSeverity::Error,
            "';' expected.".to_string(),
            Position::new(0, 3),
            Position::new(0, 4),
            Some(1005),
            "ts".to_string(),
        );
        assert!(connector.push_diagnostics(
            instance.key(),
            DiagnosticCategory::Syntax,
            root.join("a.ts"),
            vec![diag],
        ));

        match rx.recv().await.unwrap() {
            ServiceEvent::Diagnostics {
                service,
                category,
                path,
                items,
                ..
            } => {
                assert_eq!(service, instance.id());
                assert_eq!(category, DiagnosticCategory::Syntax);
                assert_eq!(path, root.join("a.ts"));
                assert_eq!(items.len(), 1);
            }
            other => panic!("expected Diagnostics, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_resolver() {
        let fx = Fixture::new();
        let root = fx.project("proj");
        let connector = ScriptedConnector::new();
        let (resolver, _rx) = resolver(&connector);

        let instance = resolver.resolve(&root.join("a.ts")).await.unwrap();
        resolver.shutdown_all().await;

        assert!(!instance.is_alive());
        assert_eq!(connector.shutdowns().len(), 1);
        assert!(resolver.list_instances().is_empty());
        assert!(matches!(
            resolver.resolve(&root.join("a.ts")).await,
            Err(ServiceError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_start_discards_new_instance() {
        let fx = Fixture::new();
        let root = fx.project("proj");
        let connector = ScriptedConnector::new().with_connect_delay(Duration::from_millis(20));
        let (resolver, _rx) = resolver(&connector);

        let a_path = root.join("a.ts");
        let (resolved, ()) = tokio::join!(resolver.resolve(&a_path), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            resolver.shutdown_all().await;
        });

        assert!(matches!(resolved, Err(ServiceError::Disconnected)));
        assert!(resolver.list_instances().is_empty());
        assert_eq!(connector.shutdowns().len(), 1);
    }
}
