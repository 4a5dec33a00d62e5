//! In-memory service registry
//!
//! Holds a `server name -> url` map per project and implements [`Registry`]
//! by pushing the full server set to a watcher on every change. The admin
//! API writes to it; tests use it to drive discovery and to inject watch
//! failures.

use crate::discover::{EndpointRecord, Registry, RegistryError, Watcher};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

type Servers = BTreeMap<String, String>;

struct ProjectEntry {
    servers: watch::Sender<Servers>,
    faults: broadcast::Sender<RegistryError>,
}

impl ProjectEntry {
    fn new() -> Self {
        let (servers, _) = watch::channel(Servers::new());
        let (faults, _) = broadcast::channel(16);
        Self { servers, faults }
    }
}

/// Counts a running watch for as long as it is alive
struct WatchGuard<'a>(&'a AtomicUsize);

impl<'a> WatchGuard<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry keeping project membership in memory
pub struct MemoryRegistry {
    projects: DashMap<String, ProjectEntry>,
    closed: watch::Sender<bool>,
    unavailable: AtomicBool,
    watches: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            projects: DashMap::new(),
            closed,
            unavailable: AtomicBool::new(false),
            watches: AtomicUsize::new(0),
        }
    }

    fn modify<F: FnOnce(&mut Servers) -> bool>(&self, project: &str, change: F) -> bool {
        let entry = self
            .projects
            .entry(project.to_string())
            .or_insert_with(ProjectEntry::new);
        entry.servers.send_if_modified(change)
    }

    /// Set the url of `server` in `project`
    pub fn put_server(&self, project: &str, server: &str, url: &str) {
        let changed = self.modify(project, |servers| {
            servers.insert(server.to_string(), url.to_string()).as_deref() != Some(url)
        });
        if changed {
            info!(project = %project, server = %server, url = %url, "Registered server");
        }
    }

    /// Remove `server` from `project`; false if it was not present
    pub fn delete_server(&self, project: &str, server: &str) -> bool {
        let removed = self.modify(project, |servers| servers.remove(server).is_some());
        if removed {
            info!(project = %project, server = %server, "Deregistered server");
        }
        removed
    }

    /// Replace the whole server set of `project`
    pub fn set_servers<I, K, V>(&self, project: &str, servers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let next: Servers = servers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.modify(project, |servers| {
            if *servers == next {
                return false;
            }
            *servers = next;
            true
        });
    }

    /// Current servers of `project`
    pub fn servers(&self, project: &str) -> Vec<EndpointRecord> {
        self.projects
            .get(project)
            .map(|entry| records(&entry.servers.borrow()))
            .unwrap_or_default()
    }

    /// Fail every running watch on `project`
    pub fn fail_watches(&self, project: &str, reason: &str) {
        if let Some(entry) = self.projects.get(project) {
            let _ = entry.faults.send(RegistryError::WatchFailed {
                project: project.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// While set, new watches fail immediately
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of watches currently running
    pub fn watch_count(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn records(servers: &Servers) -> Vec<EndpointRecord> {
    servers
        .iter()
        .map(|(name, url)| EndpointRecord::new(name.as_str(), url.as_str()))
        .collect()
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn watch(&self, project: &str, watcher: Arc<dyn Watcher>) -> Result<(), RegistryError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(());
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable(format!(
                "cannot watch project {}",
                project
            )));
        }

        let (mut servers, mut faults) = {
            let entry = self
                .projects
                .entry(project.to_string())
                .or_insert_with(ProjectEntry::new);
            (entry.servers.subscribe(), entry.faults.subscribe())
        };
        let _guard = WatchGuard::new(&self.watches);
        watcher.connected();
        debug!(project = %project, "Watch started");

        // An empty initial set leaves the proxies' configured endpoints in place
        let initial = records(&servers.borrow_and_update());
        if !initial.is_empty() {
            watcher.update_endpoints(&initial);
        }

        loop {
            tokio::select! {
                changed = servers.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let current = records(&servers.borrow_and_update());
                    watcher.update_endpoints(&current);
                }
                fault = faults.recv() => match fault {
                    Ok(err) => return Err(err),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = closed.changed() => {
                    debug!(project = %project, "Watch closed");
                    return Ok(());
                }
            }
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
        info!("Registry closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<Vec<EndpointRecord>>>,
        errors: Mutex<Vec<RegistryError>>,
    }

    impl Watcher for Recorder {
        fn update_endpoints(&self, endpoints: &[EndpointRecord]) {
            self.updates.lock().push(endpoints.to_vec());
        }

        fn error(&self, err: &RegistryError) {
            self.errors.lock().push(err.clone());
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_put_and_delete_servers() {
        let registry = MemoryRegistry::new();
        registry.put_server("builder", "b1", "10.0.0.1:3333");
        registry.put_server("builder", "b2", "10.0.0.2:3333");

        assert_eq!(
            registry.servers("builder"),
            vec![
                EndpointRecord::new("b1", "10.0.0.1:3333"),
                EndpointRecord::new("b2", "10.0.0.2:3333"),
            ]
        );

        assert!(registry.delete_server("builder", "b1"));
        assert!(!registry.delete_server("builder", "b1"));
        assert_eq!(registry.servers("builder").len(), 1);
        assert!(registry.servers("unknown").is_empty());
    }

    #[tokio::test]
    async fn test_watch_delivers_full_sets() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.put_server("builder", "b1", "10.0.0.1:3333");
        let recorder = Arc::new(Recorder::default());

        let task = {
            let registry = registry.clone();
            let watcher: Arc<dyn Watcher> = recorder.clone();
            tokio::spawn(async move { registry.watch("builder", watcher).await })
        };

        wait_for(|| recorder.updates.lock().len() == 1).await;
        registry.set_servers("builder", [("b2", "10.0.0.2:3333")]);
        wait_for(|| recorder.updates.lock().len() == 2).await;

        assert_eq!(
            recorder.updates.lock()[1],
            vec![EndpointRecord::new("b2", "10.0.0.2:3333")]
        );

        registry.close();
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(registry.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_put_is_silent() {
        let registry = Arc::new(MemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());

        let task = {
            let registry = registry.clone();
            let watcher: Arc<dyn Watcher> = recorder.clone();
            tokio::spawn(async move { registry.watch("builder", watcher).await })
        };
        wait_for(|| registry.watch_count() == 1).await;

        registry.put_server("builder", "b1", "10.0.0.1:3333");
        wait_for(|| recorder.updates.lock().len() == 1).await;
        registry.put_server("builder", "b1", "10.0.0.1:3333");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.updates.lock().len(), 1);

        registry.close();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_fault_ends_watch_with_error() {
        let registry = Arc::new(MemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());

        let task = {
            let registry = registry.clone();
            let watcher: Arc<dyn Watcher> = recorder.clone();
            tokio::spawn(async move { registry.watch("acp_node", watcher).await })
        };
        wait_for(|| registry.watch_count() == 1).await;

        registry.fail_watches("acp_node", "lease expired");
        let result = task.await.unwrap();
        assert!(matches!(result, Err(RegistryError::WatchFailed { .. })));
        assert_eq!(registry.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_and_closed() {
        let registry = MemoryRegistry::new();
        let watcher: Arc<dyn Watcher> = Arc::new(Recorder::default());

        registry.set_unavailable(true);
        assert!(matches!(
            registry.watch("acp_node", watcher.clone()).await,
            Err(RegistryError::Unavailable(_))
        ));

        registry.set_unavailable(false);
        registry.close();
        assert!(registry.is_closed());
        assert_eq!(registry.watch("acp_node", watcher).await, Ok(()));
    }
}
