//! Dynamic endpoint discovery
//!
//! [`EndpointDiscover`] keeps one registry watch per project and fans each
//! membership update out to every proxy registered under that project. A
//! failed watch is retried with exponential backoff; once the retries are
//! used up the project is deregistered and its proxies keep the last
//! endpoint set they received.

use crate::backoff::ExponentialBackoff;
use crate::endpoint::LABEL_SEPARATOR;
use crate::proxy::Proxy;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One server of a project as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Server name, used as the endpoint label
    pub name: String,
    /// Server address; empty while the server has no address
    pub url: String,
}

impl EndpointRecord {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Errors reported by a registry watch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("watch on project {project} failed: {reason}")]
    WatchFailed { project: String, reason: String },
}

/// Receiver of membership changes for one project
pub trait Watcher: Send + Sync {
    /// Called once the watch is established, before any update
    fn connected(&self) {}

    /// Called with the full current server set of the project
    fn update_endpoints(&self, endpoints: &[EndpointRecord]);

    /// Called when the watch hits an error
    fn error(&self, err: &RegistryError);
}

/// External membership service
#[async_trait]
pub trait Registry: Send + Sync {
    /// Watch `project` until the registry closes (`Ok`) or the watch fails (`Err`)
    async fn watch(&self, project: &str, watcher: Arc<dyn Watcher>) -> Result<(), RegistryError>;

    /// End every running watch
    fn close(&self) {}
}

/// Retry policy for failed watches
#[derive(Debug, Clone, Copy)]
pub struct DiscoverConfig {
    /// Consecutive failures tolerated before a project is deregistered
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// Snapshot of a registered project
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub name: String,
    pub proxies: Vec<String>,
    /// Last endpoint set delivered to the proxies, if any
    pub endpoints: Option<Vec<String>>,
    /// Consecutive watch failures since a watch was last established
    pub failures: u32,
    pub last_error: Option<String>,
}

struct ProjectState {
    name: String,
    proxies: RwLock<Vec<Arc<dyn Proxy>>>,
    last_update: Mutex<Option<Vec<String>>>,
    failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProjectState {
    fn new(name: &str, proxy: Arc<dyn Proxy>) -> Self {
        Self {
            name: name.to_string(),
            proxies: RwLock::new(vec![proxy]),
            last_update: Mutex::new(None),
            failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn status(&self) -> ProjectStatus {
        let endpoints = self.last_update.lock().clone();
        let proxies = self
            .proxies
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        ProjectStatus {
            name: self.name.clone(),
            proxies,
            endpoints,
            failures: self.failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Watcher for ProjectState {
    fn connected(&self) {
        let failures = self.failures.swap(0, Ordering::Relaxed);
        if failures > 0 {
            info!(project = %self.name, failures, "Discovery watch re-established");
        }
    }

    fn update_endpoints(&self, records: &[EndpointRecord]) {
        let endpoints = labeled_endpoints(records);

        // Held across the fan-out so a proxy joining now sees either this set or the next
        let mut last = self.last_update.lock();
        self.failures.store(0, Ordering::Relaxed);

        let proxies = self.proxies.read().clone();
        debug!(
            project = %self.name,
            endpoints = ?endpoints,
            proxies = proxies.len(),
            "Delivering endpoint update"
        );
        for proxy in proxies.iter() {
            proxy.update_endpoints(&endpoints);
        }
        *last = Some(endpoints);
    }

    fn error(&self, err: &RegistryError) {
        warn!(project = %self.name, error = %err, "Discovery watch reported an error");
        *self.last_error.lock() = Some(err.to_string());
    }
}

/// Records with an address, formatted as `name=>url`
fn labeled_endpoints(records: &[EndpointRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| !r.url.is_empty())
        .map(|r| format!("{}{}{}", r.name, LABEL_SEPARATOR, r.url))
        .collect()
}

struct Inner {
    registry: Arc<dyn Registry>,
    config: DiscoverConfig,
    projects: Mutex<HashMap<String, Arc<ProjectState>>>,
    stopped: AtomicBool,
}

impl Inner {
    /// Remove `state` unless the name was re-registered in the meantime
    fn deregister(&self, state: &Arc<ProjectState>) {
        let mut projects = self.projects.lock();
        let current = projects
            .get(&state.name)
            .map(|s| Arc::ptr_eq(s, state))
            .unwrap_or(false);
        if current {
            projects.remove(&state.name);
        }
    }
}

/// Per-project registry watches with fan-out to proxies
pub struct EndpointDiscover {
    inner: Arc<Inner>,
}

impl EndpointDiscover {
    pub fn new(registry: Arc<dyn Registry>, config: DiscoverConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                projects: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Register `proxy` under project `name`
    ///
    /// The first registration of a name starts its watch. Later ones join
    /// the fan-out list and immediately receive the last delivered set.
    pub fn add_project(&self, name: &str, proxy: Arc<dyn Proxy>) {
        let mut projects = self.inner.projects.lock();
        // stop() sets the flag while holding this lock
        if self.inner.stopped.load(Ordering::Acquire) {
            warn!(project = %name, proxy = %proxy.name(), "Discovery is stopped, not registering proxy");
            return;
        }
        if let Some(state) = projects.get(name) {
            let last = state.last_update.lock();
            if let Some(endpoints) = last.as_ref() {
                proxy.update_endpoints(endpoints);
            }
            info!(project = %name, proxy = %proxy.name(), "Proxy joined existing project");
            state.proxies.write().push(proxy);
            return;
        }

        info!(project = %name, proxy = %proxy.name(), "Starting discovery watch");
        let state = Arc::new(ProjectState::new(name, proxy));
        let task = tokio::spawn(run_watch(Arc::clone(&self.inner), Arc::clone(&state)));
        *state.task.lock() = Some(task);
        projects.insert(name.to_string(), state);
    }

    /// Deregister project `name` and stop its watch; false if it was not registered
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.inner.projects.lock().remove(name);
        match removed {
            Some(state) => {
                state.abort();
                info!(project = %name, "Removed discovery project");
                true
            }
            None => false,
        }
    }

    /// Stop every watch and close the registry
    pub fn stop(&self) {
        let drained: Vec<Arc<ProjectState>> = {
            let mut projects = self.inner.projects.lock();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            projects.drain().map(|(_, s)| s).collect()
        };
        for state in &drained {
            state.abort();
        }
        self.inner.registry.close();
        info!(projects = drained.len(), "Endpoint discovery stopped");
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.projects.lock().contains_key(name)
    }

    /// Status of every registered project, sorted by name
    pub fn projects(&self) -> Vec<ProjectStatus> {
        let states: Vec<Arc<ProjectState>> = self.inner.projects.lock().values().cloned().collect();
        let mut statuses: Vec<ProjectStatus> = states.iter().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

impl Drop for EndpointDiscover {
    fn drop(&mut self) {
        for state in self.inner.projects.lock().values() {
            state.abort();
        }
    }
}

async fn run_watch(inner: Arc<Inner>, state: Arc<ProjectState>) {
    loop {
        let watcher: Arc<dyn Watcher> = state.clone();
        match inner.registry.watch(&state.name, watcher).await {
            Ok(()) => {
                info!(project = %state.name, "Discovery watch ended");
                return;
            }
            Err(e) => {
                state.error(&e);
                let attempt = state.failures.fetch_add(1, Ordering::Relaxed) + 1;

                if attempt > inner.config.max_retries {
                    error!(
                        project = %state.name,
                        attempts = attempt,
                        error = %e,
                        "Discovery watch keeps failing, deregistering project"
                    );
                    inner.deregister(&state);
                    return;
                }

                let delay = inner.config.backoff.duration(attempt - 1);
                warn!(
                    project = %state.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Discovery watch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
