use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::api;
use crate::config::ServerSettings;
use crate::error::Result;
use crate::profiler::{HandleCache, ProfilerHandle, ProfilerModel};

/// How often the manager re-polls the server for running profilers
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Options for constructing a [`ProfilerManager`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub settings: ServerSettings,
    /// Poll interval for reconciling against the server
    pub refresh_interval: Duration,
    /// Host-shared visibility flag; polls are skipped while it is false
    pub visible: Option<Arc<AtomicBool>>,
}

impl ManagerOptions {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            visible: None,
        }
    }
}

#[derive(Debug)]
struct ManagerState {
    models: Arc<Vec<ProfilerModel>>,
    handles: Vec<ProfilerHandle>,
    disposed: bool,
}

/// Owns the authoritative list of running profilers for one client
/// session.
///
/// The list is reconciled against the server on a fixed interval; starts
/// and shutdowns issued through the manager update it immediately, and
/// subscribers are notified whenever it changes. Construction spawns the
/// polling task on the current Tokio runtime.
#[derive(Debug)]
pub struct ProfilerManager {
    settings: ServerSettings,
    cache: HandleCache,
    state: Arc<Mutex<ManagerState>>,
    // notifications are sent while the state lock is held so delivery
    // order matches snapshot order; broadcast::send never blocks
    changed: broadcast::Sender<Arc<Vec<ProfilerModel>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProfilerManager {
    /// Create a manager and trigger its initial refresh
    pub fn new(options: ManagerOptions) -> Self {
        let ManagerOptions {
            settings,
            refresh_interval,
            visible,
        } = options;
        let (changed, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(false);
        let manager = Self {
            settings,
            cache: HandleCache::new(),
            state: Arc::new(Mutex::new(ManagerState {
                models: Arc::new(Vec::new()),
                handles: Vec::new(),
                disposed: false,
            })),
            changed,
            ready_tx,
            ready_rx,
            poll_task: Mutex::new(None),
        };
        manager.spawn_poll_task(refresh_interval, visible);
        manager
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Latest model snapshot; later changes produce new snapshots and
    /// never mutate handed-out ones
    pub fn running(&self) -> Arc<Vec<ProfilerModel>> {
        lock_state(&self.state).models.clone()
    }

    /// Receiver for model list changes; drop it to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<ProfilerModel>>> {
        self.changed.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Resolves once the initial refresh has completed, success or not
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.state).disposed
    }

    /// Force one reconciliation pass against the server
    pub async fn refresh_running(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let result = refresh_pass(&self.settings, &self.cache, &self.state, &self.changed).await;
        self.ready_tx.send_replace(true);
        result
    }

    /// Start a new profiler bound to a storage path and track it
    pub async fn start_new(&self, path: &str) -> Result<ProfilerHandle> {
        let handle = api::start_new(&self.settings, &self.cache, path).await?;
        self.register_handle(&handle);
        Ok(handle)
    }

    /// Shut down a profiler by name.
    ///
    /// A name not in the current list is a no-op. The model is removed
    /// and subscribers notified before the server call completes; if that
    /// call fails, the next refresh restores the server's view.
    pub async fn shutdown(&self, name: &str) -> Result<()> {
        {
            let mut guard = lock_state(&self.state);
            if guard.disposed || !guard.models.iter().any(|m| m.name == name) {
                return Ok(());
            }
            let models: Vec<ProfilerModel> = guard
                .models
                .iter()
                .filter(|m| m.name != name)
                .cloned()
                .collect();
            let models = Arc::new(models);
            guard.models = models.clone();
            let _ = self.changed.send(models);
        }

        api::shutdown(&self.settings, &self.cache, name).await?;
        self.finish_shutdown(name);
        Ok(())
    }

    /// Shut down every profiler the manager knows about.
    ///
    /// The list is cleared optimistically and re-fetched once to pick up
    /// profilers started elsewhere. Every profiler from the original
    /// snapshot is then shut down concurrently; each shutdown runs to
    /// completion and the first error, if any, is returned.
    pub async fn shutdown_all(&self) -> Result<()> {
        let snapshot = {
            let mut guard = lock_state(&self.state);
            if guard.disposed {
                return Ok(());
            }
            let snapshot = guard.models.as_ref().clone();
            if !snapshot.is_empty() {
                let empty = Arc::new(Vec::new());
                guard.models = empty.clone();
                let _ = self.changed.send(empty);
            }
            snapshot
        };

        self.refresh_running().await?;

        let results = join_all(snapshot.iter().map(|model| self.shutdown_one(&model.name))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Stop polling and dispose every outstanding handle; repeated calls
    /// are no-ops. Settles the readiness latch so no ready() waiter is
    /// left hanging.
    pub fn dispose(&self) {
        let handles = {
            let mut guard = lock_state(&self.state);
            if guard.disposed {
                return;
            }
            guard.disposed = true;
            guard.models = Arc::new(Vec::new());
            self.ready_tx.send_replace(true);
            std::mem::take(&mut guard.handles)
        };
        if let Some(task) = self
            .poll_task
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            task.abort();
        }
        for handle in &handles {
            handle.dispose();
        }
    }

    async fn shutdown_one(&self, name: &str) -> Result<()> {
        api::shutdown(&self.settings, &self.cache, name).await?;
        self.finish_shutdown(name);
        Ok(())
    }

    /// Drop matching handles and the model entry after a confirmed
    /// server-side shutdown
    fn finish_shutdown(&self, name: &str) {
        let stale = {
            let mut guard = lock_state(&self.state);
            if guard.disposed {
                return;
            }
            let (keep, stale): (Vec<_>, Vec<_>) =
                guard.handles.drain(..).partition(|h| h.name() != name);
            guard.handles = keep;
            if guard.models.iter().any(|m| m.name == name) {
                let models: Vec<ProfilerModel> = guard
                    .models
                    .iter()
                    .filter(|m| m.name != name)
                    .cloned()
                    .collect();
                let models = Arc::new(models);
                guard.models = models.clone();
                let _ = self.changed.send(models);
            }
            stale
        };
        for handle in &stale {
            handle.dispose();
        }
    }

    fn register_handle(&self, handle: &ProfilerHandle) {
        {
            let mut guard = lock_state(&self.state);
            if guard.disposed {
                drop(guard);
                handle.dispose();
                return;
            }
            guard.handles.push(handle.clone());
            if !guard.models.iter().any(|m| m.name == handle.name()) {
                let mut models = guard.models.as_ref().clone();
                models.push(handle.model().clone());
                let models = Arc::new(models);
                guard.models = models.clone();
                let _ = self.changed.send(models);
            }
        }
        self.spawn_termination_listener(handle);
    }

    // Removes the model and handle when the handle is disposed by a path
    // that did not already do the bookkeeping, e.g. a prune inside
    // list_running.
    fn spawn_termination_listener(&self, handle: &ProfilerHandle) {
        let handle = handle.clone();
        let state = Arc::downgrade(&self.state);
        let changed = self.changed.clone();
        tokio::spawn(async move {
            handle.terminated().await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut guard = lock_state(&state);
            if guard.disposed {
                return;
            }
            guard.handles.retain(|h| !h.same(&handle));
            if guard.models.iter().any(|m| m.name == handle.name()) {
                let models: Vec<ProfilerModel> = guard
                    .models
                    .iter()
                    .filter(|m| m.name != handle.name())
                    .cloned()
                    .collect();
                let models = Arc::new(models);
                guard.models = models.clone();
                let _ = changed.send(models);
            }
        });
    }

    fn spawn_poll_task(&self, interval: Duration, visible: Option<Arc<AtomicBool>>) {
        let settings = self.settings.clone();
        let cache = self.cache.clone();
        let state = Arc::downgrade(&self.state);
        let changed = self.changed.clone();
        let ready = self.ready_tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately, giving the initial
            // refresh; visibility only gates the later ones
            let mut first = true;
            loop {
                ticker.tick().await;
                let hidden = visible
                    .as_ref()
                    .is_some_and(|flag| !flag.load(Ordering::Relaxed));
                if hidden && !first {
                    continue;
                }
                let Some(state) = state.upgrade() else {
                    break;
                };
                if let Err(err) = refresh_pass(&settings, &cache, &state, &changed).await {
                    tracing::warn!(error = %err, "failed to refresh running profilers");
                }
                if first {
                    ready.send_replace(true);
                    first = false;
                }
            }
        });
        *self
            .poll_task
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = Some(task);
    }
}

impl Drop for ProfilerManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// One reconciliation pass: fetch the server list and, when it differs
/// from the cached one, dispose handles whose names vanished and swap in
/// the fresh snapshot, notifying subscribers.
async fn refresh_pass(
    settings: &ServerSettings,
    cache: &HandleCache,
    state: &Arc<Mutex<ManagerState>>,
    changed: &broadcast::Sender<Arc<Vec<ProfilerModel>>>,
) -> Result<()> {
    let fresh = api::list_running(settings, cache).await?;

    let dropped = {
        let mut guard = lock_state(state);
        if guard.disposed {
            return Ok(());
        }
        if *guard.models == fresh {
            Vec::new()
        } else {
            let live: HashSet<String> = fresh.iter().map(|m| m.name.clone()).collect();
            let (keep, gone): (Vec<_>, Vec<_>) = guard
                .handles
                .drain(..)
                .partition(|h| live.contains(h.name()));
            guard.handles = keep;
            let models = Arc::new(fresh);
            guard.models = models.clone();
            tracing::debug!(count = models.len(), "running profilers changed");
            let _ = changed.send(models);
            gone
        }
    };
    for handle in &dropped {
        handle.dispose();
    }
    Ok(())
}

fn lock_state(state: &Mutex<ManagerState>) -> MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(|err| err.into_inner())
}
