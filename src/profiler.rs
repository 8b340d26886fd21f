use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::api;
use crate::config::ServerSettings;
use crate::error::Result;

/// The name and storage path describing one running profiler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerModel {
    pub name: String,
    pub path: String,
}

#[derive(Debug)]
struct HandleInner {
    model: ProfilerModel,
    url: String,
    settings: ServerSettings,
    cache: HandleCache,
    terminated: watch::Sender<bool>,
}

/// Client-side proxy for one running profiler.
///
/// Clones share the same underlying state; disposing any clone disposes
/// them all.
#[derive(Debug, Clone)]
pub struct ProfilerHandle {
    inner: Arc<HandleInner>,
}

impl ProfilerHandle {
    /// Wrap a server-reported model and register it in the cache
    pub(crate) fn new(
        settings: &ServerSettings,
        cache: &HandleCache,
        model: ProfilerModel,
    ) -> Self {
        let url = settings.viewer_url(&model.name);
        let (terminated, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(HandleInner {
                model,
                url,
                settings: settings.clone(),
                cache: cache.clone(),
                terminated,
            }),
        };
        cache.insert(&handle);
        handle
    }

    pub fn name(&self) -> &str {
        &self.inner.model.name
    }

    pub fn path(&self) -> &str {
        &self.inner.model.path
    }

    pub fn model(&self) -> &ProfilerModel {
        &self.inner.model
    }

    /// Viewer URL the host embeds for this profiler
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_disposed(&self) -> bool {
        *self.inner.terminated.borrow()
    }

    /// Resolves once the profiler terminates, immediately if it already has
    pub async fn terminated(&self) {
        let mut rx = self.inner.terminated.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Mark terminated and drop the cache entry; repeated calls are no-ops
    pub fn dispose(&self) {
        let was_disposed = self.inner.terminated.send_replace(true);
        if was_disposed {
            return;
        }
        self.inner.cache.remove(&self.inner.url);
    }

    /// Stop this profiler on the server
    pub async fn shutdown(&self) -> Result<()> {
        api::shutdown(&self.inner.settings, &self.inner.cache, self.name()).await
    }

    /// Whether two handles share the same underlying profiler state
    pub(crate) fn same(&self, other: &ProfilerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Weak registry of live handles keyed by viewer URL.
///
/// Holds weak references only, so it can prune handles but never extend
/// their lifetime.
#[derive(Debug, Clone, Default)]
pub struct HandleCache {
    entries: Arc<Mutex<HashMap<String, Weak<HandleInner>>>>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, handle: &ProfilerHandle) {
        let mut entries = self.lock();
        entries.insert(handle.url().to_string(), Arc::downgrade(&handle.inner));
    }

    fn remove(&self, url: &str) {
        let mut entries = self.lock();
        entries.remove(url);
    }

    /// Dispose the handle registered under this viewer URL, if any
    pub(crate) fn dispose_url(&self, url: &str) {
        // dispose re-enters the cache lock, so upgrade first and release
        let inner = {
            let entries = self.lock();
            entries.get(url).and_then(Weak::upgrade)
        };
        if let Some(inner) = inner {
            ProfilerHandle { inner }.dispose();
        }
    }

    /// Dispose every cached handle whose viewer URL is not in `live`
    pub(crate) fn retain_urls(&self, live: &HashSet<String>) {
        let stale: Vec<Arc<HandleInner>> = {
            let entries = self.lock();
            entries
                .iter()
                .filter(|(url, _)| !live.contains(*url))
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for inner in stale {
            ProfilerHandle { inner }.dispose();
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, url: &str) -> bool {
        self.lock().contains_key(url)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Weak<HandleInner>>> {
        self.entries.lock().unwrap_or_else(|err| err.into_inner())
    }
}
