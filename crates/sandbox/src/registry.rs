//! Process-wide registry of pending sandbox teardowns

use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// A zero-argument teardown. The registry runs each one at most once.
pub type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

static GLOBAL: Lazy<CleanupRegistry> = Lazy::new(CleanupRegistry::new);

tokio::task_local! {
    static SCOPED: CleanupRegistry;
}

/// Ordered map from sandbox id to its teardown.
///
/// Clones share the same entries. The lock is never held across an await,
/// so a teardown may itself call [`CleanupRegistry::unregister`].
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    entries: Arc<Mutex<Vec<(String, TeardownFn)>>>,
}

impl CleanupRegistry {
    /// A private registry, for fixtures that prefer an explicit context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static CleanupRegistry {
        &GLOBAL
    }

    /// The registry of the enclosing [`CleanupRegistry::scope`], or the
    /// process-wide one outside any scope.
    pub fn current() -> CleanupRegistry {
        SCOPED
            .try_with(CleanupRegistry::clone)
            .unwrap_or_else(|_| GLOBAL.clone())
    }

    /// Run `body` with `self` as [`CleanupRegistry::current`].
    ///
    /// The scope follows the future, not the thread, so tasks spawned from
    /// `body` fall back to the process-wide registry.
    pub async fn scope<F: Future>(&self, body: F) -> F::Output {
        SCOPED.scope(self.clone(), body).await
    }

    /// Register a teardown for `id`.
    ///
    /// An existing entry for the same id is replaced in place and its action
    /// dropped without running.
    pub fn register<F, Fut>(&self, id: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let teardown: TeardownFn = Box::new(move || action().boxed());
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => {
                debug!(session = %id, "Replacing registered teardown");
                slot.1 = teardown;
            }
            None => entries.push((id, teardown)),
        }
    }

    /// Remove the entry for `id` without running it. Returns whether one existed.
    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| existing != id);
        entries.len() != before
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().iter().any(|(existing, _)| existing == id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run every pending teardown in registration order, one at a time.
    ///
    /// Each entry is taken out of the map before it runs, so entries removed
    /// concurrently are simply skipped.
    pub async fn drain_all(&self) {
        loop {
            let next = {
                let mut entries = self.entries.lock();
                if entries.is_empty() {
                    None
                } else {
                    Some(entries.remove(0))
                }
            };
            let Some((id, action)) = next else { break };
            debug!(session = %id, "Running registered teardown");
            action().await;
        }
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.entries.lock().iter().map(|(id, _)| id.clone()).collect();
        f.debug_struct("CleanupRegistry").field("entries", &ids).finish()
    }
}
