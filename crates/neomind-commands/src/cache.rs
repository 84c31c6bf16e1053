//! Keyed client cache.
//!
//! Maps a key to a lazily constructed, shareable client. At most one
//! construction runs per key: callers arriving while it is in flight await
//! the same shared result. A failed construction is evicted so the next
//! call starts over.
//!
//! Constructions run on their own task, so a caller that stops waiting
//! does not abort a construction other callers depend on.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, RouterError};

/// Identifies one construction attempt registered in the cache.
pub type EntryId = u64;

type SharedClient<C> = Shared<BoxFuture<'static, Result<C>>>;

struct CacheEntry<C> {
    id: EntryId,
    client: SharedClient<C>,
}

type Entries<C> = Arc<Mutex<HashMap<String, CacheEntry<C>>>>;

/// Cache of clients keyed by string.
pub struct ClientCache<C> {
    entries: Entries<C>,
    next_id: AtomicU64,
}

impl<C> ClientCache<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Get the client for `key`, constructing it if absent.
    ///
    /// `factory` is only invoked if no entry exists. It receives the id of the
    /// new entry, which can later be passed to [`ClientCache::remove_entry`].
    /// The factory runs while the cache is locked and must not call back into
    /// the cache; the future it returns may.
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> Result<C>
    where
        F: FnOnce(EntryId) -> Fut,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        let client = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) => {
                    tracing::trace!(key = %key, entry = entry.id, "reusing cached client");
                    entry.client.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let client = spawn_construction(&self.entries, key, id, factory(id));
                    entries.insert(
                        key.to_string(),
                        CacheEntry {
                            id,
                            client: client.clone(),
                        },
                    );
                    client
                }
            }
        };
        client.await
    }

    /// Get the client for `key` if its construction succeeded.
    pub fn get(&self, key: &str) -> Option<C> {
        let entries = self.entries.lock();
        entries.get(key)?.client.peek()?.as_ref().ok().cloned()
    }

    /// Check if an entry (completed or in flight) exists for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Unregister the entry for `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Unregister the entry for `key` only if it is the given attempt.
    pub fn remove_entry(&self, key: &str, id: EntryId) -> bool {
        remove_if_current(&self.entries, key, id)
    }

    /// Drop every entry.
    ///
    /// Constructions still in flight complete, but their results are not
    /// retained.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<C> Default for ClientCache<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn remove_if_current<C>(entries: &Entries<C>, key: &str, id: EntryId) -> bool {
    let mut entries = entries.lock();
    if entries.get(key).is_some_and(|entry| entry.id == id) {
        entries.remove(key);
        true
    } else {
        false
    }
}

fn spawn_construction<C, Fut>(
    entries: &Entries<C>,
    key: &str,
    id: EntryId,
    construction: Fut,
) -> SharedClient<C>
where
    C: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<C>> + Send + 'static,
{
    let task_entries = Arc::clone(entries);
    let task_key = key.to_string();
    let handle = tokio::spawn(async move {
        let result = construction.await;
        if result.is_err() && remove_if_current(&task_entries, &task_key, id) {
            tracing::trace!(key = %task_key, entry = id, "evicted failed client construction");
        }
        result
    });

    let entries = Arc::clone(entries);
    let key = key.to_string();
    async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                remove_if_current(&entries, &key, id);
                Err(RouterError::ConstructionFailed(format!(
                    "client construction task aborted: {}",
                    e
                )))
            }
        }
    }
    .boxed()
    .shared()
}
