//! Multi-device write-through cache keyed by `PageId` (spec.md §4.6).
//! Grounded directly on the teacher's `pagestore::page_cache::PageCache`
//! (`moka::sync::Cache`), generalized from a single `(PageId, Lsn) -> Page`
//! cache keyed by version to a multi-device, pin-aware, load-coalescing
//! cache keyed by `PageId` alone — `PageId`s here are immutable by
//! construction (a rewrite always bumps generation into a new id), so there
//! is no LSN dimension to key on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use llfs_common::PageId;
use moka::sync::Cache;
use tokio::sync::Notify;

use crate::error::PageError;

/// Configuration for a [`PageCache`] (spec.md §3: "created via a config
/// struct with fixed capacity").
#[derive(Debug, Clone, Copy)]
pub struct PageCacheConfig {
    /// Maximum number of unpinned `Ready` entries the LRU retains.
    pub max_entries: u64,
}

/// Observable state of one cache slot (spec.md §4.6). `Empty` is not
/// represented explicitly: an absent key behaves identically to `Empty`.
#[derive(Debug)]
pub enum PageSlot {
    Loading,
    Ready(Arc<Vec<u8>>),
    Failed(Arc<PageError>),
}

struct LoadState {
    notify: Notify,
    result: StdMutex<Option<Result<Arc<Vec<u8>>, Arc<PageError>>>>,
}

struct PinEntry {
    bytes: Arc<Vec<u8>>,
    count: usize,
}

struct Shared {
    ready: Cache<PageId, Arc<Vec<u8>>>,
    in_flight: StdMutex<HashMap<PageId, Arc<LoadState>>>,
    pinned: StdMutex<HashMap<PageId, PinEntry>>,
}

/// Write-through page cache (spec.md §4.6). Coherence relies on `PageId`
/// immutability: entries are never invalidated, only evicted (LRU, pinned
/// entries excluded) or replaced after a failed load is retried.
#[derive(Clone)]
pub struct PageCache(Arc<Shared>);

impl PageCache {
    pub fn new(config: PageCacheConfig) -> Self {
        PageCache(Arc::new(Shared {
            ready: Cache::new(config.max_entries),
            in_flight: StdMutex::new(HashMap::new()),
            pinned: StdMutex::new(HashMap::new()),
        }))
    }

    /// Current observable state for `page_id`, without triggering a load.
    pub fn peek(&self, page_id: PageId) -> Option<PageSlot> {
        if let Some(pin) = self.0.pinned.lock().unwrap().get(&page_id) {
            return Some(PageSlot::Ready(pin.bytes.clone()));
        }
        if let Some(bytes) = self.0.ready.get(&page_id) {
            return Some(PageSlot::Ready(bytes));
        }
        if self.0.in_flight.lock().unwrap().contains_key(&page_id) {
            return Some(PageSlot::Loading);
        }
        None
    }

    /// Return the cached bytes for `page_id`, or run `loader` to populate
    /// the cache. Concurrent callers for the same `page_id` coalesce on the
    /// in-flight load and all observe its single result (spec.md §4.6:
    /// "at-most-one concurrent load per id").
    pub async fn get_or_load<F>(&self, page_id: PageId, loader: F) -> Result<Arc<Vec<u8>>, PageError>
    where
        F: std::future::Future<Output = Result<Vec<u8>, PageError>>,
    {
        if let Some(pin) = self.0.pinned.lock().unwrap().get(&page_id) {
            return Ok(pin.bytes.clone());
        }
        if let Some(bytes) = self.0.ready.get(&page_id) {
            return Ok(bytes);
        }

        let (state, is_leader) = {
            let mut in_flight = self.0.in_flight.lock().unwrap();
            if let Some(existing) = in_flight.get(&page_id) {
                (existing.clone(), false)
            } else {
                let state = Arc::new(LoadState {
                    notify: Notify::new(),
                    result: StdMutex::new(None),
                });
                in_flight.insert(page_id, state.clone());
                (state, true)
            }
        };

        if is_leader {
            let outcome = loader.await.map(Arc::new).map_err(Arc::new);
            *state.result.lock().unwrap() = Some(outcome.clone());
            self.0.in_flight.lock().unwrap().remove(&page_id);
            state.notify.notify_waiters();
            if let Ok(bytes) = &outcome {
                self.0.ready.insert(page_id, bytes.clone());
            }
            outcome.map_err(|e| unwrap_or_clone_error(e))
        } else {
            loop {
                if let Some(result) = state.result.lock().unwrap().clone() {
                    return result.map_err(unwrap_or_clone_error);
                }
                state.notify.notified().await;
            }
        }
    }

    /// Pin `page_id` against eviction; the bytes must already be `Ready`
    /// (via [`Self::get_or_load`] or an earlier pin). Returns `None` if the
    /// page is not currently cached. Release happens on [`PagePin`] drop.
    pub fn pin(&self, page_id: PageId) -> Option<PagePin> {
        let bytes = {
            let mut pinned = self.0.pinned.lock().unwrap();
            if let Some(entry) = pinned.get_mut(&page_id) {
                entry.count += 1;
                return Some(PagePin {
                    shared: self.0.clone(),
                    page_id,
                    bytes: entry.bytes.clone(),
                });
            }
            self.0.ready.get(&page_id)?
        };
        self.0.ready.invalidate(&page_id);
        self.0
            .pinned
            .lock()
            .unwrap()
            .insert(page_id, PinEntry { bytes: bytes.clone(), count: 1 });
        Some(PagePin {
            shared: self.0.clone(),
            page_id,
            bytes,
        })
    }

    /// Seed the cache with already-known-good bytes and immediately pin
    /// them, e.g. for a page a [`crate::allocator::PageAllocator`] just
    /// confirmed but that a concurrent reader hasn't loaded yet.
    pub fn insert_and_pin(&self, page_id: PageId, bytes: Vec<u8>) -> PagePin {
        let bytes = Arc::new(bytes);
        let mut pinned = self.0.pinned.lock().unwrap();
        let entry = pinned.entry(page_id).or_insert_with(|| PinEntry { bytes: bytes.clone(), count: 0 });
        entry.count += 1;
        PagePin {
            shared: self.0.clone(),
            page_id,
            bytes: entry.bytes.clone(),
        }
    }

    /// Seed the cache with already-known-good bytes without pinning them,
    /// e.g. after a [`crate::recycler::PageRecycler`] or volume commit has
    /// just written a page a reader is likely to fetch next.
    pub fn seed(&self, page_id: PageId, bytes: Vec<u8>) {
        if self.0.pinned.lock().unwrap().contains_key(&page_id) {
            return;
        }
        self.0.ready.insert(page_id, Arc::new(bytes));
    }

    pub fn entry_count(&self) -> u64 {
        self.0.ready.entry_count()
    }

    pub fn pinned_count(&self) -> usize {
        self.0.pinned.lock().unwrap().len()
    }
}

fn unwrap_or_clone_error(e: Arc<PageError>) -> PageError {
    match Arc::try_unwrap(e) {
        Ok(inner) => inner,
        Err(shared) => PageError::Corruption(shared.to_string()),
    }
}

/// RAII guard pinning one `PageId` against eviction (spec.md §5: "Page
/// buffers in the cache are shared read-only by reference counting").
/// Un-pinning on drop returns the entry to the LRU pool once the last pin
/// is released, guaranteeing release on every exit path including
/// cancellation (spec.md §9).
pub struct PagePin {
    shared: Arc<Shared>,
    page_id: PageId,
    bytes: Arc<Vec<u8>>,
}

impl PagePin {
    pub fn bytes(&self) -> &Arc<Vec<u8>> {
        &self.bytes
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Drop for PagePin {
    fn drop(&mut self) {
        let mut pinned = self.shared.pinned.lock().unwrap();
        if let Some(entry) = pinned.get_mut(&self.page_id) {
            entry.count -= 1;
            if entry.count == 0 {
                let bytes = entry.bytes.clone();
                pinned.remove(&self.page_id);
                self.shared.ready.insert(self.page_id, bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> PageCache {
        PageCache::new(PageCacheConfig { max_entries: 100 })
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = cache();
        let id = PageId::new(0, 1, 1);
        assert!(cache.peek(id).is_none());

        let bytes = cache
            .get_or_load(id, async { Ok(b"hello".to_vec()) })
            .await
            .unwrap();
        assert_eq!(&**bytes, b"hello");
        assert!(matches!(cache.peek(id), Some(PageSlot::Ready(_))));
    }

    #[tokio::test]
    async fn concurrent_loads_coalesce() {
        let cache = cache();
        let id = PageId::new(0, 1, 1);
        let load_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let load_count = load_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(id, async move {
                        load_count.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(vec![42u8])
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(*h.await.unwrap(), vec![42u8]);
        }
        assert_eq!(load_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_not_cached_and_can_be_retried() {
        let cache = cache();
        let id = PageId::new(0, 2, 1);
        let err = cache
            .get_or_load::<_>(id, async { Err(PageError::NotFound(id)) })
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::NotFound(_)));
        assert!(cache.peek(id).is_none());

        let bytes = cache.get_or_load(id, async { Ok(vec![7u8]) }).await.unwrap();
        assert_eq!(*bytes, vec![7u8]);
    }

    #[tokio::test]
    async fn pinned_entries_survive_eviction_pressure() {
        let cache = PageCache::new(PageCacheConfig { max_entries: 1 });
        let a = PageId::new(0, 1, 1);
        let b = PageId::new(0, 2, 1);

        cache.get_or_load(a, async { Ok(vec![1u8]) }).await.unwrap();
        let pin = cache.pin(a).unwrap();
        assert_eq!(cache.pinned_count(), 1);

        cache.get_or_load(b, async { Ok(vec![2u8]) }).await.unwrap();
        cache.0.ready.run_pending_tasks();

        // a is pinned, so a fresh load still sees the pinned bytes rather
        // than re-running the loader.
        let bytes = cache
            .get_or_load(a, async { panic!("must not reload a pinned page") })
            .await
            .unwrap();
        assert_eq!(*bytes, vec![1u8]);

        drop(pin);
        assert_eq!(cache.pinned_count(), 0);
    }
}
