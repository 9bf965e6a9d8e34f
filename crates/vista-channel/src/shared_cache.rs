//! Pixmap cache shared by every display channel of one peer.
//!
//! The peer keeps a single pixmap cache that all of its display channels
//! (one per display adapter, each on its own worker thread) reference. The
//! server mirrors it once, under a mutex. Besides the LRU contents it keeps,
//! per display channel index, the serial of the last message that touched
//! the cache. Those serials let a channel tell the peer "wait until channel
//! N has processed message S" before it reuses a slot or a fresh generation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;

use crate::cache::BoundedCache;
use crate::migration::CacheSnapshot;

/// Display channels that can share one pixmap cache.
pub const MAX_CACHE_CLIENTS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct PixmapMeta {
    pub lossy: bool,
    /// Per channel index, serial of the last message referencing the item.
    pub sync: [u64; MAX_CACHE_CLIENTS],
}

/// Items evicted while building a message, to be invalidated on the peer
/// before that message is processed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeList {
    pub ids: Vec<u64>,
    /// Per channel index, the highest serial that referenced an evicted item.
    pub sync: [u64; MAX_CACHE_CLIENTS],
}

impl FreeList {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn push(&mut self, id: u64, meta: &PixmapMeta) {
        self.ids.push(id);
        for (slot, serial) in self.sync.iter_mut().zip(meta.sync) {
            *slot = (*slot).max(serial);
        }
    }

    /// Other channels the peer must wait for: (index, serial) pairs.
    pub fn wait_list(&self, own: usize) -> Vec<(usize, u64)> {
        self.sync
            .iter()
            .enumerate()
            .filter(|(i, serial)| *i != own && **serial != 0)
            .map(|(i, serial)| (i, *serial))
            .collect()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.sync = [0; MAX_CACHE_CLIENTS];
    }
}

/// Outcome of clearing the cache and starting a new generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReset {
    pub generation: u32,
    /// Other channel indices with their last serial, which the peer must
    /// reach before dropping its copy.
    pub wait: Vec<(usize, u64)>,
}

#[derive(Debug)]
struct PixmapState {
    items: BoundedCache<PixmapMeta>,
    sync: [u64; MAX_CACHE_CLIENTS],
    generation: u32,
    /// (channel index, serial) of the message that started this generation.
    initiator: (usize, u64),
}

#[derive(Debug)]
pub struct SharedPixmapCache {
    id: u8,
    state: Mutex<PixmapState>,
}

impl SharedPixmapCache {
    pub fn new(id: u8, size: i64) -> Self {
        Self {
            id,
            state: Mutex::new(PixmapState {
                items: BoundedCache::new(size),
                sync: [0; MAX_CACHE_CLIENTS],
                generation: 1,
                initiator: (0, 0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PixmapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn size(&self) -> i64 {
        self.lock().items.capacity()
    }

    pub fn available(&self) -> i64 {
        self.lock().items.available()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().items.contains(id)
    }

    pub fn generation(&self) -> u32 {
        self.lock().generation
    }

    pub fn initiator(&self) -> (usize, u64) {
        self.lock().initiator
    }

    /// Generation and its initiator, read under one lock.
    pub fn generation_point(&self) -> (u32, (usize, u64)) {
        let state = self.lock();
        (state.generation, state.initiator)
    }

    pub fn sync_serial(&self, client: usize) -> u64 {
        self.lock().sync.get(client).copied().unwrap_or(0)
    }

    pub fn sync_serials(&self) -> [u64; MAX_CACHE_CLIENTS] {
        self.lock().sync
    }

    /// Raise the per-channel serials to at least `sync`.
    pub fn merge_sync(&self, sync: &[u64; MAX_CACHE_CLIENTS]) {
        let mut state = self.lock();
        for (slot, serial) in state.sync.iter_mut().zip(sync) {
            *slot = (*slot).max(*serial);
        }
    }

    /// Mark a cached item as lossless once a lossless copy replaced it.
    pub fn set_lossy(&self, id: u64, lossy: bool) -> bool {
        let mut state = self.lock();
        match state.items.lookup(id) {
            Some(meta) => {
                meta.lossy = lossy;
                true
            }
            None => false,
        }
    }

    /// Look up `id` for channel `client` sending message `serial`. A hit
    /// records the serial on the item and for the channel and returns the
    /// item's lossy flag.
    pub fn hit(&self, client: usize, id: u64, serial: u64) -> Option<bool> {
        if client >= MAX_CACHE_CLIENTS {
            return None;
        }
        let mut state = self.lock();
        let meta = state.items.lookup(id)?;
        meta.sync[client] = serial;
        let lossy = meta.lossy;
        state.sync[client] = serial;
        Some(lossy)
    }

    /// Add `id` on behalf of channel `client`. Evicted items are appended to
    /// `free`. Fails if the item does not fit or the only victims left are
    /// referenced by this very message.
    pub fn add(
        &self,
        client: usize,
        id: u64,
        size: i64,
        lossy: bool,
        serial: u64,
        free: &mut FreeList,
    ) -> bool {
        if client >= MAX_CACHE_CLIENTS {
            return false;
        }
        let mut state = self.lock();
        // Already cached by a sibling: this message references it too.
        if let Some(existing) = state.items.lookup(id) {
            existing.sync[client] = serial;
            state.sync[client] = serial;
            return true;
        }
        let mut meta = PixmapMeta {
            lossy,
            ..PixmapMeta::default()
        };
        meta.sync[client] = serial;
        let added = state.items.add_guarded(
            id,
            size,
            meta,
            |victim| victim.sync[client] == serial,
            |evicted, victim| free.push(evicted, &victim),
        );
        if added {
            state.sync[client] = serial;
        }
        added
    }

    /// Drop everything and start a new generation on behalf of channel
    /// `client` sending message `serial`.
    pub fn clear_and_regenerate(&self, client: usize, serial: u64) -> GenerationReset {
        let mut state = self.lock();
        state.items.clear();
        state.generation = state.generation.wrapping_add(1);
        state.initiator = (client, serial);
        if let Some(slot) = state.sync.get_mut(client) {
            *slot = serial;
        }
        let wait = state
            .sync
            .iter()
            .enumerate()
            .filter(|(i, s)| *i != client && **s != 0)
            .map(|(i, s)| (i, *s))
            .collect();
        GenerationReset {
            generation: state.generation,
            wait,
        }
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.lock().items.snapshot()
    }

    /// Seed an empty cache from migrate data. A cache that other channels
    /// already populated is left alone.
    pub fn restore_if_empty(&self, snapshot: &CacheSnapshot) -> bool {
        let mut state = self.lock();
        if !state.items.is_empty() {
            return false;
        }
        state.items.restore(snapshot);
        true
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Live shared caches keyed by (connection id, cache id). Display channels
/// of the same peer resolve to the same instance; the last one to let go
/// frees it.
#[derive(Debug, Clone, Default)]
pub struct PixmapCacheRegistry {
    caches: Arc<DashMap<(u32, u8), Weak<SharedPixmapCache>>>,
}

impl PixmapCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, connection_id: u32, cache_id: u8, size: i64) -> Arc<SharedPixmapCache> {
        let mut slot = self.caches.entry((connection_id, cache_id)).or_default();
        if let Some(cache) = slot.upgrade() {
            return cache;
        }
        let cache = Arc::new(SharedPixmapCache::new(cache_id, size));
        *slot = Arc::downgrade(&cache);
        tracing::debug!(connection_id, cache_id, size, "pixmap cache created");
        cache
    }

    /// Forget entries whose cache has been dropped.
    pub fn prune(&self) {
        self.caches.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_a_cached_item_pins_it_for_the_new_message() {
        let cache = SharedPixmapCache::new(0, 20);
        let mut free = FreeList::default();
        assert!(cache.add(0, 11, 10, false, 5, &mut free));
        assert!(cache.add(1, 11, 10, false, 9, &mut free));
        assert_eq!(cache.sync_serial(1), 9);
        assert_eq!(cache.available(), 10);

        // Making room for 12 in the same message would evict 11.
        assert!(!cache.add(1, 12, 20, false, 9, &mut free));
        assert!(cache.contains(11));
        assert!(free.ids.is_empty());
    }

    #[test]
    fn hit_records_serial_for_item_and_channel() {
        let cache = SharedPixmapCache::new(0, 100);
        let mut free = FreeList::default();
        assert!(cache.add(0, 11, 10, false, 5, &mut free));
        assert_eq!(cache.hit(1, 11, 9), Some(false));
        assert_eq!(cache.sync_serial(1), 9);
        assert_eq!(cache.sync_serial(0), 5);
        assert_eq!(cache.hit(1, 12, 10), None);
    }

    #[test]
    fn eviction_fills_free_list_with_highest_serials() {
        let cache = SharedPixmapCache::new(0, 20);
        let mut free = FreeList::default();
        cache.add(0, 1, 10, false, 3, &mut free);
        cache.hit(2, 1, 7);
        cache.add(0, 2, 10, false, 4, &mut free);
        assert!(cache.add(0, 3, 10, false, 8, &mut free));
        assert_eq!(free.ids, vec![1]);
        assert_eq!(free.sync, [3, 0, 7, 0]);
        assert_eq!(free.wait_list(0), vec![(2, 7)]);
    }

    #[test]
    fn item_used_by_current_message_is_not_evicted() {
        let cache = SharedPixmapCache::new(0, 10);
        let mut free = FreeList::default();
        cache.add(1, 1, 10, false, 42, &mut free);
        assert!(!cache.add(1, 2, 10, false, 42, &mut free));
        assert!(free.is_empty());
        assert!(cache.contains(1));
        assert_eq!(cache.available(), 0);
    }

    #[test]
    fn regenerate_bumps_generation_and_lists_lagging_channels() {
        let cache = SharedPixmapCache::new(0, 100);
        let mut free = FreeList::default();
        cache.add(0, 1, 10, false, 3, &mut free);
        cache.hit(1, 1, 6);
        let before = cache.generation();

        let reset = cache.clear_and_regenerate(2, 9);
        assert_eq!(reset.generation, before + 1);
        assert_eq!(reset.wait, vec![(0, 3), (1, 6)]);
        assert_eq!(cache.initiator(), (2, 9));
        assert!(!cache.contains(1));
        assert_eq!(cache.available(), 100);
    }

    #[test]
    fn merge_sync_only_raises() {
        let cache = SharedPixmapCache::new(0, 100);
        let mut free = FreeList::default();
        cache.add(1, 1, 10, true, 20, &mut free);
        cache.merge_sync(&[5, 10, 0, 3]);
        assert_eq!(cache.sync_serials(), [5, 20, 0, 3]);
        assert!(cache.set_lossy(1, false));
        assert_eq!(cache.hit(0, 1, 21), Some(false));
        assert!(!cache.set_lossy(2, false));
    }

    #[test]
    fn registry_shares_live_instances() {
        let registry = PixmapCacheRegistry::new();
        let a = registry.get_or_create(7, 0, 100);
        let b = registry.get_or_create(7, 0, 999);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.size(), 100);
        let other = registry.get_or_create(8, 0, 100);
        assert!(!Arc::ptr_eq(&a, &other));

        drop((a, b));
        registry.prune();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_hits_keep_budget_consistent() {
        let cache = Arc::new(SharedPixmapCache::new(0, 64));
        let handles: Vec<_> = (0..MAX_CACHE_CLIENTS)
            .map(|client| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let mut free = FreeList::default();
                    for i in 0..200u64 {
                        let id = i % 16;
                        if cache.hit(client, id, i + 1).is_none() {
                            cache.add(client, id, 8, false, i + 1, &mut free);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snapshot = cache.snapshot();
        let used: i64 = snapshot.items.iter().map(|(_, s)| s).sum();
        assert_eq!(cache.available(), 64 - used);
        assert!(cache.available() >= 0);
    }
}
