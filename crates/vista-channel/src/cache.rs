//! Bounded content cache mirrored by the peer.
//!
//! The server tracks what the peer holds so it can send a short reference
//! instead of the content. Entries are kept in LRU order against a signed
//! byte budget: `available` is capacity minus the sizes of all entries.
//! Adding may push it negative, at which point least-recently-used entries
//! are evicted until it is back at or above zero. Each eviction is reported
//! so the caller can queue an invalidation for the peer.

use std::collections::HashMap;

use crate::migration::CacheSnapshot;

#[derive(Debug)]
struct Entry<V> {
    id: u64,
    size: i64,
    value: V,
    /// Towards most recently used.
    newer: Option<usize>,
    /// Towards least recently used.
    older: Option<usize>,
}

#[derive(Debug)]
pub struct BoundedCache<V = ()> {
    entries: Vec<Option<Entry<V>>>,
    free: Vec<usize>,
    index: HashMap<u64, usize>,
    mru: Option<usize>,
    lru: Option<usize>,
    capacity: i64,
    available: i64,
}

impl<V> BoundedCache<V> {
    pub fn new(capacity: i64) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            mru: None,
            lru: None,
            capacity,
            available: capacity,
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Membership test without touching recency.
    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Look up `id`, promoting it to most recently used on a hit.
    pub fn lookup(&mut self, id: u64) -> Option<&mut V> {
        let slot = *self.index.get(&id)?;
        self.detach(slot);
        self.attach_mru(slot);
        self.entries[slot].as_mut().map(|e| &mut e.value)
    }

    /// Insert `id` as most recently used, evicting from the LRU end until
    /// the budget balances. `on_evict` runs once per evicted entry.
    ///
    /// Returns false if even an empty cache cannot hold `size`; the budget
    /// is restored but entries evicted on the way stay evicted.
    pub fn add(&mut self, id: u64, size: i64, value: V, on_evict: impl FnMut(u64, V)) -> bool {
        self.add_guarded(id, size, value, |_| false, on_evict)
    }

    /// Like `add`, but stops and fails when the next eviction victim
    /// satisfies `pinned`.
    pub fn add_guarded(
        &mut self,
        id: u64,
        size: i64,
        value: V,
        pinned: impl Fn(&V) -> bool,
        mut on_evict: impl FnMut(u64, V),
    ) -> bool {
        if let Some(&slot) = self.index.get(&id) {
            self.detach(slot);
            self.attach_mru(slot);
            return true;
        }
        self.available -= size;
        while self.available < 0 {
            let victim = self
                .lru
                .filter(|&slot| !self.entries[slot].as_ref().is_some_and(|e| pinned(&e.value)));
            let Some(victim) = victim else {
                self.available += size;
                return false;
            };
            if let Some((evicted, value)) = self.remove_slot(victim) {
                on_evict(evicted, value);
            }
        }
        let slot = self.alloc(Entry {
            id,
            size,
            value,
            newer: None,
            older: None,
        });
        self.index.insert(id, slot);
        self.attach_mru(slot);
        true
    }

    /// Drop `id` without reporting it. Returns its value if present.
    pub fn remove(&mut self, id: u64) -> Option<V> {
        let slot = *self.index.get(&id)?;
        self.remove_slot(slot).map(|(_, v)| v)
    }

    /// Drop every entry, without invalidations, and adopt a new capacity.
    pub fn reset(&mut self, capacity: i64) {
        self.entries.clear();
        self.free.clear();
        self.index.clear();
        self.mru = None;
        self.lru = None;
        self.capacity = capacity;
        self.available = capacity;
    }

    pub fn clear(&mut self) {
        let capacity = self.capacity;
        self.reset(capacity);
    }

    /// Entries from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = (u64, i64, &V)> + '_ {
        let mut cursor = self.mru;
        std::iter::from_fn(move || {
            let slot = cursor?;
            let entry = self.entries[slot].as_ref()?;
            cursor = entry.older;
            Some((entry.id, entry.size, &entry.value))
        })
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            capacity: self.capacity,
            items: self.iter().map(|(id, size, _)| (id, size)).collect(),
        }
    }

    /// Replace the contents with `snapshot`, keeping its recency order.
    /// Entries that no longer fit are dropped silently.
    pub fn restore_with(&mut self, snapshot: &CacheSnapshot, mut value: impl FnMut(u64) -> V) {
        self.reset(snapshot.capacity);
        for &(id, size) in snapshot.items.iter().rev() {
            if size <= self.available {
                self.add(id, size, value(id), |_, _| {});
            }
        }
    }

    // ── List plumbing ────────────────────────────────────────────────────────

    fn alloc(&mut self, entry: Entry<V>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = Some(entry);
                slot
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        }
    }

    fn detach(&mut self, slot: usize) {
        let Some((newer, older)) = self.entries[slot].as_ref().map(|e| (e.newer, e.older)) else {
            return;
        };
        match newer {
            Some(n) => {
                if let Some(e) = self.entries[n].as_mut() {
                    e.older = older;
                }
            }
            None => self.mru = older,
        }
        match older {
            Some(o) => {
                if let Some(e) = self.entries[o].as_mut() {
                    e.newer = newer;
                }
            }
            None => self.lru = newer,
        }
        if let Some(e) = self.entries[slot].as_mut() {
            e.newer = None;
            e.older = None;
        }
    }

    fn attach_mru(&mut self, slot: usize) {
        let old_mru = self.mru;
        if let Some(e) = self.entries[slot].as_mut() {
            e.newer = None;
            e.older = old_mru;
        }
        if let Some(m) = old_mru {
            if let Some(e) = self.entries[m].as_mut() {
                e.newer = Some(slot);
            }
        }
        self.mru = Some(slot);
        if self.lru.is_none() {
            self.lru = Some(slot);
        }
    }

    fn remove_slot(&mut self, slot: usize) -> Option<(u64, V)> {
        self.detach(slot);
        let entry = self.entries[slot].take()?;
        self.free.push(slot);
        self.index.remove(&entry.id);
        self.available += entry.size;
        Some((entry.id, entry.value))
    }
}

impl<V: Default> BoundedCache<V> {
    pub fn restore(&mut self, snapshot: &CacheSnapshot) {
        self.restore_with(snapshot, |_| V::default());
    }
}
