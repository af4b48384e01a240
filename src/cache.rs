//! Sharded TTL+LRU cache mapping domain keys to IPv4 addresses.
//!
//! The cache is split into a power-of-two number of independent shards, each
//! guarded by its own mutex. A shard holds three structures that move as one
//! unit: the entry map, a recency list, and an index from key to list node.
//! Expiry is swept lazily at the top of every operation; capacity is enforced
//! by evicting the least recently used key, at most once per insertion.
//!
//! Keys are expected to be lowercased by the caller; the shard router hashes
//! whatever it is given.

use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHasher};

/// Total entries across all shards.
const DEFAULT_CAPACITY: usize = 8192;
/// Shard count; must stay a power of two so routing can mask.
const DEFAULT_SHARDS: usize = 16;

const NIL: usize = usize::MAX;

/// One cached resolution. `hits` is informational and plays no part in
/// eviction.
struct CacheEntry {
    ip: Ipv4Addr,
    expiry: Instant,
    hits: u64,
}

struct LruNode {
    key: String,
    prev: usize,
    next: usize,
}

/// Arena-backed doubly-linked recency list. Handles are indices into the
/// node pool and stay valid until the node is removed; freed slots are
/// recycled through a free list, so the pool never outgrows the shard cap.
struct LruList {
    nodes: Vec<LruNode>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl Default for LruList {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }
}

impl LruList {
    fn push_front(&mut self, key: String) -> usize {
        let handle = match self.free.pop() {
            Some(idx) => {
                let node = &mut self.nodes[idx];
                node.key = key;
                node.prev = NIL;
                node.next = self.head;
                idx
            }
            None => {
                self.nodes.push(LruNode {
                    key,
                    prev: NIL,
                    next: self.head,
                });
                self.nodes.len() - 1
            }
        };
        if self.head != NIL {
            self.nodes[self.head].prev = handle;
        }
        self.head = handle;
        if self.tail == NIL {
            self.tail = handle;
        }
        handle
    }

    fn unlink(&mut self, handle: usize) {
        let (prev, next) = {
            let node = &self.nodes[handle];
            (node.prev, node.next)
        };
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    /// Detach a node and recycle its slot, returning the key it held.
    fn remove(&mut self, handle: usize) -> String {
        self.unlink(handle);
        self.free.push(handle);
        std::mem::take(&mut self.nodes[handle].key)
    }

    fn move_to_front(&mut self, handle: usize) {
        if self.head == handle {
            return;
        }
        self.unlink(handle);
        let node = &mut self.nodes[handle];
        node.prev = NIL;
        node.next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = handle;
        }
        self.head = handle;
        if self.tail == NIL {
            self.tail = handle;
        }
    }

    /// Handle of the least recently used node.
    fn back(&self) -> Option<usize> {
        (self.tail != NIL).then_some(self.tail)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

#[derive(Default)]
struct ShardInner {
    entries: FxHashMap<String, CacheEntry>,
    lru: LruList,
    index: FxHashMap<String, usize>,
}

impl ShardInner {
    /// Drop every entry whose expiry has passed, keeping the three
    /// structures in step. Linear in shard size, which the cap keeps small.
    fn sweep(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove_key(&key);
        }
    }

    fn remove_key(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(handle) = self.index.remove(key) {
            self.lru.remove(handle);
        }
    }
}

#[derive(Default)]
struct Shard {
    inner: Mutex<ShardInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Aggregated counters across all shards. The snapshot walks shards one at a
/// time, so it is eventually consistent rather than atomic.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

pub struct DnsCache {
    shards: Vec<Shard>,
    mask: usize,
    max_per_shard: usize,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_SHARDS)
    }
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `num_shards` must be a power of two (config validation enforces this
    /// for the daemon); each shard caps at `total_capacity / num_shards`.
    pub fn with_capacity(total_capacity: usize, num_shards: usize) -> Self {
        debug_assert!(num_shards.is_power_of_two());
        let num_shards = num_shards.max(1);
        Self {
            shards: (0..num_shards).map(|_| Shard::default()).collect(),
            mask: num_shards - 1,
            max_per_shard: (total_capacity / num_shards).max(1),
        }
    }

    fn shard(&self, domain: &str) -> &Shard {
        let mut hasher = FxHasher::default();
        domain.hash(&mut hasher);
        &self.shards[hasher.finish() as usize & self.mask]
    }

    /// Look up a domain, returning its address if present and unexpired.
    /// A hit refreshes recency; any miss is counted.
    pub fn get(&self, domain: &str) -> Option<Ipv4Addr> {
        let shard = self.shard(domain);
        let mut guard = shard.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;
        let now = Instant::now();

        inner.sweep(now);

        if let Some(entry) = inner.entries.get_mut(domain) {
            if now < entry.expiry {
                entry.hits += 1;
                let ip = entry.ip;
                if let Some(&handle) = inner.index.get(domain) {
                    inner.lru.move_to_front(handle);
                }
                shard.hits.fetch_add(1, Ordering::Relaxed);
                return Some(ip);
            }
        }

        // Stale entry the sweep somehow skipped; unreachable today, but if
        // it ever fires the entry must not leak.
        if inner.entries.contains_key(domain) {
            inner.remove_key(domain);
        }

        shard.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or refresh a domain. A brand-new key on a full shard evicts
    /// the least recently used entry first; overwriting an existing key
    /// never evicts and never changes the shard's size.
    pub fn set(&self, domain: &str, ip: Ipv4Addr, ttl: Duration) {
        let shard = self.shard(domain);
        let mut guard = shard.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;
        let now = Instant::now();

        inner.sweep(now);

        let is_new = !inner.entries.contains_key(domain);
        if is_new && inner.entries.len() >= self.max_per_shard {
            // One insertion can overflow by at most one, so a single pop
            // restores the cap.
            if let Some(handle) = inner.lru.back() {
                let victim = inner.lru.remove(handle);
                inner.index.remove(&victim);
                inner.entries.remove(&victim);
                shard.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        inner.entries.insert(
            domain.to_owned(),
            CacheEntry {
                ip,
                expiry: now + ttl,
                hits: 0,
            },
        );

        match inner.index.get(domain).copied() {
            Some(handle) => inner.lru.move_to_front(handle),
            None => {
                let handle = inner.lru.push_front(domain.to_owned());
                inner.index.insert(domain.to_owned(), handle);
            }
        }
    }

    /// Sweep every shard once. `get`/`set` already sweep, so this exists for
    /// periodic maintenance, not correctness.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            shard
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sweep(now);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.shards {
            stats.hits += shard.hits.load(Ordering::Relaxed);
            stats.misses += shard.misses.load(Ordering::Relaxed);
            stats.evictions += shard.evictions.load(Ordering::Relaxed);
            stats.size += shard
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entries
                .len();
        }
        stats
    }
}
