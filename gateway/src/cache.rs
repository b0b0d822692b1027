//! Response cache — TTL key-value store shared by all tool calls
//!
//! Entries live in an index arena threaded by a doubly linked list in
//! insertion order, so evicting the oldest entry when the key bound is hit
//! is O(1). Expiry is checked on every read; a periodic sweep removes
//! entries nobody asks for again.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Current number of stored keys (not cumulative)
    pub key_count: usize,
}

struct Slot<V> {
    key: String,
    value: V,
    inserted_at: Instant,
    /// `None` never expires
    ttl: Option<Duration>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .map(|ttl| now.duration_since(self.inserted_at) >= ttl)
            .unwrap_or(false)
    }
}

struct CacheInner<V> {
    index: HashMap<String, usize>,
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    /// Oldest inserted
    head: Option<usize>,
    /// Newest inserted
    tail: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> CacheInner<V> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Slot<V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn push_back(&mut self, slot: Slot<V>) {
        let key = slot.key.clone();
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        let old_tail = self.tail;
        if let Some(slot) = self.slot_mut(idx) {
            slot.prev = old_tail;
            slot.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(tail) = self.slot_mut(t) {
                    tail.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.index.insert(key, idx);
    }

    fn remove_at(&mut self, idx: usize) -> Option<Slot<V>> {
        let slot = self.slots.get_mut(idx)?.take()?;

        match slot.prev {
            Some(p) => {
                if let Some(prev) = self.slot_mut(p) {
                    prev.next = slot.next;
                }
            }
            None => self.head = slot.next,
        }
        match slot.next {
            Some(n) => {
                if let Some(next) = self.slot_mut(n) {
                    next.prev = slot.prev;
                }
            }
            None => self.tail = slot.prev,
        }

        self.index.remove(&slot.key);
        self.free.push(idx);
        Some(slot)
    }

    fn remove_key(&mut self, key: &str) -> Option<Slot<V>> {
        let idx = *self.index.get(key)?;
        self.remove_at(idx)
    }

    fn expired_indices(&self, now: Instant) -> Vec<usize> {
        let mut expired = Vec::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            match self.slots.get(idx).and_then(Option::as_ref) {
                Some(slot) => {
                    if slot.is_expired(now) {
                        expired.push(idx);
                    }
                    cursor = slot.next;
                }
                None => break,
            }
        }
        expired
    }
}

/// In-memory TTL cache with a maximum key count.
///
/// Cheap to share: wrap in an `Arc` and hand the same instance to every
/// service that needs it. All operations are synchronous.
pub struct Cache<V> {
    inner: Mutex<CacheInner<V>>,
    /// 0 means unbounded
    max_keys: usize,
}

impl<V: Clone> Cache<V> {
    pub fn new(max_keys: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::new()),
            max_keys,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        // Every mutation leaves the arena consistent before it can panic,
        // so a poisoned guard is still safe to use.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a key. Absent or expired keys count as a miss; an expired
    /// entry is dropped on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let now = Instant::now();

        let Some(&idx) = inner.index.get(key) else {
            inner.misses += 1;
            return None;
        };

        let expired = inner.slots[idx]
            .as_ref()
            .map(|slot| slot.is_expired(now))
            .unwrap_or(true);

        if expired {
            inner.remove_at(idx);
            inner.evictions += 1;
            inner.misses += 1;
            debug!(key, "cache entry expired on read");
            return None;
        }

        inner.hits += 1;
        inner.slots[idx].as_ref().map(|slot| slot.value.clone())
    }

    /// Store a value. `ttl_seconds == 0` stores it without expiry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl_seconds: u64) {
        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        self.set_with_ttl(key, value, ttl);
    }

    /// Store a value with an explicit TTL (`None` never expires).
    ///
    /// Replacing an existing key moves it to the newest position. Adding a
    /// new key to a full cache first evicts the oldest-inserted entry.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let mut inner = self.lock();

        if inner.remove_key(&key).is_none()
            && self.max_keys > 0
            && inner.index.len() >= self.max_keys
        {
            if let Some(oldest) = inner.head {
                if let Some(evicted) = inner.remove_at(oldest) {
                    inner.evictions += 1;
                    debug!(key = %evicted.key, "evicted oldest cache entry");
                }
            }
        }

        inner.push_back(Slot {
            key,
            value,
            inserted_at: Instant::now(),
            ttl,
            prev: None,
            next: None,
        });
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove_key(key).is_some()
    }

    /// Whether a live entry exists. Does not touch hit/miss counters.
    pub fn has(&self, key: &str) -> bool {
        let mut inner = self.lock();
        let Some(&idx) = inner.index.get(key) else {
            return false;
        };
        let expired = inner.slots[idx]
            .as_ref()
            .map(|slot| slot.is_expired(Instant::now()))
            .unwrap_or(true);
        if expired {
            inner.remove_at(idx);
            inner.evictions += 1;
        }
        !expired
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.index.clear();
        inner.slots.clear();
        inner.free.clear();
        inner.head = None;
        inner.tail = None;
    }

    pub fn metrics(&self) -> CacheMetrics {
        let inner = self.lock();
        CacheMetrics {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            key_count: inner.index.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        let expired = inner.expired_indices(Instant::now());
        for idx in &expired {
            inner.remove_at(*idx);
        }
        inner.evictions += expired.len() as u64;
        expired.len()
    }
}

impl<V: Clone + Send + 'static> Cache<V> {
    /// Run `purge_expired` every `period` until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "cache sweep removed expired entries");
                        }
                    }
                }
            }
        })
    }
}

/// Build a cache key from an operation name and its arguments.
///
/// Each argument is JSON-encoded, so strings keep their quotes and
/// separators inside them are escaped: `search:"react":25:0`.
pub fn create_key(operation: &str, args: &[serde_json::Value]) -> String {
    let mut key = String::from(operation);
    for arg in args {
        key.push(':');
        key.push_str(&arg.to_string());
    }
    key
}
