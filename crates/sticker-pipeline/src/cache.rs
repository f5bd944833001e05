//! Content-keyed caches of masks and resampled masks.
//!
//! The caches are a performance shortcut only: every lookup may miss
//! and the pipeline recomputes. Each cache holds at most `capacity`
//! entries and evicts the first-inserted one when full.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use siphasher::sip::SipHasher13;

use crate::source::SourceMask;
use crate::types::Dimensions;

/// A 64-bit content fingerprint (SipHash-1-3 with fixed keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint `bytes`. The length is hashed too, so prefixes of
    /// each other do not collide trivially.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(bytes);
        hasher.write_u64(bytes.len() as u64);
        Self(hasher.finish())
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

struct Entries<K, V> {
    map: HashMap<K, Arc<V>>,
    /// Keys in first-insertion order.
    order: VecDeque<K>,
}

/// A fixed-capacity FIFO cache safe to share between threads.
///
/// Values are handed out as `Arc`s, so a hit never copies the value and
/// an eviction never invalidates a value a caller still holds.
pub struct BoundedCache<K, V> {
    capacity: usize,
    entries: Mutex<Entries<K, V>>,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    /// A cache holding at most `capacity` entries. `0` stores nothing.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().map.get(key).cloned()
    }

    /// Store `value` under `key` and return it shared.
    ///
    /// Re-inserting an existing key replaces the value but keeps its
    /// original eviction position.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        if self.capacity == 0 {
            return value;
        }
        let mut entries = self.entries.lock();
        if entries.map.insert(key.clone(), Arc::clone(&value)).is_none() {
            entries.order.push_back(key);
            while entries.order.len() > self.capacity {
                if let Some(oldest) = entries.order.pop_front() {
                    entries.map.remove(&oldest);
                }
            }
        }
        value
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.map.clear();
        entries.order.clear();
    }
}

impl<K, V> fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity)
            .field("len", &self.entries.lock().map.len())
            .finish()
    }
}

/// Key of a source mask: which image, which source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaskKey {
    pub image: Fingerprint,
    pub source: String,
}

/// Key of a mask resampled to the image resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResampleKey {
    pub image: Fingerprint,
    pub source: String,
    pub target: Dimensions,
}

/// The caches owned by a [`StickerPipeline`](crate::StickerPipeline).
#[derive(Debug)]
pub struct StickerCache {
    masks: BoundedCache<MaskKey, SourceMask>,
    resampled: BoundedCache<ResampleKey, Vec<f64>>,
}

impl StickerCache {
    /// Both caches get `capacity` entries each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            masks: BoundedCache::new(capacity),
            resampled: BoundedCache::new(capacity),
        }
    }

    #[must_use]
    pub const fn masks(&self) -> &BoundedCache<MaskKey, SourceMask> {
        &self.masks
    }

    #[must_use]
    pub const fn resampled(&self) -> &BoundedCache<ResampleKey, Vec<f64>> {
        &self.resampled
    }

    /// Total entries across both caches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len() + self.resampled.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.masks.clear();
        self.resampled.clear();
    }
}
