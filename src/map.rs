//! Segmented concurrent hash map with lock-free retrieval.
//!
//! The table is sharded into independently locked segments; a supplemental
//! bit-spreading hash picks the segment from its top bits and the bin from
//! its low bits. Entry chains are immutable once published: `next` pointers
//! never change, writers prepend new entries, and removal rebuilds only the
//! prefix in front of the removed node. That immutability is what lets
//! readers walk a chain without taking the segment lock.
//!
//! Values (and keys) are stored behind `Arc`, so reads hand back shared
//! handles rather than holding a lock across the caller's use of the value.
//! A segment's `count` is written with release ordering after every
//! structural change and read with acquire ordering first on every lookup;
//! that pairing is the fence readers rely on.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_utils::{Backoff, CachePadded};

use crate::lock::ReentrantLock;

const DEFAULT_INITIAL_CAPACITY: usize = 16;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;
const DEFAULT_CONCURRENCY: usize = 16;
const MAXIMUM_CAPACITY: usize = 1 << 30;
const MAX_SEGMENTS: usize = 1 << 16;
/// Optimistic passes for the bulk reads before locking every segment.
const RETRIES_BEFORE_LOCK: usize = 2;

/// Wang/Jenkins-style bit spreader applied to every key hash, defending the
/// power-of-two masks against hashes that only differ in high bits.
fn spread(mut h: u32) -> u32 {
    h = h.wrapping_add((h << 15) ^ 0xffff_cbd5);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

struct Entry<K, V> {
    hash: u32,
    key: Arc<K>,
    /// Readers observe value updates through this cell without the lock.
    value: ArcSwapOption<V>,
    /// Immutable after publication.
    next: Option<Arc<Entry<K, V>>>,
}

type Bin<K, V> = ArcSwapOption<Entry<K, V>>;
type Table<K, V> = Vec<Bin<K, V>>;

struct Segment<K, V> {
    lock: ReentrantLock,
    count: CachePadded<AtomicUsize>,
    mod_count: AtomicUsize,
    threshold: AtomicUsize,
    table: ArcSwap<Table<K, V>>,
    load_factor: f32,
}

impl<K, V> Segment<K, V> {
    fn new(capacity: usize, load_factor: f32) -> Self {
        let table: Table<K, V> = (0..capacity).map(|_| ArcSwapOption::empty()).collect();
        Segment {
            lock: ReentrantLock::new(),
            count: CachePadded::new(AtomicUsize::new(0)),
            mod_count: AtomicUsize::new(0),
            threshold: AtomicUsize::new((capacity as f32 * load_factor) as usize),
            table: ArcSwap::from_pointee(table),
            load_factor,
        }
    }

    /// Take the segment lock, spinning briefly before parking.
    fn lock_for_write(&self) {
        let backoff = Backoff::new();
        while !self.lock.try_lock() {
            if backoff.is_completed() {
                self.lock.lock();
                return;
            }
            backoff.snooze();
        }
    }

    fn unlock(&self) {
        let released = self.lock.unlock();
        debug_assert!(released.is_ok());
    }
}

impl<K: Eq, V> Segment<K, V> {
    fn get(&self, key: &K, hash: u32) -> Option<Arc<V>> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let table = self.table.load_full();
        let mut e = table[hash as usize & (table.len() - 1)].load_full();
        while let Some(entry) = e {
            if entry.hash == hash && *entry.key == *key {
                return match entry.value.load_full() {
                    Some(v) => Some(v),
                    // Caught a writer mid-publication; settle under the lock.
                    None => self.read_value_under_lock(&entry),
                };
            }
            e = entry.next.clone();
        }
        None
    }

    fn read_value_under_lock(&self, entry: &Arc<Entry<K, V>>) -> Option<Arc<V>> {
        self.lock.lock();
        let value = entry.value.load_full();
        self.unlock();
        value
    }

    fn contains_key(&self, key: &K, hash: u32) -> bool {
        if self.count.load(Ordering::Acquire) == 0 {
            return false;
        }
        let table = self.table.load_full();
        let mut e = table[hash as usize & (table.len() - 1)].load_full();
        while let Some(entry) = e {
            if entry.hash == hash && *entry.key == *key {
                return true;
            }
            e = entry.next.clone();
        }
        false
    }

    fn put(&self, key: Arc<K>, hash: u32, value: Arc<V>, only_if_absent: bool) -> Option<Arc<V>> {
        self.lock_for_write();
        let result = (|| {
            let c = self.count.load(Ordering::Relaxed) + 1;
            if c > self.threshold.load(Ordering::Relaxed) {
                self.rehash();
            }
            let table = self.table.load_full();
            let bin = &table[hash as usize & (table.len() - 1)];
            let first = bin.load_full();

            let mut e = first.clone();
            while let Some(entry) = e {
                if entry.hash == hash && *entry.key == *key {
                    let old = entry.value.load_full();
                    if !only_if_absent {
                        entry.value.store(Some(value));
                    }
                    return old;
                }
                e = entry.next.clone();
            }

            self.mod_count.fetch_add(1, Ordering::Relaxed);
            let entry = Arc::new(Entry {
                hash,
                key,
                value: ArcSwapOption::from(Some(value)),
                next: first,
            });
            bin.store(Some(entry));
            self.count.store(c, Ordering::Release);
            None
        })();
        self.unlock();
        result
    }

    fn replace(&self, key: &K, hash: u32, value: Arc<V>) -> Option<Arc<V>> {
        self.lock_for_write();
        let result = match self.find_locked(key, hash) {
            Some(entry) => {
                let old = entry.value.load_full();
                entry.value.store(Some(value));
                old
            }
            None => None,
        };
        self.unlock();
        result
    }

    /// Entry lookup while the lock is held.
    fn find_locked(&self, key: &K, hash: u32) -> Option<Arc<Entry<K, V>>> {
        let table = self.table.load_full();
        let mut e = table[hash as usize & (table.len() - 1)].load_full();
        while let Some(entry) = e {
            if entry.hash == hash && *entry.key == *key {
                return Some(entry);
            }
            e = entry.next.clone();
        }
        None
    }

    fn remove_matching(
        &self,
        key: &K,
        hash: u32,
        matches: impl Fn(&V) -> bool,
    ) -> Option<Arc<V>> {
        self.lock_for_write();
        let result = (|| {
            let c = self.count.load(Ordering::Relaxed);
            let table = self.table.load_full();
            let bin = &table[hash as usize & (table.len() - 1)];
            let first = bin.load_full();

            let mut e = first.clone();
            let target = loop {
                match e {
                    None => return None,
                    Some(entry) => {
                        if entry.hash == hash && *entry.key == *key {
                            break entry;
                        }
                        e = entry.next.clone();
                    }
                }
            };
            let old = target.value.load_full();
            if !old.as_ref().map_or(false, |v| matches(v)) {
                return None;
            }

            // The suffix after the removed entry is reused as-is; entries in
            // front of it are cloned because their `next` may not change.
            self.mod_count.fetch_add(1, Ordering::Relaxed);
            let mut new_first = target.next.clone();
            let mut p = first;
            while let Some(entry) = p {
                if Arc::ptr_eq(&entry, &target) {
                    break;
                }
                new_first = Some(Arc::new(Entry {
                    hash: entry.hash,
                    key: entry.key.clone(),
                    value: ArcSwapOption::from(entry.value.load_full()),
                    next: new_first,
                }));
                p = entry.next.clone();
            }
            bin.store(new_first);
            self.count.store(c - 1, Ordering::Release);
            old
        })();
        self.unlock();
        result
    }

    /// Double the table, moving the longest trailing run of each chain as a
    /// unit and cloning only the prefix whose bin changes. Lock held.
    fn rehash(&self) {
        let old_table = self.table.load_full();
        let old_capacity = old_table.len();
        if old_capacity >= MAXIMUM_CAPACITY {
            return;
        }
        let new_capacity = old_capacity << 1;
        self.threshold.store(
            (new_capacity as f32 * self.load_factor) as usize,
            Ordering::Relaxed,
        );
        let mask = new_capacity - 1;
        let new_table: Table<K, V> = (0..new_capacity).map(|_| ArcSwapOption::empty()).collect();

        for old_bin in old_table.iter() {
            let head = match old_bin.load_full() {
                Some(e) => e,
                None => continue,
            };
            if head.next.is_none() {
                new_table[head.hash as usize & mask].store(Some(head));
                continue;
            }

            let mut last_run = head.clone();
            let mut last_idx = head.hash as usize & mask;
            let mut p = head.next.clone();
            while let Some(entry) = p {
                let idx = entry.hash as usize & mask;
                if idx != last_idx {
                    last_idx = idx;
                    last_run = entry.clone();
                }
                p = entry.next.clone();
            }
            new_table[last_idx].store(Some(last_run.clone()));

            let mut p = Some(head);
            while let Some(entry) = p {
                if Arc::ptr_eq(&entry, &last_run) {
                    break;
                }
                let idx = entry.hash as usize & mask;
                let bin_head = new_table[idx].load_full();
                new_table[idx].store(Some(Arc::new(Entry {
                    hash: entry.hash,
                    key: entry.key.clone(),
                    value: ArcSwapOption::from(entry.value.load_full()),
                    next: bin_head,
                })));
                p = entry.next.clone();
            }
        }
        self.table.store(Arc::new(new_table));
    }

    fn clear(&self) {
        if self.count.load(Ordering::Relaxed) == 0 {
            return;
        }
        self.lock_for_write();
        let table = self.table.load_full();
        for bin in table.iter() {
            bin.store(None);
        }
        self.mod_count.fetch_add(1, Ordering::Relaxed);
        self.count.store(0, Ordering::Release);
        self.unlock();
    }
}

impl<K: Eq, V: PartialEq> Segment<K, V> {
    fn contains_value(&self, value: &V) -> bool {
        if self.count.load(Ordering::Acquire) == 0 {
            return false;
        }
        let table = self.table.load_full();
        for bin in table.iter() {
            let mut e = bin.load_full();
            while let Some(entry) = e {
                if entry.value.load_full().as_deref() == Some(value) {
                    return true;
                }
                e = entry.next.clone();
            }
        }
        false
    }
}

/// A concurrent hash map sharded into independently locked segments, with
/// retrieval that never blocks.
///
/// Reads return `Arc` handles to the stored values. Iterators are weakly
/// consistent: they never fail, never yield an element twice, and reflect
/// concurrent updates only opportunistically.
///
/// # Panics
///
/// Constructors panic on a non-positive or non-finite load factor and on a
/// concurrency level of zero.
pub struct SegmentedHashMap<K, V, S = RandomState> {
    segments: Box<[Segment<K, V>]>,
    segment_shift: u32,
    segment_mask: usize,
    hasher: S,
}

impl<K, V> SegmentedHashMap<K, V, RandomState> {
    /// Create a map with default capacity 16, load factor 0.75, and
    /// concurrency level 16.
    pub fn new() -> Self {
        Self::with_capacity_and_concurrency(
            DEFAULT_INITIAL_CAPACITY,
            DEFAULT_LOAD_FACTOR,
            DEFAULT_CONCURRENCY,
        )
    }

    /// Create a map sized for `capacity` elements before any resize.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_concurrency(capacity, DEFAULT_LOAD_FACTOR, DEFAULT_CONCURRENCY)
    }

    /// Create a map with explicit sizing: `concurrency` bounds the number
    /// of simultaneously updating threads and fixes the segment count.
    pub fn with_capacity_and_concurrency(
        capacity: usize,
        load_factor: f32,
        concurrency: usize,
    ) -> Self {
        Self::with_capacity_concurrency_and_hasher(
            capacity,
            load_factor,
            concurrency,
            RandomState::new(),
        )
    }
}

impl<K, V, S> SegmentedHashMap<K, V, S> {
    /// Create a default-sized map that hashes with `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_concurrency_and_hasher(
            DEFAULT_INITIAL_CAPACITY,
            DEFAULT_LOAD_FACTOR,
            DEFAULT_CONCURRENCY,
            hasher,
        )
    }

    /// Fully parameterised constructor.
    pub fn with_capacity_concurrency_and_hasher(
        capacity: usize,
        load_factor: f32,
        concurrency: usize,
        hasher: S,
    ) -> Self {
        assert!(
            load_factor > 0.0 && load_factor.is_finite(),
            "load factor must be positive and finite"
        );
        assert!(concurrency > 0, "concurrency level must be positive");

        let concurrency = concurrency.min(MAX_SEGMENTS);
        let mut sshift = 0u32;
        let mut ssize = 1usize;
        while ssize < concurrency {
            sshift += 1;
            ssize <<= 1;
        }

        let capacity = capacity.min(MAXIMUM_CAPACITY);
        let mut per_segment = capacity / ssize;
        if per_segment * ssize < capacity {
            per_segment += 1;
        }
        let mut segment_capacity = 1usize;
        while segment_capacity < per_segment {
            segment_capacity <<= 1;
        }

        SegmentedHashMap {
            segments: (0..ssize)
                .map(|_| Segment::new(segment_capacity, load_factor))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            segment_shift: 32 - sshift,
            segment_mask: ssize - 1,
            hasher,
        }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> SegmentedHashMap<K, V, S> {
    fn hash_key(&self, key: &K) -> u32 {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        spread(hasher.finish() as u32)
    }

    fn segment_for(&self, hash: u32) -> &Segment<K, V> {
        &self.segments[((hash as u64) >> self.segment_shift) as usize & self.segment_mask]
    }

    /// The value mapped to `key`, if present. Never blocks against writers.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.hash_key(key);
        self.segment_for(hash).get(key, hash)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.hash_key(key);
        self.segment_for(hash).contains_key(key, hash)
    }

    /// Map `key` to `value`, returning the previous value if any.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        self.put_arc(Arc::new(key), Arc::new(value), false)
    }

    /// Map `key` to `value` only if absent; returns the incumbent value
    /// when one exists.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        self.put_arc(Arc::new(key), Arc::new(value), true)
    }

    pub(crate) fn put_arc(
        &self,
        key: Arc<K>,
        value: Arc<V>,
        only_if_absent: bool,
    ) -> Option<Arc<V>> {
        let hash = self.hash_key(&key);
        self.segment_for(hash).put(key, hash, value, only_if_absent)
    }

    /// Replace the value for `key` only if some mapping exists. Returns the
    /// previous value.
    pub fn replace(&self, key: &K, value: V) -> Option<Arc<V>> {
        let hash = self.hash_key(key);
        self.segment_for(hash).replace(key, hash, Arc::new(value))
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.hash_key(key);
        self.segment_for(hash).remove_matching(key, hash, |_| true)
    }

    /// Insert every pair from `iter`.
    pub fn put_all<I: IntoIterator<Item = (K, V)>>(&self, iter: I) {
        for (k, v) in iter {
            self.put(k, v);
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Number of entries. Tries a lock-free double pass first; if writers
    /// keep moving, locks every segment in index order and releases them in
    /// reverse.
    pub fn len(&self) -> usize {
        for _ in 0..=RETRIES_BEFORE_LOCK {
            let mut sum = 0usize;
            let mut mods = Vec::with_capacity(self.segments.len());
            let mut mod_sum = 0usize;
            for segment in self.segments.iter() {
                sum += segment.count.load(Ordering::Acquire);
                let mc = segment.mod_count.load(Ordering::Relaxed);
                mod_sum = mod_sum.wrapping_add(mc);
                mods.push(mc);
            }
            if mod_sum != 0 {
                let mut check = 0usize;
                let mut clean = true;
                for (segment, mc) in self.segments.iter().zip(&mods) {
                    check += segment.count.load(Ordering::Acquire);
                    if segment.mod_count.load(Ordering::Relaxed) != *mc {
                        clean = false;
                        break;
                    }
                }
                if !clean || check != sum {
                    continue;
                }
            }
            return sum;
        }

        for segment in self.segments.iter() {
            segment.lock.lock();
        }
        let sum = self
            .segments
            .iter()
            .map(|s| s.count.load(Ordering::Relaxed))
            .sum();
        for segment in self.segments.iter().rev() {
            segment.unlock();
        }
        sum
    }

    /// Whether the map has no entries, without summing full counts.
    pub fn is_empty(&self) -> bool {
        let mut mods = Vec::with_capacity(self.segments.len());
        let mut mod_sum = 0usize;
        for segment in self.segments.iter() {
            if segment.count.load(Ordering::Acquire) != 0 {
                return false;
            }
            let mc = segment.mod_count.load(Ordering::Relaxed);
            mod_sum = mod_sum.wrapping_add(mc);
            mods.push(mc);
        }
        if mod_sum != 0 {
            for (segment, mc) in self.segments.iter().zip(&mods) {
                if segment.count.load(Ordering::Acquire) != 0
                    || segment.mod_count.load(Ordering::Relaxed) != *mc
                {
                    return false;
                }
            }
        }
        true
    }

    /// Weakly consistent iterator over the entries.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            map: self,
            segment_index: self.segments.len() as isize - 1,
            table: None,
            bin_index: -1,
            next_entry: None,
        }
    }

    /// Weakly consistent iterator over the keys.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { inner: self.iter() }
    }

    /// Weakly consistent iterator over the values.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { inner: self.iter() }
    }
}

impl<K: Hash + Eq, V: PartialEq, S: BuildHasher> SegmentedHashMap<K, V, S> {
    /// Replace the value for `key` only when it currently equals `old`.
    pub fn replace_if_equal(&self, key: &K, old: &V, new: V) -> bool {
        let hash = self.hash_key(key);
        let segment = self.segment_for(hash);
        segment.lock_for_write();
        let replaced = match segment.find_locked(key, hash) {
            Some(entry) => {
                let current = entry.value.load_full();
                if current.as_deref() == Some(old) {
                    entry.value.store(Some(Arc::new(new)));
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        segment.unlock();
        replaced
    }

    /// Remove `key` only when its value equals `value`.
    pub fn remove_if_equal(&self, key: &K, value: &V) -> bool {
        let hash = self.hash_key(key);
        self.segment_for(hash)
            .remove_matching(key, hash, |v| v == value)
            .is_some()
    }

    /// Whether any entry maps to `value`. Optimistic double pass with a
    /// lock-all fallback, like [`len`](Self::len).
    pub fn contains_value(&self, value: &V) -> bool {
        for _ in 0..=RETRIES_BEFORE_LOCK {
            let mut mods = Vec::with_capacity(self.segments.len());
            for segment in self.segments.iter() {
                mods.push(segment.mod_count.load(Ordering::Relaxed));
                if segment.contains_value(value) {
                    return true;
                }
            }
            let clean = self
                .segments
                .iter()
                .zip(&mods)
                .all(|(s, mc)| s.mod_count.load(Ordering::Relaxed) == *mc);
            if clean {
                return false;
            }
        }

        for segment in self.segments.iter() {
            segment.lock.lock();
        }
        let found = self.segments.iter().any(|s| s.contains_value(value));
        for segment in self.segments.iter().rev() {
            segment.unlock();
        }
        found
    }
}

impl<K, V> Default for SegmentedHashMap<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> Extend<(K, V)> for SegmentedHashMap<K, V, S> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.put_all(iter);
    }
}

impl<K: Hash + Eq, V, S: BuildHasher + Default> FromIterator<(K, V)>
    for SegmentedHashMap<K, V, S>
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::with_hasher(S::default());
        map.put_all(iter);
        map
    }
}

impl<K, V, S> fmt::Debug for SegmentedHashMap<K, V, S>
where
    K: Hash + Eq + fmt::Debug,
    V: fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|e| (e.key_arc().clone(), e.value_arc().clone())))
            .finish()
    }
}

/// One entry observed by a map iterator.
///
/// [`set_value`](EntryView::set_value) writes through to the map, like the
/// map's own `put` for this key.
pub struct EntryView<'a, K, V, S = RandomState> {
    map: &'a SegmentedHashMap<K, V, S>,
    key: Arc<K>,
    value: Arc<V>,
}

impl<K, V, S> EntryView<'_, K, V, S> {
    /// The entry's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The value observed when the iterator reached this entry.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Shared handle to the key.
    pub fn key_arc(&self) -> &Arc<K> {
        &self.key
    }

    /// Shared handle to the observed value.
    pub fn value_arc(&self) -> &Arc<V> {
        &self.value
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> EntryView<'_, K, V, S> {
    /// Write a new value for this entry's key into the underlying map,
    /// returning the previous value.
    pub fn set_value(&self, value: V) -> Option<Arc<V>> {
        self.map.put_arc(self.key.clone(), Arc::new(value), false)
    }
}

impl<K: fmt::Debug, V: fmt::Debug, S> fmt::Debug for EntryView<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryView")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}

/// Weakly consistent entry iterator. Walks segments from the last to the
/// first, snapshotting each segment's table on entry.
pub struct Iter<'a, K, V, S = RandomState> {
    map: &'a SegmentedHashMap<K, V, S>,
    segment_index: isize,
    table: Option<Arc<Table<K, V>>>,
    bin_index: isize,
    next_entry: Option<Arc<Entry<K, V>>>,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S> {
    type Item = EntryView<'a, K, V, S>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.next_entry.take() {
                self.next_entry = entry.next.clone();
                if let Some(value) = entry.value.load_full() {
                    return Some(EntryView {
                        map: self.map,
                        key: entry.key.clone(),
                        value,
                    });
                }
                continue;
            }

            if let Some(table) = &self.table {
                while self.bin_index >= 0 {
                    let bin = &table[self.bin_index as usize];
                    self.bin_index -= 1;
                    if let Some(head) = bin.load_full() {
                        self.next_entry = Some(head);
                        break;
                    }
                }
                if self.next_entry.is_some() {
                    continue;
                }
                self.table = None;
            }

            loop {
                if self.segment_index < 0 {
                    return None;
                }
                let segment = &self.map.segments[self.segment_index as usize];
                self.segment_index -= 1;
                if segment.count.load(Ordering::Acquire) != 0 {
                    let table = segment.table.load_full();
                    self.bin_index = table.len() as isize - 1;
                    self.table = Some(table);
                    break;
                }
            }
        }
    }
}

/// Weakly consistent key iterator.
pub struct Keys<'a, K, V, S = RandomState> {
    inner: Iter<'a, K, V, S>,
}

impl<K, V, S> Iterator for Keys<'_, K, V, S> {
    type Item = Arc<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|e| e.key.clone())
    }
}

/// Weakly consistent value iterator.
pub struct Values<'a, K, V, S = RandomState> {
    inner: Iter<'a, K, V, S>,
}

impl<K, V, S> Iterator for Values<'_, K, V, S> {
    type Item = Arc<V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|e| e.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use static_assertions::assert_impl_all;
    use std::collections::HashSet;
    use std::sync::Arc;

    assert_impl_all!(SegmentedHashMap<String, i32>: Send, Sync);

    #[test]
    fn test_alphabet_round_trip() {
        let map = SegmentedHashMap::with_capacity_and_concurrency(16, 0.75, 4);
        for (i, c) in ('a'..='z').enumerate() {
            map.put(c.to_string(), (i + 1) as i32);
        }
        assert_eq!(map.len(), 26);
        assert_eq!(map.get(&"m".to_string()).as_deref(), Some(&13));
        assert_eq!(map.remove(&"a".to_string()).as_deref(), Some(&1));
        assert!(!map.contains_key(&"a".to_string()));

        let keys: HashSet<String> = map.keys().map(|k| (*k).clone()).collect();
        assert_eq!(keys.len(), 25);
    }

    #[test]
    fn test_resize_growth() {
        let map = SegmentedHashMap::with_capacity_and_concurrency(2, 0.75, 1);
        for i in 0..100 {
            map.put(i, i * 10);
        }
        for i in 0..100 {
            assert_eq!(map.get(&i).as_deref(), Some(&(i * 10)));
        }
        assert_eq!(map.len(), 100);
        // 100 entries at load factor 0.75 need a table of at least 128 bins.
        assert_eq!(map.segments.len(), 1);
        assert!(map.segments[0].table.load_full().len() >= 128);
    }

    #[test]
    fn test_put_returns_previous() {
        let map = SegmentedHashMap::new();
        assert!(map.put("k", 1).is_none());
        assert_eq!(map.put("k", 2).as_deref(), Some(&1));
        assert_eq!(map.get(&"k").as_deref(), Some(&2));
    }

    #[test]
    fn test_put_if_absent_keeps_first() {
        let map = SegmentedHashMap::new();
        assert!(map.put_if_absent("k", 1).is_none());
        assert_eq!(map.put_if_absent("k", 2).as_deref(), Some(&1));
        assert_eq!(map.get(&"k").as_deref(), Some(&1));
    }

    #[test]
    fn test_remove_then_absent() {
        let map = SegmentedHashMap::new();
        map.put("k", 7);
        assert_eq!(map.remove(&"k").as_deref(), Some(&7));
        assert!(!map.contains_key(&"k"));
        assert!(map.remove(&"k").is_none());
    }

    #[test]
    fn test_conditional_replace_and_remove() {
        let map = SegmentedHashMap::new();
        map.put("k", 1);
        assert!(!map.replace_if_equal(&"k", &9, 2));
        assert!(map.replace_if_equal(&"k", &1, 2));
        assert_eq!(map.get(&"k").as_deref(), Some(&2));

        assert!(!map.remove_if_equal(&"k", &1));
        assert!(map.remove_if_equal(&"k", &2));
        assert!(map.is_empty());
    }

    #[test]
    fn test_replace_requires_presence() {
        let map = SegmentedHashMap::new();
        assert!(map.replace(&"missing", 1).is_none());
        assert!(!map.contains_key(&"missing"));
        map.put("k", 1);
        assert_eq!(map.replace(&"k", 2).as_deref(), Some(&1));
    }

    #[test]
    fn test_contains_value() {
        let map = SegmentedHashMap::new();
        map.put(1, "one");
        map.put(2, "two");
        assert!(map.contains_value(&"one"));
        assert!(!map.contains_value(&"three"));
    }

    #[test]
    fn test_clear() {
        let map = SegmentedHashMap::new();
        for i in 0..50 {
            map.put(i, i);
        }
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        assert!(map.get(&25).is_none());
    }

    #[test]
    fn test_iter_sees_all_entries() {
        let map = SegmentedHashMap::new();
        for i in 0..64 {
            map.put(i, i * 2);
        }
        let mut seen: Vec<i32> = map.keys().map(|k| *k).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
        for entry in map.iter() {
            assert_eq!(*entry.value(), entry.key() * 2);
        }
    }

    #[test]
    fn test_entry_set_value_writes_through() {
        let map = SegmentedHashMap::new();
        map.put("k", 1);
        let entry = map.iter().next().unwrap();
        assert_eq!(entry.set_value(5).as_deref(), Some(&1));
        assert_eq!(map.get(&"k").as_deref(), Some(&5));
    }

    #[test]
    fn test_from_iterator_and_extend() {
        let mut map: SegmentedHashMap<i32, i32> =
            (0..10).map(|i| (i, i)).collect();
        assert_eq!(map.len(), 10);
        map.extend((10..20).map(|i| (i, i)));
        assert_eq!(map.len(), 20);
    }

    #[test]
    fn test_concurrent_distinct_inserts() {
        let map = Arc::new(SegmentedHashMap::new());
        let mut handles = Vec::new();
        for t in 0..4i32 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    map.put(t * 1000 + i, i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 2000);
        for t in 0..4i32 {
            for i in 0..500 {
                assert_eq!(map.get(&(t * 1000 + i)).as_deref(), Some(&i));
            }
        }
    }

    #[test]
    fn test_concurrent_mixed_stress() {
        let map = Arc::new(SegmentedHashMap::with_capacity_and_concurrency(4, 0.75, 8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..2000 {
                    let key = rng.gen_range(0..128);
                    match rng.gen_range(0..3) {
                        0 => {
                            map.put(key, key * 2);
                        }
                        1 => {
                            if let Some(v) = map.get(&key) {
                                assert_eq!(*v, key * 2);
                            }
                        }
                        _ => {
                            map.remove(&key);
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Every surviving entry still maps to its invariant value.
        for entry in map.iter() {
            assert_eq!(*entry.value(), entry.key() * 2);
        }
    }

    #[test]
    #[should_panic(expected = "load factor")]
    fn test_bad_load_factor_panics() {
        let _ = SegmentedHashMap::<i32, i32>::with_capacity_and_concurrency(16, 0.0, 4);
    }

    #[test]
    #[should_panic(expected = "concurrency")]
    fn test_zero_concurrency_panics() {
        let _ = SegmentedHashMap::<i32, i32>::with_capacity_and_concurrency(16, 0.75, 0);
    }
}
