//! C3: the client-side hash cache (§4.3). An LRU of `(file, chunk) -> digest`
//! entries, sharded into independently-locked buckets the way `fuser`
//! shards mutable session state behind `parking_lot::Mutex`/`RwLock` rather
//! than one global lock (`session.rs`'s `ActiveSession`).
//!
//! The manager is the only party allowed to invalidate an entry, and it
//! must do so *before* granting another client's conflicting WCOMMIT —
//! callers (C9's callback service) must call [`HashCache::invalidate`]
//! and only ack the manager's callback once it returns.

use std::collections::{hash_map::DefaultHasher, HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

use crate::wire::dataserver::Digest;

const DEFAULT_BUCKET_COUNT: usize = 64;
const DEFAULT_BUCKET_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    file_id: u64,
    chunk_index: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheEntry {
    pub digest: Digest,
    pub version: u64,
}

struct Bucket {
    map: HashMap<Key, CacheEntry>,
    order: VecDeque<Key>,
    capacity: usize,
}

impl Bucket {
    fn new(capacity: usize) -> Self {
        Bucket {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn touch(&mut self, key: Key) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key);
    }

    fn evict_if_needed(&mut self) {
        while self.map.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

pub struct HashCache {
    buckets: Vec<Mutex<Bucket>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_CAPACITY)
    }

    pub fn with_capacity(bucket_count: usize, bucket_capacity: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        HashCache {
            buckets: (0..bucket_count).map(|_| Mutex::new(Bucket::new(bucket_capacity))).collect(),
        }
    }

    fn bucket_for(&self, key: &Key) -> &Mutex<Bucket> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.buckets.len();
        &self.buckets[idx]
    }

    pub fn get(&self, file_id: u64, chunk_index: u64) -> Option<CacheEntry> {
        let key = Key { file_id, chunk_index };
        let mut bucket = self.bucket_for(&key).lock();
        let entry = bucket.map.get(&key).copied();
        if entry.is_some() {
            bucket.touch(key);
        }
        entry
    }

    /// Insert or refresh an entry, bumping its version past whatever was
    /// there before so a concurrent reader that cached the old version can
    /// detect it went stale.
    pub fn insert(&self, file_id: u64, chunk_index: u64, digest: Digest) -> u64 {
        let key = Key { file_id, chunk_index };
        let mut bucket = self.bucket_for(&key).lock();
        let version = bucket.map.get(&key).map_or(0, |e| e.version + 1);
        bucket.map.insert(key, CacheEntry { digest, version });
        bucket.touch(key);
        bucket.evict_if_needed();
        version
    }

    /// Remove a single chunk's entry. Returns true if an entry was present.
    pub fn invalidate(&self, file_id: u64, chunk_index: u64) -> bool {
        let key = Key { file_id, chunk_index };
        let mut bucket = self.bucket_for(&key).lock();
        let removed = bucket.map.remove(&key).is_some();
        if let Some(pos) = bucket.order.iter().position(|k| *k == key) {
            bucket.order.remove(pos);
        }
        removed
    }

    /// Remove every cached chunk belonging to a file (close, rename target
    /// overwrite, or a whole-file invalidation callback).
    pub fn invalidate_file(&self, file_id: u64) {
        for bucket_lock in &self.buckets {
            let mut bucket = bucket_lock.lock();
            bucket.map.retain(|k, _| k.file_id != file_id);
            bucket.order.retain(|k| k.file_id != file_id);
        }
    }

    /// Remove `nchunks` consecutive entries starting at `begin_chunk`, the
    /// batch counterpart to [`HashCache::invalidate`] used when a callback
    /// carries a whole range rather than a single chunk.
    pub fn invalidate_bitmap(&self, file_id: u64, begin_chunk: u64, nchunks: u64) {
        for i in begin_chunk..begin_chunk + nchunks {
            self.invalidate(file_id, i);
        }
    }

    /// Fetch up to `want` consecutive entries starting at `begin_chunk`,
    /// stopping at the first miss — a prefetch window can only be used
    /// contiguously from the front, so a gap partway through is as good as
    /// the end of what's cached.
    pub fn get_hashes(&self, file_id: u64, begin_chunk: u64, want: u64) -> Vec<CacheEntry> {
        let mut out = Vec::with_capacity(want as usize);
        for i in begin_chunk..begin_chunk + want {
            match self.get(file_id, i) {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        out
    }

    /// Insert a batch of digests for consecutive chunks starting at
    /// `begin_chunk`, as returned by a GETHASHES reply. A zero digest is
    /// the manager's "chunk never written" sentinel, not a real hash, so it
    /// is skipped rather than cached as if it were content.
    pub fn put_hashes(&self, file_id: u64, begin_chunk: u64, digests: &[Digest]) {
        for (i, digest) in digests.iter().enumerate() {
            if *digest == [0u8; crate::wire::dataserver::DIGEST_LEN] {
                continue;
            }
            self.insert(file_id, begin_chunk + i as u64, *digest);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time occupancy snapshot for diagnostics (§4.3).
    pub fn stats(&self) -> HashCacheStats {
        HashCacheStats {
            entries: self.len(),
            buckets: self.buckets.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCacheStats {
    pub entries: usize,
    pub buckets: usize,
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(b: u8) -> Digest {
        [b; 20]
    }

    #[test]
    fn insert_then_get() {
        let cache = HashCache::new();
        cache.insert(1, 0, digest(7));
        let entry = cache.get(1, 0).unwrap();
        assert_eq!(entry.digest, digest(7));
        assert_eq!(entry.version, 0);
    }

    #[test]
    fn reinsert_bumps_version() {
        let cache = HashCache::new();
        cache.insert(1, 0, digest(1));
        let v2 = cache.insert(1, 0, digest(2));
        assert_eq!(v2, 1);
        assert_eq!(cache.get(1, 0).unwrap().version, 1);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = HashCache::new();
        cache.insert(1, 0, digest(1));
        assert!(cache.invalidate(1, 0));
        assert!(cache.get(1, 0).is_none());
        assert!(!cache.invalidate(1, 0));
    }

    #[test]
    fn invalidate_file_clears_all_its_chunks_only() {
        let cache = HashCache::new();
        cache.insert(1, 0, digest(1));
        cache.insert(1, 1, digest(1));
        cache.insert(2, 0, digest(1));
        cache.invalidate_file(1);
        assert!(cache.get(1, 0).is_none());
        assert!(cache.get(1, 1).is_none());
        assert!(cache.get(2, 0).is_some());
    }

    #[test]
    fn eviction_respects_capacity() {
        let cache = HashCache::with_capacity(1, 2);
        cache.insert(1, 0, digest(1));
        cache.insert(1, 1, digest(1));
        cache.insert(1, 2, digest(1));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1, 0).is_none());
    }

    #[test]
    fn get_hashes_stops_at_first_miss() {
        let cache = HashCache::with_capacity(1, 64);
        cache.insert(1, 0, digest(1));
        cache.insert(1, 1, digest(2));
        // chunk 2 is absent, so a batch request for 5 only returns 2.
        let batch = cache.get_hashes(1, 0, 5);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].digest, digest(1));
        assert_eq!(batch[1].digest, digest(2));
    }

    #[test]
    fn put_hashes_skips_zero_sentinel() {
        let cache = HashCache::with_capacity(1, 64);
        let digests = vec![digest(1), [0u8; 20], digest(3)];
        cache.put_hashes(1, 10, &digests);
        assert!(cache.get(1, 10).is_some());
        assert!(cache.get(1, 11).is_none());
        assert!(cache.get(1, 12).is_some());
    }

    #[test]
    fn invalidate_bitmap_clears_a_range() {
        let cache = HashCache::with_capacity(1, 64);
        for i in 0..4 {
            cache.insert(1, i, digest(1));
        }
        cache.invalidate_bitmap(1, 1, 2);
        assert!(cache.get(1, 0).is_some());
        assert!(cache.get(1, 1).is_none());
        assert!(cache.get(1, 2).is_none());
        assert!(cache.get(1, 3).is_some());
    }

    #[test]
    fn stats_reports_entry_count() {
        let cache = HashCache::with_capacity(4, 64);
        cache.insert(1, 0, digest(1));
        cache.insert(1, 1, digest(1));
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.buckets, 4);
    }
}
