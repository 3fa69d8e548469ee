//! A small LRU of recently decrypted blobs.
//!
//! Tree walks hit the same handful of tree blobs over and over;
//! keeping them decrypted saves a backend round trip and a MAC check.
//! Bounded by entry count, guarded by a plain mutex.

use std::collections::VecDeque;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::counters;
use crate::hashing::ObjectId;
use crate::pack::BlobType;

type Key = (ObjectId, BlobType);

struct Inner {
    map: FxHashMap<Key, Vec<u8>>,
    // Front is coldest. A blob appears exactly once.
    order: VecDeque<Key>,
    max_entries: usize,
}

pub struct BlobCache {
    inner: Mutex<Inner>,
}

impl BlobCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: FxHashMap::default(),
                order: VecDeque::new(),
                max_entries,
            }),
        }
    }

    pub fn get(&self, id: &ObjectId, kind: BlobType) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let key = (*id, kind);
        match inner.map.get(&key) {
            Some(bytes) => {
                let bytes = bytes.clone();
                // Freshly used: move to the warm end.
                if let Some(at) = inner.order.iter().position(|k| *k == key) {
                    inner.order.remove(at);
                    inner.order.push_back(key);
                }
                counters::bump(counters::Op::BlobCacheHit);
                Some(bytes)
            }
            None => {
                counters::bump(counters::Op::BlobCacheMiss);
                None
            }
        }
    }

    pub fn insert(&self, id: ObjectId, kind: BlobType, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.max_entries == 0 {
            return;
        }
        let key = (id, kind);
        if inner.map.insert(key, bytes).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > inner.max_entries {
            let coldest = inner.order.pop_front().unwrap();
            inner.map.remove(&coldest);
            counters::bump(counters::Op::BlobCacheEviction);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hits_and_misses() {
        let cache = BlobCache::new(4);
        let id = ObjectId::hash(b"blob");
        assert!(cache.get(&id, BlobType::Data).is_none());

        cache.insert(id, BlobType::Data, b"contents".to_vec());
        assert_eq!(cache.get(&id, BlobType::Data).unwrap(), b"contents");
        // Same ID, different type: distinct entries.
        assert!(cache.get(&id, BlobType::Tree).is_none());
    }

    #[test]
    fn eviction_is_least_recently_used() {
        let cache = BlobCache::new(2);
        let a = ObjectId::hash(b"a");
        let b = ObjectId::hash(b"b");
        let c = ObjectId::hash(b"c");

        cache.insert(a, BlobType::Data, vec![1]);
        cache.insert(b, BlobType::Data, vec![2]);
        // Touch a so b is the coldest.
        assert!(cache.get(&a, BlobType::Data).is_some());
        cache.insert(c, BlobType::Data, vec![3]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a, BlobType::Data).is_some());
        assert!(cache.get(&b, BlobType::Data).is_none());
        assert!(cache.get(&c, BlobType::Data).is_some());
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let cache = BlobCache::new(0);
        let id = ObjectId::hash(b"a");
        cache.insert(id, BlobType::Data, vec![1]);
        assert!(cache.get(&id, BlobType::Data).is_none());
    }
}
