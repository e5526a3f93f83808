//! Kernel-facing attribute cache, lifted directly from the teacher's
//! `fs/cache.rs`: a `getattr` memoizer keyed by inode, independent from
//! `core`'s `ListCache`/`LocalCache` (those memoize the share's own state;
//! this one only shortens how often the FUSE layer re-asks for it).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use damshare_core::config::{CacheStrategy, ShareConfig};
use fuser::FileAttr;
use lru::LruCache;

struct TtlEntry {
    attr: FileAttr,
    expiry: Instant,
}

pub enum AttributeCache {
    Ttl(HashMap<u64, TtlEntry>),
    Lru(LruCache<u64, FileAttr>),
    None,
}

impl AttributeCache {
    pub fn new(config: &ShareConfig) -> Self {
        match config.cache_strategy {
            CacheStrategy::Ttl => AttributeCache::Ttl(HashMap::new()),
            CacheStrategy::Lru => {
                let capacity =
                    NonZeroUsize::new(config.attribute_cache_lru_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
                AttributeCache::Lru(LruCache::new(capacity))
            }
            CacheStrategy::None => AttributeCache::None,
        }
    }

    pub fn get(&mut self, ino: u64) -> Option<FileAttr> {
        match self {
            AttributeCache::Ttl(cache) => match cache.get(&ino) {
                Some(entry) if entry.expiry > Instant::now() => Some(entry.attr.clone()),
                Some(_) => {
                    cache.remove(&ino);
                    None
                }
                None => None,
            },
            AttributeCache::Lru(cache) => cache.get(&ino).cloned(),
            AttributeCache::None => None,
        }
    }

    pub fn put(&mut self, ino: u64, attr: FileAttr, ttl: Duration) {
        match self {
            AttributeCache::Ttl(cache) => {
                cache.insert(ino, TtlEntry { attr, expiry: Instant::now() + ttl });
            }
            AttributeCache::Lru(cache) => {
                cache.put(ino, attr);
            }
            AttributeCache::None => {}
        }
    }

    pub fn remove(&mut self, ino: u64) {
        match self {
            AttributeCache::Ttl(cache) => {
                cache.remove(&ino);
            }
            AttributeCache::Lru(cache) => {
                cache.pop(&ino);
            }
            AttributeCache::None => {}
        }
    }
}
