//! Time-bounded memo of remote attributes and directory listings.
//!
//! Entries live until their TTL elapses or a mutation invalidates them.
//! Reads never refresh an entry's position, so when a map reaches capacity
//! the oldest-inserted entry is evicted first.

use crate::attr::{Attributes, DirectoryListing};
use crate::path::HdfsPath;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of "now" for TTL decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries per map (attributes, listings, negatives).
    pub capacity: usize,
    pub ttl_ms: u64,
    pub negative_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 100_000,
            ttl_ms: 2_000,
            negative_ttl_ms: 1_000,
        }
    }
}

pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
}

/// Result of an attribute lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<V> {
    Hit(V),
    /// The path was recently confirmed absent.
    Absent,
    Miss,
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub size: usize,
}

pub struct MetadataCache {
    attrs: LruCache<HdfsPath, CacheEntry<Attributes>>,
    listings: LruCache<HdfsPath, CacheEntry<DirectoryListing>>,
    negative: LruCache<HdfsPath, Instant>,
    ttl: Duration,
    negative_ttl: Duration,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
    /// Bumped by every invalidation.
    generation: u64,
}

impl MetadataCache {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        MetadataCache {
            attrs: LruCache::new(capacity),
            listings: LruCache::new(capacity),
            negative: LruCache::new(capacity),
            ttl: Duration::from_millis(config.ttl_ms),
            negative_ttl: Duration::from_millis(config.negative_ttl_ms),
            clock,
            stats: CacheStats::default(),
            generation: 0,
        }
    }

    fn fresh(&self, inserted_at: Instant, ttl: Duration) -> bool {
        self.clock.now().saturating_duration_since(inserted_at) < ttl
    }

    pub fn get_attr(&mut self, path: &HdfsPath) -> Cached<Attributes> {
        let attr_state = self
            .attrs
            .peek(path)
            .map(|e| (self.fresh(e.inserted_at, self.ttl), e.value.clone()));
        match attr_state {
            Some((true, value)) => {
                self.stats.hits += 1;
                return Cached::Hit(value);
            }
            Some((false, _)) => {
                self.attrs.pop(path);
            }
            None => {}
        }

        let negative_state = self
            .negative
            .peek(path)
            .map(|at| self.fresh(*at, self.negative_ttl));
        match negative_state {
            Some(true) => {
                self.stats.hits += 1;
                Cached::Absent
            }
            Some(false) => {
                self.negative.pop(path);
                self.stats.misses += 1;
                Cached::Miss
            }
            None => {
                self.stats.misses += 1;
                Cached::Miss
            }
        }
    }

    pub fn insert_attr(&mut self, path: HdfsPath, attr: Attributes) {
        self.negative.pop(&path);
        let entry = CacheEntry {
            value: attr,
            inserted_at: self.clock.now(),
        };
        if let Some((evicted, _)) = self.attrs.push(path.clone(), entry) {
            if evicted != path {
                self.stats.evictions += 1;
            }
        }
    }

    /// Current invalidation generation. Take it before a remote fetch and pass
    /// it to the `*_since` inserts afterwards.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Inserts only if nothing was invalidated since `generation`; a fetch
    /// that raced a mutation is returned to the caller but not cached.
    pub fn insert_attr_since(&mut self, generation: u64, path: HdfsPath, attr: Attributes) -> bool {
        if generation != self.generation {
            tracing::trace!("not caching {}: invalidated during fetch", path);
            return false;
        }
        self.insert_attr(path, attr);
        true
    }

    pub fn insert_negative_since(&mut self, generation: u64, path: HdfsPath) -> bool {
        if generation != self.generation {
            return false;
        }
        self.insert_negative(path);
        true
    }

    pub fn insert_listing_since(&mut self, generation: u64, dir: HdfsPath, listing: DirectoryListing) -> bool {
        if generation != self.generation {
            tracing::trace!("not caching listing of {}: invalidated during fetch", dir);
            return false;
        }
        self.insert_listing(dir, listing);
        true
    }

    pub fn insert_negative(&mut self, path: HdfsPath) {
        if self.negative_ttl.is_zero() {
            return;
        }
        self.attrs.pop(&path);
        let now = self.clock.now();
        if let Some((evicted, _)) = self.negative.push(path.clone(), now) {
            if evicted != path {
                self.stats.evictions += 1;
            }
        }
    }

    pub fn get_listing(&mut self, dir: &HdfsPath) -> Option<DirectoryListing> {
        let state = self
            .listings
            .peek(dir)
            .map(|e| (self.fresh(e.inserted_at, self.ttl), e.value.clone()));
        match state {
            Some((true, listing)) => {
                self.stats.hits += 1;
                Some(listing)
            }
            Some((false, _)) => {
                self.listings.pop(dir);
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Caches a listing and, as a side effect, each child's attributes so a
    /// directory scan followed by per-file stats costs one round trip.
    pub fn insert_listing(&mut self, dir: HdfsPath, listing: DirectoryListing) {
        for entry in &listing {
            self.insert_attr(dir.join(&entry.name), entry.attr.clone());
        }
        let entry = CacheEntry {
            value: listing,
            inserted_at: self.clock.now(),
        };
        if let Some((evicted, _)) = self.listings.push(dir.clone(), entry) {
            if evicted != dir {
                self.stats.evictions += 1;
            }
        }
    }

    /// Drops everything cached for `path` plus its parent's listing, which no
    /// longer agrees with a mutation of `path`.
    pub fn invalidate(&mut self, path: &HdfsPath) {
        self.generation += 1;
        let mut removed = self.attrs.pop(path).is_some();
        removed |= self.negative.pop(path).is_some();
        removed |= self.listings.pop(path).is_some();
        if !path.is_root() {
            removed |= self.listings.pop(&path.parent()).is_some();
        }
        if removed {
            self.stats.invalidations += 1;
        }
        tracing::trace!("invalidated {}", path);
    }

    /// Like [`invalidate`](Self::invalidate) for `root`, and additionally drops
    /// every entry below it.
    pub fn invalidate_subtree(&mut self, root: &HdfsPath) {
        self.invalidate(root);
        let attr_keys: Vec<HdfsPath> = self
            .attrs
            .iter()
            .filter(|(p, _)| p.is_within(root))
            .map(|(p, _)| p.clone())
            .collect();
        let listing_keys: Vec<HdfsPath> = self
            .listings
            .iter()
            .filter(|(p, _)| p.is_within(root))
            .map(|(p, _)| p.clone())
            .collect();
        let negative_keys: Vec<HdfsPath> = self
            .negative
            .iter()
            .filter(|(p, _)| p.is_within(root))
            .map(|(p, _)| p.clone())
            .collect();
        for key in &attr_keys {
            self.attrs.pop(key);
        }
        for key in &listing_keys {
            self.listings.pop(key);
        }
        for key in &negative_keys {
            self.negative.pop(key);
        }
        self.stats.invalidations += (attr_keys.len() + listing_keys.len() + negative_keys.len()) as u64;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.attrs.len() + self.listings.len(),
            ..self.stats.clone()
        }
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.attrs.clear();
        self.listings.clear();
        self.negative.clear();
    }

    pub fn len(&self) -> usize {
        self.attrs.len() + self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && self.listings.is_empty()
    }
}
