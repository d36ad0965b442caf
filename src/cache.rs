//! Sharded TTL cache of per-IP ban verdicts.
//!
//! Keys are hashed onto a fixed set of shards, each behind its own lock, so
//! the stream synchronizer writing one IP never waits on request handlers
//! reading another. Expired entries are treated exactly like missing ones.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Estimated bookkeeping cost of one entry on top of its key bytes.
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Longest textual form of an IP address (IPv4-mapped IPv6).
const MAX_IP_TEXT_LEN: usize = 45;

/// Smallest per-shard memory bound: one entry for any IP key always fits.
pub const MIN_SHARD_BYTES: usize = ENTRY_OVERHEAD_BYTES + MAX_IP_TEXT_LEN;

/// Error returned by [`DecisionCache::set`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("ttl for {key:?} must be greater than zero")]
    InvalidTtl { key: String },
    #[error("ttl for {key:?} is out of range")]
    TtlOverflow { key: String },
    #[error("entry for {key:?} exceeds the per-shard memory bound")]
    EntryTooLarge { key: String },
}

/// Cached verdict for one IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedDecision {
    /// Whether the IP is banned.
    pub banned: bool,
    /// Instant from which the entry is no longer valid.
    pub expires_at: Instant,
}

impl CachedDecision {
    fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before this entry expires.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, CachedDecision>,
    used_bytes: usize,
}

impl Shard {
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.used_bytes -= entry_cost(key);
            true
        } else {
            false
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|key, entry| {
            let keep = !entry.is_expired_at(now);
            if !keep {
                freed += entry_cost(key);
            }
            keep
        });
        self.used_bytes -= freed;
        before - self.entries.len()
    }

    fn fits(&self, cost: usize, max_entries: usize, max_bytes: usize) -> bool {
        self.entries.len() < max_entries && self.used_bytes + cost <= max_bytes
    }

    /// Evict entries until `cost` more bytes fit. Expired entries go first,
    /// then the live entry closest to expiry. Returns the number of live
    /// entries evicted.
    fn make_room(&mut self, cost: usize, max_entries: usize, max_bytes: usize, now: Instant) -> u64 {
        if self.fits(cost, max_entries, max_bytes) {
            return 0;
        }

        self.purge_expired(now);

        let mut evicted = 0;
        while !self.fits(cost, max_entries, max_bytes) {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    self.remove(&key);
                    debug!(key = %key, "Cache capacity eviction");
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

fn entry_cost(key: &str) -> usize {
    key.len() + ENTRY_OVERHEAD_BYTES
}

fn effective_shards(shards: usize) -> usize {
    shards.max(1).next_power_of_two()
}

/// Smallest `max_memory_bytes` that holds at least one entry per shard.
pub fn min_memory_bytes(shards: usize) -> usize {
    effective_shards(shards).saturating_mul(MIN_SHARD_BYTES)
}

/// Thread-safe, bounded TTL cache keyed by IP string.
pub struct DecisionCache {
    shards: Box<[RwLock<Shard>]>,
    hasher: RandomState,
    shard_max_entries: usize,
    shard_max_bytes: usize,
    evictions: AtomicU64,
}

impl DecisionCache {
    /// Create a cache bounded by `max_entries` and `max_memory_bytes`, split
    /// over `shards` partitions (rounded up to a power of two).
    ///
    /// Each shard gets at least [`MIN_SHARD_BYTES`], so the effective bound
    /// can exceed `max_memory_bytes` when it is smaller than
    /// [`min_memory_bytes`].
    pub fn new(max_entries: usize, max_memory_bytes: usize, shards: usize) -> Self {
        let shard_count = effective_shards(shards);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
            shard_max_entries: max_entries.div_ceil(shard_count).max(1),
            shard_max_bytes: max_memory_bytes.div_ceil(shard_count).max(MIN_SHARD_BYTES),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1)
    }

    // Shards only hold plain data, so a poisoned lock is still consistent.
    fn read_shard(&self, key: &str) -> RwLockReadGuard<'_, Shard> {
        self.shards[self.shard_index(key)]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, key: &str) -> RwLockWriteGuard<'_, Shard> {
        self.shards[self.shard_index(key)]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the verdict for `key` if present and not expired.
    pub fn get(&self, key: &str) -> Option<CachedDecision> {
        let shard = self.read_shard(key);
        let entry = shard.entries.get(key)?;

        if entry.is_expired_at(Instant::now()) {
            // Left in place; purge or eviction reclaims it.
            None
        } else {
            Some(*entry)
        }
    }

    /// Insert or overwrite the verdict for `key`, valid for `ttl`.
    ///
    /// A zero `ttl` is rejected without touching the cache. When the shard
    /// is full the entry nearest to expiry is evicted to make room.
    pub fn set(&self, key: &str, banned: bool, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl {
                key: key.to_string(),
            });
        }

        let cost = entry_cost(key);
        if cost > self.shard_max_bytes {
            return Err(CacheError::EntryTooLarge {
                key: key.to_string(),
            });
        }

        let now = Instant::now();
        let expires_at = now.checked_add(ttl).ok_or_else(|| CacheError::TtlOverflow {
            key: key.to_string(),
        })?;

        let mut shard = self.write_shard(key);
        shard.remove(key);

        let evicted = shard.make_room(cost, self.shard_max_entries, self.shard_max_bytes, now);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        shard
            .entries
            .insert(key.to_string(), CachedDecision { banned, expires_at });
        shard.used_bytes += cost;

        Ok(())
    }

    /// Remove the entry for `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        self.write_shard(key).remove(key)
    }

    /// Remove expired entries from every shard. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .purge_expired(now)
            })
            .sum()
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
            shard.entries.clear();
            shard.used_bytes = 0;
        }
    }

    /// Number of live entries evicted early to respect the capacity bounds.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
