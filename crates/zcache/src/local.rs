//! In-process (L1) cache.
//!
//! Backed by `moka`, which shards internally and uses a TinyLFU admission
//! policy: under pressure a new entry may be rejected in favour of hotter
//! ones. Entries are weighed by their encoded size so `max_cost` bounds the
//! memory held by values.
//!
//! This tier is an accelerator, never the source of truth. Admission and
//! eviction are silent; only codec failures reach the caller.

use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::codec::{Codec, JsonCodec};
use crate::config::LocalConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyPrefix;
use crate::stats::{LocalStats, StatsSource, ZCacheStats};
use crate::ttl::Ttl;

/// Fixed bookkeeping cost added to every entry's weight.
const ENTRY_OVERHEAD: usize = 64;

/// A cached value.
///
/// The bytes are wrapped in `Arc` so hits and promotions never copy them.
#[derive(Clone, Debug)]
struct LocalEntry {
    data: Arc<Vec<u8>>,
    ttl: Option<Duration>,
}

/// Per-entry lifetime: each write carries its own TTL.
struct EntryExpiry;

impl Expiry<String, LocalEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

#[derive(Debug, Default)]
struct LocalCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    del_hits: AtomicU64,
    del_misses: AtomicU64,
    collisions: AtomicU64,
    evictions: AtomicU64,
}

impl LocalCounters {
    fn snapshot(&self) -> LocalStats {
        LocalStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            del_hits: self.del_hits.load(Ordering::Relaxed),
            del_misses: self.del_misses.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Bounded, cost-evicting in-process cache.
pub struct LocalCache<C: Codec = JsonCodec> {
    entries: Cache<String, LocalEntry>,
    prefix: KeyPrefix,
    codec: C,
    counters: Arc<LocalCounters>,
}

impl LocalCache<JsonCodec> {
    /// Create a JSON-encoding local cache.
    pub fn new(config: &LocalConfig) -> CacheResult<Self> {
        Self::with_codec(config, JsonCodec)
    }
}

impl<C: Codec> LocalCache<C> {
    pub fn with_codec(config: &LocalConfig, codec: C) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;

        let counters = Arc::new(LocalCounters::default());
        let listener_counters = Arc::clone(&counters);

        let entries = Cache::builder()
            .max_capacity(config.max_cost)
            .initial_capacity(config.expected_entries())
            .weigher(|key: &String, value: &LocalEntry| -> u32 {
                u32::try_from(key.len() + value.data.len() + ENTRY_OVERHEAD).unwrap_or(u32::MAX)
            })
            .expire_after(EntryExpiry)
            .eviction_listener(move |_key, _value, cause| match cause {
                RemovalCause::Replaced => {
                    listener_counters.collisions.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Size | RemovalCause::Expired => {
                    listener_counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            })
            .build();

        tracing::debug!(
            prefix = %config.prefix,
            max_cost = config.max_cost,
            num_counters = config.num_counters,
            buffer_items = config.buffer_items,
            codec = codec.name(),
            "local cache created"
        );

        Ok(Self {
            entries,
            prefix: KeyPrefix::new(config.prefix.clone()),
            codec,
            counters,
        })
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    /// Encode and store a value.
    ///
    /// `Ttl::Persistent` leaves the lifetime to capacity eviction.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Ttl,
    ) -> CacheResult<()> {
        let bytes = self.codec.encode(value)?;
        self.set_raw(key, Arc::new(bytes), ttl).await
    }

    /// Store already-encoded bytes.
    pub async fn set_raw(&self, key: &str, data: Arc<Vec<u8>>, ttl: Ttl) -> CacheResult<()> {
        let entry = LocalEntry {
            data,
            ttl: ttl.duration(),
        };
        self.entries.insert(self.prefix.full_key(key), entry).await;
        Ok(())
    }

    /// Fetch and decode a value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        let data = self.get_raw(key).await?;
        self.codec.decode(&data)
    }

    /// Fetch the encoded bytes, `NotFound` if absent, evicted or expired.
    pub async fn get_raw(&self, key: &str) -> CacheResult<Arc<Vec<u8>>> {
        match self.entries.get(&self.prefix.full_key(key)).await {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry.data)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::not_found(key))
            }
        }
    }

    /// Remove a key immediately.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        match self.entries.remove(&self.prefix.full_key(key)).await {
            Some(_) => self.counters.del_hits.fetch_add(1, Ordering::Relaxed),
            None => self.counters.del_misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(())
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Approximate total weight of live entries.
    pub fn weighted_size(&self) -> u64 {
        self.entries.weighted_size()
    }

    /// Flush pending admissions, evictions and listener notifications.
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }

    pub fn stats(&self) -> LocalStats {
        self.counters.snapshot()
    }
}

impl<C: Codec> StatsSource for LocalCache<C> {
    fn cache_stats(&self) -> ZCacheStats {
        ZCacheStats {
            local: self.stats(),
            ..Default::default()
        }
    }
}
