//! Point-in-time statistics for both tiers.

use serde::Serialize;

/// Local tier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalStats {
    pub hits: u64,
    pub misses: u64,
    /// Deletes that removed a live entry.
    pub del_hits: u64,
    /// Deletes of keys that were not present.
    pub del_misses: u64,
    /// Writes that replaced a live entry under the same key.
    pub collisions: u64,
    /// Entries removed by capacity pressure or expiry.
    pub evictions: u64,
}

impl LocalStats {
    /// Hit ratio in `[0, 1]`, zero when nothing was read yet.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Remote tier connection-pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStats {
    /// Checkouts served by an idle pooled connection.
    pub pool_hits: u64,
    /// Checkouts that had to open or wait for a connection.
    pub pool_misses: u64,
    /// Pool waits and command round trips that hit their deadline.
    pub timeouts: u64,
    pub total_conns: u64,
    pub idle_conns: u64,
    /// Connections retired for exceeding the idle timeout or max age.
    pub stale_conns: u64,
}

/// Snapshot of both tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ZCacheStats {
    pub local: LocalStats,
    pub remote: RemoteStats,
}

/// Anything that can report a [`ZCacheStats`] snapshot.
///
/// Implementations read atomics only and never block cache operations.
pub trait StatsSource: Send + Sync {
    fn cache_stats(&self) -> ZCacheStats;
}
