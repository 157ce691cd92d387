//! Two-tier caching engine.
//!
//! An in-process cache (L1, [`LocalCache`]) in front of Redis (L2,
//! [`RemoteCache`]), unified by [`CombinedCache`]:
//!
//! - reads check L1, fall through to Redis and promote hits into L1
//! - writes go to L1 first, then Redis under a [`RemoteWritePolicy`]
//! - deletes hit both tiers
//!
//! The Redis tier additionally exposes counters, hashes, sets, sorted sets,
//! command pipelines ([`RemotePipeline`]) and a [`DistributedMutex`].
//! [`StatsMonitor`] republishes tier statistics into a [`MetricsSink`].
//!
//! ```no_run
//! use zcache::{CombinedCache, CombinedConfig, Ttl};
//!
//! # async fn run() -> zcache::CacheResult<()> {
//! let cache = CombinedCache::from_config(&CombinedConfig::default())?;
//! cache.set("user:1", &"alice", Ttl::from_secs(300)).await?;
//! let name: String = cache.get("user:1").await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod combined;
pub mod config;
pub mod error;
pub mod keys;
pub mod local;
pub mod metrics;
pub mod monitor;
pub mod observability;
pub mod remote;
pub mod stats;
pub mod ttl;

pub use codec::{Codec, JsonCodec, MsgPackCodec};
pub use combined::{CombinedCache, RemoteWritePolicy};
pub use config::{CombinedConfig, LocalConfig, MonitorConfig, RemoteConfig, Settings};
pub use error::{CacheError, CacheResult, ErrorCategory, LockError};
pub use keys::KeyPrefix;
pub use local::LocalCache;
pub use metrics::{MetricDef, MetricKind, MetricsError, MetricsSink, PrometheusMetrics};
pub use monitor::StatsMonitor;
pub use remote::{DistributedMutex, MutexOptions, RemoteCache, RemotePipeline, RemoteTier};
pub use stats::{LocalStats, RemoteStats, StatsSource, ZCacheStats};
pub use ttl::{KeyTtl, Ttl};
