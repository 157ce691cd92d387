//! Two-tier cache: local (L1) in front of Redis (L2).
//!
//! ## Lookup order
//!
//! ```text
//! get ─→ L1 hit ─→ return
//!         │ miss
//!         └→ L2 ─→ hit ─→ promote into L1 (best effort) ─→ return
//!                  └─ miss/error ─→ returned as is
//! ```
//!
//! ## Write policy
//!
//! L1 is written first and always with [`Ttl::Persistent`]: its lifetime is
//! governed by capacity eviction, not by the TTL the caller gives Redis. So a
//! value can outlive its Redis TTL locally until evicted. A failing L1 write
//! aborts the call. The L2 outcome is governed by [`RemoteWritePolicy`].
//!
//! There is no cross-tier transaction and no retry: a crash between the two
//! writes leaves the tiers divergent, which is acceptable because L1 is never
//! the source of truth.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::codec::{Codec, JsonCodec};
use crate::config::CombinedConfig;
use crate::error::{CacheError, CacheResult};
use crate::local::LocalCache;
use crate::remote::{RemoteCache, RemoteTier};
use crate::stats::{StatsSource, ZCacheStats};
use crate::ttl::Ttl;

/// How remote write/delete failures propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteWritePolicy {
    /// A remote failure fails the call.
    #[default]
    Strict,
    /// A remote failure is logged and swallowed; a cache outage never fails requests.
    BestEffort,
}

impl RemoteWritePolicy {
    fn absorb(self, operation: &'static str, key: &str, err: CacheError) -> CacheResult<()> {
        match self {
            Self::Strict => Err(err),
            Self::BestEffort => {
                tracing::warn!(key = %key, operation, error = %err, "remote cache failure ignored");
                Ok(())
            }
        }
    }
}

/// Single cache interface over both tiers.
pub struct CombinedCache<R: RemoteTier = RemoteCache, C: Codec = JsonCodec> {
    local: LocalCache<C>,
    remote: R,
    policy: RemoteWritePolicy,
    codec: C,
}

impl CombinedCache {
    /// Build both tiers from configuration (JSON values).
    ///
    /// Redis is not dialed here; an unreachable server shows up on first use.
    pub fn from_config(config: &CombinedConfig) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;
        let local = LocalCache::new(&config.effective_local())?;
        let remote = RemoteCache::new(&config.effective_remote())?;
        Ok(Self::with_tiers(local, remote, config.remote_write_policy))
    }
}

impl<R: RemoteTier, C: Codec> CombinedCache<R, C> {
    /// Assemble from existing tiers. Values are encoded with the local tier's codec.
    pub fn with_tiers(local: LocalCache<C>, remote: R, policy: RemoteWritePolicy) -> Self {
        let codec = local.codec().clone();
        Self {
            local,
            remote,
            policy,
            codec,
        }
    }

    pub fn local(&self) -> &LocalCache<C> {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn policy(&self) -> RemoteWritePolicy {
        self.policy
    }

    /// Write L1 (persistent), then L2 with `remote_ttl`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        remote_ttl: Ttl,
    ) -> CacheResult<()> {
        let bytes = Arc::new(self.codec.encode(value)?);

        self.local
            .set_raw(key, Arc::clone(&bytes), Ttl::Persistent)
            .await?;

        if let Err(e) = self.remote.set_raw(key, &bytes, remote_ttl).await {
            return self.policy.absorb("set", key, e);
        }

        tracing::debug!(key = %key, ttl = ?remote_ttl, "cache set (L1+L2)");
        Ok(())
    }

    /// Read through L1 then L2, promoting L2 hits.
    ///
    /// Remote errors are returned unchanged; use [`CacheError::is_not_found`]
    /// to tell a miss from an outage.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        match self.local.get_raw(key).await {
            Ok(bytes) => {
                tracing::debug!(key = %key, "cache hit (L1)");
                return self.codec.decode(&bytes);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let bytes = self.remote.get_raw(key).await?;
        let value = self.codec.decode(&bytes)?;
        tracing::debug!(key = %key, "cache hit (L2)");

        if let Err(e) = self
            .local
            .set_raw(key, Arc::new(bytes), Ttl::Persistent)
            .await
        {
            tracing::debug!(key = %key, error = %e, "promotion to L1 failed");
        }

        Ok(value)
    }

    /// Delete from both tiers.
    ///
    /// Both deletes are always attempted. The local error wins; the remote
    /// error surfaces only under [`RemoteWritePolicy::Strict`].
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let local = self.local.delete(key).await;
        let remote = self.remote.delete(key).await;

        local?;
        if let Err(e) = remote {
            return self.policy.absorb("delete", key, e);
        }

        tracing::debug!(key = %key, "cache delete (L1+L2)");
        Ok(())
    }

    pub fn stats(&self) -> ZCacheStats {
        ZCacheStats {
            local: self.local.stats(),
            remote: self.remote.stats(),
        }
    }
}

impl<R: RemoteTier, C: Codec> StatsSource for CombinedCache<R, C> {
    fn cache_stats(&self) -> ZCacheStats {
        self.stats()
    }
}
