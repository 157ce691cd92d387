//! Redis-backed (L2) cache.
//!
//! Shared across instances and authoritative for the two-tier cache. Every
//! key goes through the instance's [`KeyPrefix`]; values go through the
//! codec, except replies that Redis produces natively (counters, scores,
//! set/list lengths, key names).
//!
//! ## Not found
//!
//! Only a nil reply to `GET`/`HGET` becomes [`CacheError::NotFound`]. A dead
//! connection is an infrastructure error and is never mistaken for a miss,
//! which is what lets the combined cache decide whether to promote.

mod mutex;
mod pipeline;
mod pool;

pub use mutex::{DistributedMutex, MutexOptions};
pub use pipeline::RemotePipeline;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::codec::{Codec, JsonCodec};
use crate::config::RemoteConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyPrefix;
use crate::stats::{RemoteStats, StatsSource, ZCacheStats};
use crate::ttl::{KeyTtl, Ttl};

use pool::{Connector, PoolCounters};

/// The byte-level contract the combined cache needs from its remote tier.
///
/// [`RemoteCache`] is the production implementation; tests wrap it (or
/// replace it) to count round trips or simulate outages.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Encoded bytes for `key`, `NotFound` if absent.
    async fn get_raw(&self, key: &str) -> CacheResult<Vec<u8>>;

    async fn set_raw(&self, key: &str, value: &[u8], ttl: Ttl) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    fn stats(&self) -> RemoteStats;
}

/// Redis client over a bounded connection pool.
pub struct RemoteCache<C: Codec = JsonCodec> {
    connector: Connector,
    prefix: KeyPrefix,
    codec: C,
    min_idle_conns: usize,
    reaper: Option<JoinHandle<()>>,
}

impl RemoteCache<JsonCodec> {
    /// Create a JSON-encoding remote cache.
    pub fn new(config: &RemoteConfig) -> CacheResult<Self> {
        Self::with_codec(config, JsonCodec)
    }
}

impl<C: Codec> RemoteCache<C> {
    /// Build the pool without dialing; an unreachable server surfaces on first use.
    pub fn with_codec(config: &RemoteConfig, codec: C) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;

        let counters = Arc::new(PoolCounters::default());
        let pool = pool::build_pool(config, &counters)?;
        let reaper = pool::spawn_idle_reaper(&pool, config, &counters);

        tracing::info!(
            url = %config.redacted_url(),
            prefix = %config.prefix,
            pool_size = config.pool_size,
            codec = codec.name(),
            "remote cache configured"
        );

        Ok(Self {
            connector: Connector::new(
                pool,
                counters,
                config.command_timeout(),
                config.pool_timeout(),
            ),
            prefix: KeyPrefix::new(config.prefix.clone()),
            codec,
            min_idle_conns: config.min_idle_conns,
            reaper,
        })
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        self.prefix.full_key(key)
    }

    /// Open `min_idle_conns` connections ahead of traffic.
    pub async fn warm_up(&self) -> CacheResult<()> {
        if self.min_idle_conns == 0 {
            return Ok(());
        }
        let conns = futures_util::future::try_join_all(
            (0..self.min_idle_conns).map(|_| self.connector.get()),
        )
        .await?;
        tracing::debug!(count = conns.len(), "warmed up redis connections");
        Ok(())
    }

    /// Round-trip a `PING`, for health checks.
    pub async fn ping(&self) -> CacheResult<()> {
        let _: String = self.connector.query("PING", &redis::cmd("PING")).await?;
        Ok(())
    }

    /// Whether a connection can currently be checked out.
    pub async fn is_available(&self) -> bool {
        self.connector.get().await.is_ok()
    }

    // ---------------------------------------------------------------------
    // Strings
    // ---------------------------------------------------------------------

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Ttl,
    ) -> CacheResult<()> {
        let bytes = self.codec.encode(value)?;
        self.set_raw(key, &bytes, ttl).await
    }

    pub async fn set_raw(&self, key: &str, value: &[u8], ttl: Ttl) -> CacheResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ms) = ttl.as_millis() {
            cmd.arg("PX").arg(ms);
        }
        let _: () = self.connector.query("SET", &cmd).await?;
        tracing::debug!(key = %key, ttl = ?ttl, "remote set");
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        let bytes = self.get_raw(key).await?;
        self.codec.decode(&bytes)
    }

    pub async fn get_raw(&self, key: &str) -> CacheResult<Vec<u8>> {
        let mut conn = self.connector.get().await?;
        let value: Option<Vec<u8>> = self
            .connector
            .timed("GET", conn.get(self.key(key)))
            .await?;
        value.ok_or_else(|| CacheError::not_found(key))
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.connector.get().await?;
        let _: u64 = self.connector.timed("DEL", conn.del(self.key(key))).await?;
        Ok(())
    }

    /// Delete several keys in one round trip; returns how many existed.
    pub async fn delete_multi<S: AsRef<str>>(&self, keys: &[S]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connector.get().await?;
        self.connector
            .timed("DEL", conn.del(self.prefix.full_keys(keys)))
            .await
    }

    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connector.get().await?;
        self.connector
            .timed("EXISTS", conn.exists(self.key(key)))
            .await
    }

    pub async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.incr_by(key, 1).await
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(self.key(key)).arg(delta);
        self.connector.query("INCRBY", &cmd).await
    }

    pub async fn decr(&self, key: &str) -> CacheResult<i64> {
        self.decr_by(key, 1).await
    }

    pub async fn decr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut cmd = redis::cmd("DECRBY");
        cmd.arg(self.key(key)).arg(delta);
        self.connector.query("DECRBY", &cmd).await
    }

    /// Remove every key in every database of the server, not just this prefix.
    pub async fn flush_all(&self) -> CacheResult<()> {
        let _: () = self
            .connector
            .query("FLUSHALL", &redis::cmd("FLUSHALL"))
            .await?;
        tracing::info!("remote cache flushed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lists and sets
    // ---------------------------------------------------------------------

    /// Prepend values; returns the new list length.
    pub async fn lpush<T: Serialize>(&self, key: &str, values: &[T]) -> CacheResult<i64> {
        self.push("LPUSH", key, values).await
    }

    /// Append values; returns the new list length.
    pub async fn rpush<T: Serialize>(&self, key: &str, values: &[T]) -> CacheResult<i64> {
        self.push("RPUSH", key, values).await
    }

    async fn push<T: Serialize>(
        &self,
        command: &'static str,
        key: &str,
        values: &[T],
    ) -> CacheResult<i64> {
        let cmd = self.multi_value_cmd(command, key, values)?;
        self.connector.query(command, &cmd).await
    }

    /// Add members; returns how many were new.
    pub async fn sadd<T: Serialize>(&self, key: &str, members: &[T]) -> CacheResult<i64> {
        let cmd = self.multi_value_cmd("SADD", key, members)?;
        self.connector.query("SADD", &cmd).await
    }

    pub async fn smembers<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Vec<T>> {
        let mut conn = self.connector.get().await?;
        let members: Vec<Vec<u8>> = self
            .connector
            .timed("SMEMBERS", conn.smembers(self.key(key)))
            .await?;
        members.iter().map(|m| self.codec.decode(m)).collect()
    }

    fn multi_value_cmd<T: Serialize>(
        &self,
        command: &'static str,
        key: &str,
        values: &[T],
    ) -> CacheResult<redis::Cmd> {
        if values.is_empty() {
            return Err(CacheError::config(format!(
                "{command} requires at least one value"
            )));
        }
        let mut cmd = redis::cmd(command);
        cmd.arg(self.key(key));
        for value in values {
            cmd.arg(self.codec.encode(value)?);
        }
        Ok(cmd)
    }

    // ---------------------------------------------------------------------
    // Hashes
    // ---------------------------------------------------------------------

    /// Set a hash field; returns `true` if the field was new.
    pub async fn hset<T: Serialize + ?Sized>(
        &self,
        key: &str,
        field: &str,
        value: &T,
    ) -> CacheResult<bool> {
        let bytes = self.codec.encode(value)?;
        let mut conn = self.connector.get().await?;
        let added: i64 = self
            .connector
            .timed("HSET", conn.hset(self.key(key), field, bytes))
            .await?;
        Ok(added > 0)
    }

    /// Set a hash field only if absent; returns `true` if it was written.
    pub async fn hset_nx<T: Serialize + ?Sized>(
        &self,
        key: &str,
        field: &str,
        value: &T,
    ) -> CacheResult<bool> {
        let bytes = self.codec.encode(value)?;
        let mut conn = self.connector.get().await?;
        self.connector
            .timed("HSETNX", conn.hset_nx(self.key(key), field, bytes))
            .await
    }

    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> CacheResult<T> {
        let mut conn = self.connector.get().await?;
        let value: Option<Vec<u8>> = self
            .connector
            .timed("HGET", conn.hget(self.key(key), field))
            .await?;
        match value {
            Some(bytes) => self.codec.decode(&bytes),
            None => Err(CacheError::not_found(format!("{key}#{field}"))),
        }
    }

    pub async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> CacheResult<i64> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(self.key(key)).arg(field).arg(delta);
        self.connector.query("HINCRBY", &cmd).await
    }

    pub async fn hexists(&self, key: &str, field: &str) -> CacheResult<bool> {
        let mut conn = self.connector.get().await?;
        self.connector
            .timed("HEXISTS", conn.hexists(self.key(key), field))
            .await
    }

    /// All fields of a hash; empty when the key does not exist.
    pub async fn hgetall<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> CacheResult<HashMap<String, T>> {
        let mut conn = self.connector.get().await?;
        let fields: HashMap<String, Vec<u8>> = self
            .connector
            .timed("HGETALL", conn.hgetall(self.key(key)))
            .await?;
        fields
            .into_iter()
            .map(|(field, bytes)| Ok((field, self.codec.decode(&bytes)?)))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Keys, sorted sets, expiry
    // ---------------------------------------------------------------------

    /// Logical keys matching a glob pattern inside this prefix.
    ///
    /// Uses `KEYS`, which blocks the server while it scans; keep it off hot paths.
    pub async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.connector.get().await?;
        let full: Vec<String> = self
            .connector
            .timed("KEYS", conn.keys(self.key(pattern)))
            .await?;
        Ok(full
            .iter()
            .map(|k| self.prefix.strip(k).to_string())
            .collect())
    }

    /// Increment a member's score; returns the new score.
    pub async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> CacheResult<f64> {
        let mut cmd = redis::cmd("ZINCRBY");
        cmd.arg(self.key(key)).arg(delta).arg(member);
        self.connector.query("ZINCRBY", &cmd).await
    }

    /// Members by descending score within `[start, stop]` ranks.
    pub async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> CacheResult<Vec<(String, f64)>> {
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(self.key(key))
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES");
        self.connector.query("ZREVRANGE", &cmd).await
    }

    /// Set or clear a key's expiry; returns `false` if the key does not exist
    /// (or had no expiry to clear).
    pub async fn expire(&self, key: &str, ttl: Ttl) -> CacheResult<bool> {
        let cmd = match ttl.as_millis() {
            Some(ms) => {
                let mut cmd = redis::cmd("PEXPIRE");
                cmd.arg(self.key(key)).arg(ms);
                cmd
            }
            None => {
                let mut cmd = redis::cmd("PERSIST");
                cmd.arg(self.key(key));
                cmd
            }
        };
        self.connector.query("EXPIRE", &cmd).await
    }

    /// Remaining lifetime of a key.
    pub async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(self.key(key));
        let pttl: i64 = self.connector.query("PTTL", &cmd).await?;
        Ok(KeyTtl::from_pttl(pttl))
    }

    // ---------------------------------------------------------------------
    // Batching and locking
    // ---------------------------------------------------------------------

    /// Batch commands into one round trip, without atomicity.
    pub fn pipeline(&self) -> RemotePipeline<C> {
        RemotePipeline::new(self.connector.clone(), self.prefix.clone(), self.codec.clone(), false)
    }

    /// Batch commands into one `MULTI`/`EXEC` transaction.
    pub fn tx_pipeline(&self) -> RemotePipeline<C> {
        RemotePipeline::new(self.connector.clone(), self.prefix.clone(), self.codec.clone(), true)
    }

    /// A distributed mutex named `name` (namespaced by this cache's prefix).
    pub fn new_mutex(&self, name: &str, expiry: Duration) -> DistributedMutex {
        self.new_mutex_with(name, expiry, MutexOptions::default())
    }

    pub fn new_mutex_with(
        &self,
        name: &str,
        expiry: Duration,
        options: MutexOptions,
    ) -> DistributedMutex {
        DistributedMutex::new(
            self.connector.clone(),
            name.to_string(),
            self.key(name),
            expiry,
            options,
        )
    }

    /// Live pool counters.
    pub fn stats(&self) -> RemoteStats {
        self.connector.stats()
    }
}

impl<C: Codec> Drop for RemoteCache<C> {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

#[async_trait]
impl<C: Codec> RemoteTier for RemoteCache<C> {
    async fn get_raw(&self, key: &str) -> CacheResult<Vec<u8>> {
        RemoteCache::get_raw(self, key).await
    }

    async fn set_raw(&self, key: &str, value: &[u8], ttl: Ttl) -> CacheResult<()> {
        RemoteCache::set_raw(self, key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        RemoteCache::delete(self, key).await
    }

    fn stats(&self) -> RemoteStats {
        RemoteCache::stats(self)
    }
}

impl<C: Codec> StatsSource for RemoteCache<C> {
    fn cache_stats(&self) -> ZCacheStats {
        ZCacheStats {
            remote: self.stats(),
            ..Default::default()
        }
    }
}
