//! Redis connection pool and per-command deadlines.

use deadpool_redis::{Connection, Hook, HookError, Pool, PoolError, Runtime};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::RemoteConfig;
use crate::error::{CacheError, CacheResult};
use crate::stats::RemoteStats;

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale: AtomicU64,
}

/// Build the pool. No connection is opened here; the first checkout dials.
///
/// Connections older than `max_conn_age` or idle longer than `idle_timeout`
/// are refused on recycle and counted as stale.
pub(crate) fn build_pool(config: &RemoteConfig, counters: &Arc<PoolCounters>) -> CacheResult<Pool> {
    let url = config.connection_url()?;
    let max_age = config.max_conn_age();
    let idle_timeout = config.idle_timeout();
    let stale = Arc::clone(counters);

    deadpool_redis::Config::from_url(url)
        .builder()
        .map_err(|e| CacheError::config(format!("invalid redis url: {e}")))?
        .max_size(config.pool_size)
        .wait_timeout(Some(config.pool_timeout()))
        .create_timeout(Some(config.dial_timeout()))
        .recycle_timeout(Some(config.command_timeout()))
        .runtime(Runtime::Tokio1)
        .pre_recycle(Hook::sync_fn(move |_conn, metrics| {
            let too_old = max_age.is_some_and(|age| metrics.age() > age);
            let too_idle = idle_timeout.is_some_and(|idle| metrics.last_used() > idle);
            if too_old || too_idle {
                stale.stale.fetch_add(1, Ordering::Relaxed);
                return Err(HookError::Message("connection retired".into()));
            }
            Ok(())
        }))
        .build()
        .map_err(|e| CacheError::pool(format!("failed to build redis pool: {e}")))
}

/// Periodically drop pooled connections idle longer than `idle_timeout`.
///
/// Returns `None` when reaping is disabled or no tokio runtime is running.
pub(crate) fn spawn_idle_reaper(
    pool: &Pool,
    config: &RemoteConfig,
    counters: &Arc<PoolCounters>,
) -> Option<JoinHandle<()>> {
    let idle_timeout = config.idle_timeout()?;
    let frequency = config.idle_check_frequency()?;
    let handle = tokio::runtime::Handle::try_current().ok()?;

    let pool = pool.clone();
    let counters = Arc::clone(counters);
    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval(frequency);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = pool
                .retain(|_, metrics| metrics.last_used() < idle_timeout)
                .removed
                .len();
            if reaped > 0 {
                counters.stale.fetch_add(reaped as u64, Ordering::Relaxed);
                tracing::debug!(reaped, "reaped idle redis connections");
            }
        }
    }))
}

/// Pool handle shared by the cache, its pipelines and its mutexes.
#[derive(Clone)]
pub(crate) struct Connector {
    pool: Pool,
    counters: Arc<PoolCounters>,
    command_timeout: Duration,
    pool_timeout: Duration,
}

impl Connector {
    pub(crate) fn new(
        pool: Pool,
        counters: Arc<PoolCounters>,
        command_timeout: Duration,
        pool_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            counters,
            command_timeout,
            pool_timeout,
        }
    }

    /// Check a connection out of the pool.
    pub(crate) async fn get(&self) -> CacheResult<Connection> {
        if self.pool.status().available > 0 {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }

        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                CacheError::Timeout {
                    operation: "pool checkout",
                    timeout: self.pool_timeout,
                }
            }
            PoolError::Backend(e) => CacheError::Redis(e),
            other => CacheError::pool(other.to_string()),
        })
    }

    /// Bound one round trip by the command deadline.
    pub(crate) async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> CacheResult<T> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Timeout {
                    operation,
                    timeout: self.command_timeout,
                })
            }
        }
    }

    /// Run a single command on a pooled connection.
    pub(crate) async fn query<T: redis::FromRedisValue>(
        &self,
        operation: &'static str,
        cmd: &redis::Cmd,
    ) -> CacheResult<T> {
        let mut conn = self.get().await?;
        self.timed(operation, cmd.query_async(&mut conn)).await
    }

    pub(crate) fn stats(&self) -> RemoteStats {
        let status = self.pool.status();
        RemoteStats {
            pool_hits: self.counters.hits.load(Ordering::Relaxed),
            pool_misses: self.counters.misses.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            total_conns: status.size as u64,
            idle_conns: status.available as u64,
            stale_conns: self.counters.stale.load(Ordering::Relaxed),
        }
    }
}
