//! Advisory distributed mutex stored in Redis.
//!
//! ```text
//! (unlocked) ─── lock() ──→ held ─── unlock() ──→ (unlocked)
//!                            │  ↺ extend()
//!                            └── expiry elapses ──→ (unlocked, stealable)
//! ```
//!
//! Acquisition is `SET key token NX PX expiry`; release and extension are
//! compare-and-act scripts keyed on the random token, so a holder whose lock
//! expired can never delete somebody else's lock. This is a single-node
//! lock: exclusion is best effort under failover or partitions and must not
//! guard correctness-critical invariants on its own.

use rand::Rng;
use std::time::{Duration, Instant};

use super::pool::Connector;
use crate::error::{CacheResult, LockError};

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Acquisition retry budget.
#[derive(Debug, Clone, Copy)]
pub struct MutexOptions {
    /// Attempts before giving up with [`LockError::NotAcquired`].
    pub tries: u32,
    /// Lower bound of the random pause between attempts.
    pub min_retry_delay: Duration,
    /// Upper bound of the random pause between attempts.
    pub max_retry_delay: Duration,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            tries: 32,
            min_retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_millis(250),
        }
    }
}

impl MutexOptions {
    /// A single attempt, no retries.
    pub fn try_once() -> Self {
        Self {
            tries: 1,
            ..Self::default()
        }
    }

    fn retry_delay(&self) -> Duration {
        let min = self.min_retry_delay.as_millis() as u64;
        let max = (self.max_retry_delay.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// A named lock shared by every process using the same Redis and prefix.
///
/// Each handle holds at most one acquisition at a time.
pub struct DistributedMutex {
    connector: Connector,
    name: String,
    key: String,
    expiry: Duration,
    options: MutexOptions,
    token: Option<String>,
    valid_until: Option<Instant>,
}

impl DistributedMutex {
    pub(crate) fn new(
        connector: Connector,
        name: String,
        key: String,
        expiry: Duration,
        options: MutexOptions,
    ) -> Self {
        Self {
            connector,
            name,
            key,
            expiry,
            options,
            token: None,
            valid_until: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Token of the current acquisition, if any.
    pub fn value(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Local estimate of when the current acquisition lapses.
    pub fn valid_until(&self) -> Option<Instant> {
        self.valid_until
    }

    fn expiry_ms(&self) -> u64 {
        (self.expiry.as_millis() as u64).max(1)
    }

    /// Acquire the lock, retrying per [`MutexOptions`].
    ///
    /// Fails with [`LockError::AlreadyHeld`] while this handle still holds a
    /// token, including one left by a cancelled `lock`; `unlock` it first.
    pub async fn lock(&mut self) -> CacheResult<()> {
        if self.token.is_some() {
            return Err(LockError::AlreadyHeld {
                name: self.name.clone(),
            }
            .into());
        }

        let token = uuid::Uuid::new_v4().to_string();
        // Recorded before the first attempt so a cancelled call can still unlock
        self.token = Some(token.clone());

        let tries = self.options.tries.max(1);
        for attempt in 1..=tries {
            let started = Instant::now();
            let mut cmd = redis::cmd("SET");
            cmd.arg(&self.key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.expiry_ms());

            let reply: Option<String> = match self.connector.query("SET NX", &cmd).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.token = None;
                    return Err(e);
                }
            };

            if reply.is_some() {
                self.valid_until = Some(started + self.expiry);
                tracing::debug!(lock = %self.name, attempt, "lock acquired");
                return Ok(());
            }

            if attempt < tries {
                tokio::time::sleep(self.options.retry_delay()).await;
            }
        }

        self.token = None;
        tracing::debug!(lock = %self.name, tries, "lock not acquired");
        Err(LockError::NotAcquired {
            name: self.name.clone(),
            tries,
        }
        .into())
    }

    /// Acquire the lock within `timeout`.
    ///
    /// On timeout any acquisition that raced the deadline is released.
    pub async fn lock_timeout(&mut self, timeout: Duration) -> CacheResult<()> {
        match tokio::time::timeout(timeout, self.lock()).await {
            Ok(result) => result,
            Err(_) => {
                if self.token.is_some() {
                    if let Err(e) = self.unlock().await {
                        tracing::warn!(lock = %self.name, error = %e, "failed to release lock after timeout");
                    }
                }
                Err(LockError::Timeout {
                    name: self.name.clone(),
                    timeout,
                }
                .into())
            }
        }
    }

    /// Release the lock.
    ///
    /// Returns `false` when the lock had already expired or was taken over,
    /// i.e. this handle no longer owned it.
    pub async fn unlock(&mut self) -> CacheResult<bool> {
        let token = self.token.take().ok_or_else(|| LockError::NotHeld {
            name: self.name.clone(),
        })?;
        self.valid_until = None;

        let mut conn = self.connector.get().await?;
        let script = redis::Script::new(UNLOCK_SCRIPT);
        let mut invocation = script.key(&self.key);
        invocation.arg(&token);
        let released: i64 = self
            .connector
            .timed("UNLOCK", invocation.invoke_async(&mut conn))
            .await?;

        if released == 0 {
            tracing::warn!(lock = %self.name, "lock expired before unlock");
        }
        Ok(released == 1)
    }

    /// Reset the expiry of a held lock.
    ///
    /// Returns `false` when the lock was lost; the handle then holds nothing.
    pub async fn extend(&mut self) -> CacheResult<bool> {
        let token = self.token.clone().ok_or_else(|| LockError::NotHeld {
            name: self.name.clone(),
        })?;

        let started = Instant::now();
        let mut conn = self.connector.get().await?;
        let script = redis::Script::new(EXTEND_SCRIPT);
        let mut invocation = script.key(&self.key);
        invocation.arg(&token).arg(self.expiry_ms());
        let extended: i64 = self
            .connector
            .timed("EXTEND", invocation.invoke_async(&mut conn))
            .await?;

        if extended == 1 {
            self.valid_until = Some(started + self.expiry);
            Ok(true)
        } else {
            self.token = None;
            self.valid_until = None;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::error::CacheError;
    use std::sync::Arc;

    use super::super::pool::{PoolCounters, build_pool};

    fn offline_mutex() -> DistributedMutex {
        let config = RemoteConfig {
            addr: "127.0.0.1:9".into(),
            ..Default::default()
        };
        let counters = Arc::new(PoolCounters::default());
        let pool = build_pool(&config, &counters).unwrap();
        let connector = Connector::new(
            pool,
            Arc::clone(&counters),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        DistributedMutex::new(
            connector,
            "job".into(),
            "app/job".into(),
            Duration::from_secs(1),
            MutexOptions::try_once(),
        )
    }

    #[tokio::test]
    async fn test_relock_keeps_existing_token() {
        let mut mutex = offline_mutex();
        mutex.token = Some("held".into());

        let err = mutex.lock().await.unwrap_err();
        assert!(matches!(err, CacheError::Lock(LockError::AlreadyHeld { .. })));
        // Refused before any round trip, and the original acquisition survives
        assert_eq!(mutex.connector.stats().pool_misses, 0);
        assert_eq!(mutex.value(), Some("held"));
    }

    #[tokio::test]
    async fn test_lock_timeout_unreachable_leaves_handle_reusable() {
        let mut mutex = offline_mutex();

        // Either the deadline fires mid-dial and the failed release is logged,
        // or the dial fails first; no token may survive in both cases.
        assert!(mutex.lock_timeout(Duration::ZERO).await.is_err());
        assert_eq!(mutex.value(), None);

        let err = mutex.lock().await.unwrap_err();
        assert!(!matches!(err, CacheError::Lock(LockError::AlreadyHeld { .. })));
        assert_eq!(mutex.value(), None);
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_not_held() {
        let mut mutex = offline_mutex();
        let err = mutex.unlock().await.unwrap_err();
        assert!(matches!(err, CacheError::Lock(LockError::NotHeld { .. })));
    }

    #[test]
    fn test_retry_delay_within_bounds() {
        let options = MutexOptions::default();
        for _ in 0..100 {
            let delay = options.retry_delay();
            assert!(delay >= options.min_retry_delay);
            assert!(delay <= options.max_retry_delay);
        }
    }

    #[test]
    fn test_retry_delay_tolerates_inverted_bounds() {
        let options = MutexOptions {
            tries: 3,
            min_retry_delay: Duration::from_millis(20),
            max_retry_delay: Duration::from_millis(5),
        };
        assert_eq!(options.retry_delay(), Duration::from_millis(20));
    }
}
