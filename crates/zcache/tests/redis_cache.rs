//! Integration tests against a real Redis.
//!
//! A single container is shared by every test; each test works under its own
//! random key prefix so tests never see each other's keys and nothing calls
//! `flush_all` on the shared server.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use zcache::{
    CacheError, CacheResult, CombinedCache, KeyTtl, LocalCache, LocalConfig, LockError,
    MutexOptions, RemoteCache, RemoteConfig, RemoteStats, RemoteTier, RemoteWritePolicy, Ttl,
};

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn redis_addr() -> String {
    let (_, addr) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let addr = format!("127.0.0.1:{host_port}");

            (container, addr)
        })
        .await;

    addr.clone()
}

fn unique_prefix(label: &str) -> String {
    format!("{label}{}", uuid::Uuid::new_v4().simple())
}

async fn remote_config(prefix: &str) -> RemoteConfig {
    RemoteConfig {
        addr: redis_addr().await,
        prefix: prefix.to_string(),
        pool_size: 4,
        ..Default::default()
    }
}

async fn remote(prefix: &str) -> RemoteCache {
    RemoteCache::new(&remote_config(prefix).await).expect("build remote cache")
}

/// Counts round trips to the wrapped remote tier.
struct SpyRemote {
    inner: RemoteCache,
    gets: AtomicU64,
}

impl SpyRemote {
    fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteTier for SpyRemote {
    async fn get_raw(&self, key: &str) -> CacheResult<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_raw(key).await
    }

    async fn set_raw(&self, key: &str, value: &[u8], ttl: Ttl) -> CacheResult<()> {
        self.inner.set_raw(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.inner.delete(key).await
    }

    fn stats(&self) -> RemoteStats {
        self.inner.stats()
    }
}

// ---------------------------------------------------------------------------
// Remote tier
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_remote_connection_and_stats() {
    let cache = remote(&unique_prefix("conn")).await;

    cache.ping().await.unwrap();
    assert!(cache.is_available().await);

    let stats = cache.stats();
    assert!(stats.total_conns >= 1);
    assert_eq!(stats.timeouts, 0);
}

#[tokio::test]
async fn test_remote_warm_up_opens_min_idle_conns() {
    let config = RemoteConfig {
        min_idle_conns: 3,
        ..remote_config(&unique_prefix("warm")).await
    };
    let cache = RemoteCache::new(&config).unwrap();

    cache.warm_up().await.unwrap();

    let stats = cache.stats();
    assert_eq!(stats.total_conns, 3);
    assert_eq!(stats.idle_conns, 3);
}

#[tokio::test]
async fn test_remote_string_ops() {
    let cache = remote(&unique_prefix("str")).await;

    cache.set("greeting", "hello", Ttl::Persistent).await.unwrap();
    assert_eq!(cache.get::<String>("greeting").await.unwrap(), "hello");
    assert!(cache.exists("greeting").await.unwrap());

    let err = cache.get::<String>("missing").await.unwrap_err();
    assert!(err.is_not_found());

    cache.delete("greeting").await.unwrap();
    assert!(!cache.exists("greeting").await.unwrap());
    // Deleting an absent key is not an error
    cache.delete("greeting").await.unwrap();

    cache.set("a", &1, Ttl::Persistent).await.unwrap();
    cache.set("b", &2, Ttl::Persistent).await.unwrap();
    assert_eq!(cache.delete_multi(&["a", "b", "c"]).await.unwrap(), 2);
}

#[tokio::test]
async fn test_remote_counters() {
    let cache = remote(&unique_prefix("ctr")).await;

    assert_eq!(cache.incr("hits").await.unwrap(), 1);
    assert_eq!(cache.incr_by("hits", 10).await.unwrap(), 11);
    assert_eq!(cache.decr("hits").await.unwrap(), 10);
    assert_eq!(cache.decr_by("hits", 4).await.unwrap(), 6);

    // Codec-encoded JSON integers are plain digits, so INCR sees a number
    cache.set("seeded", &41, Ttl::Persistent).await.unwrap();
    assert_eq!(cache.incr("seeded").await.unwrap(), 42);
}

#[tokio::test]
async fn test_key_prefixing() {
    let prefix = unique_prefix("app");
    let prefixed = remote(&prefix).await;
    let bare = remote("").await;

    prefixed.set("k", "v", Ttl::Persistent).await.unwrap();

    assert!(bare.exists(&format!("{prefix}/k")).await.unwrap());
    assert!(!bare.exists("k").await.unwrap());

    let keys = prefixed.keys("*").await.unwrap();
    assert_eq!(keys, vec!["k".to_string()]);
}

#[tokio::test]
async fn test_remote_ttl_and_expire() {
    let cache = remote(&unique_prefix("ttl")).await;

    assert_eq!(cache.ttl("absent").await.unwrap(), KeyTtl::Missing);

    cache.set("k", "v", Ttl::Persistent).await.unwrap();
    assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Persistent);

    assert!(cache.expire("k", Ttl::from_secs(30)).await.unwrap());
    match cache.ttl("k").await.unwrap() {
        KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(30)),
        other => panic!("expected expiry, got {other:?}"),
    }

    assert!(cache.expire("k", Ttl::Persistent).await.unwrap());
    assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Persistent);
    assert!(!cache.expire("absent", Ttl::from_secs(5)).await.unwrap());

    cache.set("short", "v", Ttl::from_millis(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(cache.get::<String>("short").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_remote_hashes() {
    let cache = remote(&unique_prefix("hash")).await;

    assert!(cache.hset("user:1", "name", "alice").await.unwrap());
    assert!(!cache.hset("user:1", "name", "alicia").await.unwrap());
    assert!(!cache.hset_nx("user:1", "name", "bob").await.unwrap());
    assert!(cache.hset_nx("user:1", "email", "a@example.com").await.unwrap());

    assert_eq!(cache.hget::<String>("user:1", "name").await.unwrap(), "alicia");
    assert!(cache.hexists("user:1", "email").await.unwrap());
    assert!(!cache.hexists("user:1", "phone").await.unwrap());

    let err = cache.hget::<String>("user:1", "phone").await.unwrap_err();
    assert!(matches!(err, CacheError::NotFound { ref key } if key == "user:1#phone"));

    assert_eq!(cache.hincr_by("user:1", "logins", 3).await.unwrap(), 3);

    let all: HashMap<String, serde_json::Value> = cache.hgetall("user:1").await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all["name"], "alicia");
    assert_eq!(all["logins"], 3);

    let empty: HashMap<String, String> = cache.hgetall("nobody").await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_remote_lists_and_sets() {
    let cache = remote(&unique_prefix("coll")).await;

    assert_eq!(cache.rpush("queue", &["a", "b"]).await.unwrap(), 2);
    assert_eq!(cache.lpush("queue", &["z"]).await.unwrap(), 3);

    assert_eq!(cache.sadd("tags", &["x", "y", "x"]).await.unwrap(), 2);
    assert_eq!(cache.sadd("tags", &["y"]).await.unwrap(), 0);

    let mut members: Vec<String> = cache.smembers("tags").await.unwrap();
    members.sort();
    assert_eq!(members, vec!["x", "y"]);
}

#[tokio::test]
async fn test_remote_sorted_sets() {
    let cache = remote(&unique_prefix("zset")).await;

    assert_eq!(cache.zincr_by("board", "alice", 5.0).await.unwrap(), 5.0);
    cache.zincr_by("board", "bob", 7.0).await.unwrap();
    assert_eq!(cache.zincr_by("board", "alice", 3.5).await.unwrap(), 8.5);

    let top = cache.zrevrange_with_scores("board", 0, -1).await.unwrap();
    assert_eq!(
        top,
        vec![("alice".to_string(), 8.5), ("bob".to_string(), 7.0)]
    );

    let first = cache.zrevrange_with_scores("board", 0, 0).await.unwrap();
    assert_eq!(first.len(), 1);
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pipeline_batches_commands() {
    let cache = remote(&unique_prefix("pipe")).await;

    let mut pipe = cache.pipeline();
    assert!(!pipe.is_transactional());
    pipe.incr_by("count", 2)
        .incr_by("count", 3)
        .hincr_by("stats", "views", 1);
    pipe.hset("stats", "owner", "alice").unwrap();
    pipe.hexists("stats", "owner");
    assert_eq!(pipe.len(), 5);

    let (first, second, views, added, exists): (i64, i64, i64, bool, bool) =
        pipe.exec().await.unwrap();
    assert_eq!((first, second, views), (2, 5, 1));
    assert!(added);
    assert!(exists);

    assert_eq!(cache.hget::<String>("stats", "owner").await.unwrap(), "alice");
}

#[tokio::test]
async fn test_tx_pipeline_hset_expire_del() {
    let cache = remote(&unique_prefix("tx")).await;
    cache.set("stale", "old", Ttl::Persistent).await.unwrap();

    let mut tx = cache.tx_pipeline();
    assert!(tx.is_transactional());
    tx.hset("session", "user", "alice").unwrap();
    tx.hset_nx("session", "user", "mallory").unwrap();
    tx.expire("session", Ttl::from_secs(60)).del("stale");

    let (added, overwritten, expiring, deleted): (bool, bool, bool, i64) =
        tx.exec().await.unwrap();
    assert!(added);
    assert!(!overwritten);
    assert!(expiring);
    assert_eq!(deleted, 1);

    assert_eq!(cache.hget::<String>("session", "user").await.unwrap(), "alice");
    assert!(matches!(cache.ttl("session").await.unwrap(), KeyTtl::Expires(_)));
    assert!(!cache.exists("stale").await.unwrap());

    let mut read = cache.tx_pipeline();
    read.hgetall("session");
    let (fields,): (HashMap<String, Vec<u8>>,) = read.exec().await.unwrap();
    let user: String = serde_json::from_slice(&fields["user"]).unwrap();
    assert_eq!(user, "alice");
}

#[tokio::test]
async fn test_dropped_pipeline_sends_nothing() {
    let cache = remote(&unique_prefix("drop")).await;

    {
        let mut pipe = cache.tx_pipeline();
        pipe.incr_by("never", 1);
        pipe.hset("never_hash", "f", "v").unwrap();
    }

    assert!(!cache.exists("never").await.unwrap());
    assert!(!cache.exists("never_hash").await.unwrap());
}

#[tokio::test]
async fn test_tx_pipeline_discarded_on_queue_error() {
    let cache = remote(&unique_prefix("txabort")).await;
    cache.set("stale", "old", Ttl::Persistent).await.unwrap();

    let mut tx = cache.tx_pipeline();
    tx.hset("session", "user", "alice").unwrap();
    tx.expire("session", Ttl::from_secs(60)).del("stale");
    // HSET without field/value is rejected while queuing
    tx.command("HSET", "broken", Vec::<String>::new());

    let err = tx.exec::<()>().await.unwrap_err();
    assert!(matches!(err, CacheError::Redis(_)), "{err}");

    assert!(!cache.exists("session").await.unwrap());
    assert!(!cache.exists("broken").await.unwrap());
    assert_eq!(cache.get::<String>("stale").await.unwrap(), "old");
}

#[tokio::test]
async fn test_tx_pipeline_runtime_error_does_not_roll_back() {
    let cache = remote(&unique_prefix("txrun")).await;
    cache.set("name", "alice", Ttl::Persistent).await.unwrap();

    let mut tx = cache.tx_pipeline();
    tx.hset("profile", "city", "Oslo").unwrap();
    // Accepted while queuing, fails on execution: WRONGTYPE
    tx.hincr_by("name", "visits", 1);
    let _ = tx.exec::<redis::Value>().await;

    assert_eq!(cache.hget::<String>("profile", "city").await.unwrap(), "Oslo");
    assert_eq!(cache.get::<String>("name").await.unwrap(), "alice");
}

#[tokio::test]
async fn test_pipeline_command_is_prefixed() {
    let cache = remote(&unique_prefix("pcmd")).await;

    let mut pipe = cache.pipeline();
    pipe.command("SETRANGE", "greeting", (0, "hello"))
        .command("APPEND", "greeting", " world");
    let (len, total): (i64, i64) = pipe.exec().await.unwrap();
    assert_eq!((len, total), (5, 11));

    assert!(cache.exists("greeting").await.unwrap());
}

// ---------------------------------------------------------------------------
// Distributed mutex
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_mutex_exclusion() {
    let cache = remote(&unique_prefix("lock")).await;

    let mut first = cache.new_mutex_with("job", Duration::from_secs(10), MutexOptions::try_once());
    let mut second = cache.new_mutex_with("job", Duration::from_secs(10), MutexOptions::try_once());

    let (a, b) = tokio::join!(first.lock(), second.lock());
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "a={a:?} b={b:?}");

    let loser_err = if a.is_ok() { b.unwrap_err() } else { a.unwrap_err() };
    assert!(matches!(
        loser_err,
        CacheError::Lock(LockError::NotAcquired { tries: 1, .. })
    ));

    let (winner, loser) = if first.value().is_some() {
        (&mut first, &mut second)
    } else {
        (&mut second, &mut first)
    };
    assert!(winner.valid_until().is_some());
    assert!(loser.value().is_none());

    assert!(winner.unlock().await.unwrap());
    loser.lock().await.unwrap();
    assert!(loser.unlock().await.unwrap());
}

#[tokio::test]
async fn test_mutex_relock_keeps_first_acquisition() {
    let cache = remote(&unique_prefix("lock")).await;
    let mut mutex = cache.new_mutex("job", Duration::from_secs(10));

    mutex.lock().await.unwrap();
    let token = mutex.value().map(str::to_string);

    let err = mutex.lock().await.unwrap_err();
    assert!(matches!(err, CacheError::Lock(LockError::AlreadyHeld { .. })));
    assert_eq!(mutex.value().map(str::to_string), token);

    assert!(mutex.unlock().await.unwrap());
    assert!(!cache.exists("job").await.unwrap());
}

#[tokio::test]
async fn test_mutex_unlock_after_expiry_reports_loss() {
    let cache = remote(&unique_prefix("lock")).await;
    let mut short = cache.new_mutex("brief", Duration::from_millis(100));
    short.lock().await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;

    // Someone else may now take it; the stale holder must not delete their lock
    let mut next = cache.new_mutex_with("brief", Duration::from_secs(10), MutexOptions::try_once());
    next.lock().await.unwrap();

    assert!(!short.unlock().await.unwrap());
    assert!(cache.exists("brief").await.unwrap());
    assert!(next.unlock().await.unwrap());
}

#[tokio::test]
async fn test_mutex_extend() {
    let cache = remote(&unique_prefix("lock")).await;
    let mut mutex = cache.new_mutex("renewed", Duration::from_millis(300));
    mutex.lock().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(mutex.extend().await.unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Past the original expiry, still held thanks to the extension
    let mut rival = cache.new_mutex_with("renewed", Duration::from_secs(1), MutexOptions::try_once());
    assert!(rival.lock().await.is_err());
    assert!(mutex.unlock().await.unwrap());

    let mut idle = cache.new_mutex("never-locked", Duration::from_secs(1));
    assert!(matches!(
        idle.extend().await.unwrap_err(),
        CacheError::Lock(LockError::NotHeld { .. })
    ));
}

#[tokio::test]
async fn test_mutex_lock_timeout() {
    let cache = remote(&unique_prefix("lock")).await;
    let mut holder = cache.new_mutex("busy", Duration::from_secs(10));
    holder.lock().await.unwrap();

    let mut waiter = cache.new_mutex("busy", Duration::from_secs(10));
    let err = waiter
        .lock_timeout(Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Lock(LockError::Timeout { .. })));
    assert!(waiter.value().is_none());

    assert!(holder.unlock().await.unwrap());
}

// ---------------------------------------------------------------------------
// Combined cache
// ---------------------------------------------------------------------------

async fn combined_with_spy(prefix: &str) -> CombinedCache<SpyRemote> {
    let local = LocalCache::new(&LocalConfig {
        prefix: prefix.to_string(),
        ..Default::default()
    })
    .unwrap();
    let spy = SpyRemote {
        inner: remote(prefix).await,
        gets: AtomicU64::new(0),
    };
    CombinedCache::with_tiers(local, spy, RemoteWritePolicy::Strict)
}

#[tokio::test]
async fn test_combined_round_trip() {
    let cache = combined_with_spy(&unique_prefix("svc")).await;

    cache
        .set("profile", &serde_json::json!({"id": 7, "name": "alice"}), Ttl::from_secs(60))
        .await
        .unwrap();

    let value: serde_json::Value = cache.get("profile").await.unwrap();
    assert_eq!(value["name"], "alice");
    // Served from L1
    assert_eq!(cache.remote().gets(), 0);
}

#[tokio::test]
async fn test_combined_promotes_remote_hit() {
    let prefix = unique_prefix("svc");
    let cache = combined_with_spy(&prefix).await;

    // Written by another instance: present in Redis only
    let other = remote(&prefix).await;
    other
        .set("onlyOnRemote", "value_on_remote", Ttl::Persistent)
        .await
        .unwrap();

    let first: String = cache.get("onlyOnRemote").await.unwrap();
    assert_eq!(first, "value_on_remote");
    assert_eq!(cache.remote().gets(), 1);

    let second: String = cache.get("onlyOnRemote").await.unwrap();
    assert_eq!(second, "value_on_remote");
    assert_eq!(cache.remote().gets(), 1);
}

#[tokio::test]
async fn test_combined_delete_propagates() {
    let prefix = unique_prefix("svc");
    let cache = combined_with_spy(&prefix).await;
    cache.set("k", "v", Ttl::Persistent).await.unwrap();

    cache.delete("k").await.unwrap();

    assert!(cache.get::<String>("k").await.unwrap_err().is_not_found());
    assert!(!remote(&prefix).await.exists("k").await.unwrap());
}

#[tokio::test]
async fn test_combined_local_outlives_remote_ttl() {
    let prefix = unique_prefix("svc");
    let cache = combined_with_spy(&prefix).await;

    cache.set("k", "v", Ttl::from_millis(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Redis expired the key, the local copy is eviction-governed
    assert!(!remote(&prefix).await.exists("k").await.unwrap());
    assert_eq!(cache.get::<String>("k").await.unwrap(), "v");
    assert_eq!(cache.remote().gets(), 0);
}

#[tokio::test]
async fn test_combined_from_config() {
    let prefix = unique_prefix("global");
    let config = zcache::CombinedConfig {
        global_prefix: prefix.clone(),
        remote: remote_config("l2").await,
        ..Default::default()
    };
    let cache = CombinedCache::from_config(&config).unwrap();

    cache.set("k", &[1, 2, 3], Ttl::from_secs(60)).await.unwrap();

    let bare = remote("").await;
    assert!(bare.exists(&format!("{prefix}/l2/k")).await.unwrap());
    assert_eq!(cache.get::<Vec<i32>>("k").await.unwrap(), vec![1, 2, 3]);

    let stats = cache.stats();
    assert_eq!(stats.local.hits, 1);
    assert!(stats.remote.total_conns >= 1);
}

#[tokio::test]
async fn test_shared_remote_between_instances() {
    let prefix = unique_prefix("svc");
    let writer = Arc::new(combined_with_spy(&prefix).await);
    let reader = combined_with_spy(&prefix).await;

    writer.set("shared", &99u64, Ttl::from_secs(60)).await.unwrap();

    assert_eq!(reader.get::<u64>("shared").await.unwrap(), 99);
    assert_eq!(reader.remote().gets(), 1);
}
