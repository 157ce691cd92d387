use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::combined::RemoteWritePolicy;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyPrefix;

/// Top-level settings for a process embedding the cache.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub cache: CombinedConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;
        self.monitor.validate()?;
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

/// Local (L1) cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Key prefix applied to every local entry
    #[serde(default)]
    pub prefix: String,

    /// Number of keys tracked for admission frequency.
    /// Sized at ~10x the expected number of live entries.
    #[serde(default = "default_num_counters")]
    pub num_counters: u64,

    /// Total cost budget in bytes of encoded values
    #[serde(default = "default_max_cost")]
    pub max_cost: u64,

    /// Size of the per-shard write buffer
    #[serde(default = "default_buffer_items")]
    pub buffer_items: u64,
}

fn default_num_counters() -> u64 {
    10_000_000
}

fn default_max_cost() -> u64 {
    1 << 30
}

fn default_buffer_items() -> u64 {
    64
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            num_counters: default_num_counters(),
            max_cost: default_max_cost(),
            buffer_items: default_buffer_items(),
        }
    }
}

impl LocalConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.num_counters == 0 {
            return Err("local.num_counters must be > 0".into());
        }
        if self.max_cost == 0 {
            return Err("local.max_cost must be > 0".into());
        }
        if self.buffer_items == 0 {
            return Err("local.buffer_items must be > 0".into());
        }
        Ok(())
    }

    /// Expected number of live entries, used to pre-size the store.
    pub fn expected_entries(&self) -> usize {
        // Bounded so a huge counter budget does not pre-allocate gigabytes
        (self.num_counters / 10).min(1 << 20) as usize
    }
}

/// Remote (L2) Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Transport: "tcp" or "unix"
    #[serde(default = "default_network")]
    pub network: String,

    /// host:port for tcp, socket path for unix
    #[serde(default = "default_addr")]
    pub addr: String,

    /// ACL username (Redis 6+)
    #[serde(default)]
    pub username: Option<String>,

    /// Password; prefer ZCACHE__CACHE__REMOTE__PASSWORD over files
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Use TLS (rediss://)
    #[serde(default)]
    pub tls: bool,

    /// Key prefix applied to every remote key
    #[serde(default)]
    pub prefix: String,

    /// Timeout for opening a new connection
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Timeout for a command round trip
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Timeout for writing a command; folded into the round-trip deadline
    #[serde(default = "default_read_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Maximum number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connections opened eagerly by `RemoteCache::warm_up`
    #[serde(default)]
    pub min_idle_conns: usize,

    /// Retire connections older than this; 0 disables
    #[serde(default)]
    pub max_conn_age_ms: u64,

    /// How long a caller waits for a free connection
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,

    /// Retire connections idle longer than this; 0 disables
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How often idle connections are reaped; 0 disables the reaper
    #[serde(default = "default_idle_check_frequency_ms")]
    pub idle_check_frequency_ms: u64,
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_addr() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_pool_size() -> usize {
    10 * num_cpus::get()
}

fn default_pool_timeout_ms() -> u64 {
    default_read_timeout_ms() + 1000
}

fn default_idle_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_idle_check_frequency_ms() -> u64 {
    60 * 1000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            addr: default_addr(),
            username: None,
            password: None,
            db: 0,
            tls: false,
            prefix: String::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_read_timeout_ms(),
            pool_size: default_pool_size(),
            min_idle_conns: 0,
            max_conn_age_ms: 0,
            pool_timeout_ms: default_pool_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_check_frequency_ms: default_idle_check_frequency_ms(),
        }
    }
}

fn optional_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.addr.is_empty() {
            return Err("remote.addr must not be empty".into());
        }
        if !matches!(self.network.as_str(), "tcp" | "unix") {
            return Err(format!(
                "remote.network must be \"tcp\" or \"unix\", got {:?}",
                self.network
            ));
        }
        if self.network == "unix" && self.tls {
            return Err("remote.tls is not supported over unix sockets".into());
        }
        if self.db < 0 {
            return Err("remote.db must be >= 0".into());
        }
        if self.pool_size == 0 {
            return Err("remote.pool_size must be > 0".into());
        }
        if self.min_idle_conns > self.pool_size {
            return Err("remote.min_idle_conns must be <= remote.pool_size".into());
        }
        if self.dial_timeout_ms == 0 || self.read_timeout_ms == 0 || self.pool_timeout_ms == 0 {
            return Err("remote dial/read/pool timeouts must be > 0".into());
        }
        Ok(())
    }

    /// Build the connection URL understood by the redis client.
    pub fn connection_url(&self) -> CacheResult<String> {
        let enc = |s: &str| urlencoding::encode(s).into_owned();
        match self.network.as_str() {
            "tcp" => {
                let scheme = if self.tls { "rediss" } else { "redis" };
                let auth = match (self.username.as_deref(), self.password.as_deref()) {
                    (Some(user), Some(pass)) => format!("{}:{}@", enc(user), enc(pass)),
                    (None, Some(pass)) => format!(":{}@", enc(pass)),
                    (Some(user), None) => format!("{}@", enc(user)),
                    (None, None) => String::new(),
                };
                Ok(format!("{scheme}://{auth}{}/{}", self.addr, self.db))
            }
            "unix" => {
                let mut url = format!("redis+unix://{}?db={}", self.addr, self.db);
                if let Some(user) = self.username.as_deref() {
                    url.push_str(&format!("&user={}", enc(user)));
                }
                if let Some(pass) = self.password.as_deref() {
                    url.push_str(&format!("&pass={}", enc(pass)));
                }
                Ok(url)
            }
            other => Err(CacheError::config(format!(
                "unsupported remote.network {other:?}"
            ))),
        }
    }

    /// URL with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        let masked = Self {
            password: self.password.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        };
        masked
            .connection_url()
            .unwrap_or_else(|_| format!("{}://{}", self.network, self.addr))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Deadline for one command round trip (write plus read).
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(self.write_timeout_ms))
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn max_conn_age(&self) -> Option<Duration> {
        optional_ms(self.max_conn_age_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        optional_ms(self.idle_timeout_ms)
    }

    pub fn idle_check_frequency(&self) -> Option<Duration> {
        optional_ms(self.idle_check_frequency_ms)
    }
}

/// Two-tier cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CombinedConfig {
    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    /// Whether a failing remote write/delete fails the call
    #[serde(default)]
    pub remote_write_policy: RemoteWritePolicy,

    /// Prefix prepended to both tier prefixes
    #[serde(default)]
    pub global_prefix: String,
}

impl CombinedConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.local.validate()?;
        self.remote.validate()
    }

    /// Local configuration with the global prefix applied.
    pub fn effective_local(&self) -> LocalConfig {
        LocalConfig {
            prefix: KeyPrefix::join(&self.global_prefix, &self.local.prefix).to_string(),
            ..self.local.clone()
        }
    }

    /// Remote configuration with the global prefix applied.
    pub fn effective_remote(&self) -> RemoteConfig {
        RemoteConfig {
            prefix: KeyPrefix::join(&self.global_prefix, &self.remote.prefix).to_string(),
            ..self.remote.clone()
        }
    }
}

/// Stats monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Polling interval in milliseconds
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    /// Value of the `cache` label on every published metric
    #[serde(default = "default_cache_name")]
    pub cache_name: String,
}

fn default_monitor_interval_ms() -> u64 {
    60 * 1000
}

fn default_cache_name() -> String {
    "default".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            cache_name: default_cache_name(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_ms == 0 {
            return Err("monitor.interval_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::Settings;
    use crate::error::{CacheError, CacheResult};
    use ::config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Load settings from an optional TOML file plus `ZCACHE__*` overrides.
    ///
    /// e.g. `ZCACHE__CACHE__REMOTE__ADDR=redis:6379`
    pub fn load_config(path: Option<&str>) -> CacheResult<Settings> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("zcache.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        builder = builder.add_source(
            Environment::with_prefix("ZCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| CacheError::config(format!("config build error: {e}")))?;
        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| CacheError::config(format!("config deserialize error: {e}")))?;
        settings.validate().map_err(CacheError::Config)?;
        Ok(settings)
    }
}
