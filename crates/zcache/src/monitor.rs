//! Background stats publisher.
//!
//! Polls a [`StatsSource`] on a fixed interval and republishes every counter
//! of the [`ZCacheStats`] snapshot into a [`MetricsSink`], labelled with the
//! configured cache name.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::metrics::{MetricDef, MetricKind, MetricsError, MetricsSink};
use crate::stats::{StatsSource, ZCacheStats};

/// Label carrying [`MonitorConfig::cache_name`].
pub const CACHE_LABEL: &str = "cache";

struct StatMetric {
    name: &'static str,
    help: &'static str,
    kind: MetricKind,
    read: fn(&ZCacheStats) -> u64,
}

const STAT_METRICS: &[StatMetric] = &[
    StatMetric {
        name: "zcache_local_hits_total",
        help: "Local cache lookups that found a live entry",
        kind: MetricKind::Counter,
        read: |s| s.local.hits,
    },
    StatMetric {
        name: "zcache_local_misses_total",
        help: "Local cache lookups that found nothing",
        kind: MetricKind::Counter,
        read: |s| s.local.misses,
    },
    StatMetric {
        name: "zcache_local_del_hits_total",
        help: "Local deletes that removed an entry",
        kind: MetricKind::Counter,
        read: |s| s.local.del_hits,
    },
    StatMetric {
        name: "zcache_local_del_misses_total",
        help: "Local deletes of absent keys",
        kind: MetricKind::Counter,
        read: |s| s.local.del_misses,
    },
    StatMetric {
        name: "zcache_local_collisions_total",
        help: "Local entries overwritten in place",
        kind: MetricKind::Counter,
        read: |s| s.local.collisions,
    },
    StatMetric {
        name: "zcache_local_evictions_total",
        help: "Local entries evicted for capacity or expiry",
        kind: MetricKind::Counter,
        read: |s| s.local.evictions,
    },
    StatMetric {
        name: "zcache_remote_pool_hits_total",
        help: "Redis checkouts served by an idle pooled connection",
        kind: MetricKind::Counter,
        read: |s| s.remote.pool_hits,
    },
    StatMetric {
        name: "zcache_remote_pool_misses_total",
        help: "Redis checkouts that had to dial or wait",
        kind: MetricKind::Counter,
        read: |s| s.remote.pool_misses,
    },
    StatMetric {
        name: "zcache_remote_timeouts_total",
        help: "Redis checkouts or commands that hit their deadline",
        kind: MetricKind::Counter,
        read: |s| s.remote.timeouts,
    },
    StatMetric {
        name: "zcache_remote_conns",
        help: "Open Redis connections",
        kind: MetricKind::Gauge,
        read: |s| s.remote.total_conns,
    },
    StatMetric {
        name: "zcache_remote_idle_conns",
        help: "Idle Redis connections",
        kind: MetricKind::Gauge,
        read: |s| s.remote.idle_conns,
    },
    StatMetric {
        name: "zcache_remote_stale_conns_total",
        help: "Redis connections retired for age or idleness",
        kind: MetricKind::Counter,
        read: |s| s.remote.stale_conns,
    },
];

/// Periodic republisher of cache statistics.
pub struct StatsMonitor {
    source: Arc<dyn StatsSource>,
    sink: Arc<dyn MetricsSink>,
    config: MonitorConfig,
}

impl StatsMonitor {
    pub fn new(
        source: Arc<dyn StatsSource>,
        sink: Arc<dyn MetricsSink>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            source,
            sink,
            config,
        }
    }

    /// Names of every metric the monitor publishes.
    pub fn metric_names() -> impl Iterator<Item = &'static str> {
        STAT_METRICS.iter().map(|m| m.name)
    }

    /// Register every stat metric with the sink.
    ///
    /// A name that is already registered is logged and skipped, so several
    /// monitors can share one sink.
    pub fn register_metrics(&self) {
        for metric in STAT_METRICS {
            let def = MetricDef::new(metric.name, metric.help, metric.kind).with_labels([CACHE_LABEL]);
            match self.sink.register_metric(def) {
                Ok(()) => {}
                Err(MetricsError::AlreadyRegistered(name)) => {
                    debug!(metric = %name, "metric already registered");
                }
                Err(e) => warn!(metric = metric.name, error = %e, "failed to register metric"),
            }
        }
    }

    /// Take one snapshot and publish it.
    pub fn publish_once(&self) {
        let stats = self.source.cache_stats();
        let labels = [self.config.cache_name.as_str()];
        for metric in STAT_METRICS {
            let value = (metric.read)(&stats) as f64;
            if let Err(e) = self.sink.update_metric(metric.name, value, &labels) {
                warn!(metric = metric.name, error = %e, "failed to publish metric");
            }
        }
    }

    /// Start publishing in a background task.
    ///
    /// Returns a shutdown sender; send `true` to stop the task.
    pub fn start(self) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            self.register_metrics();
            info!(
                interval_ms = self.config.interval_ms,
                cache = %self.config.cache_name,
                "Stats monitor started"
            );

            // tokio panics on a zero period
            let mut ticker = interval(self.config.interval().max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.publish_once(),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!(cache = %self.config.cache_name, "Stats monitor shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}
