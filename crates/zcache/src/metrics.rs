//! Metrics collaborator.
//!
//! The cache never talks to a metrics backend directly; the stats monitor
//! publishes through a [`MetricsSink`]. [`PrometheusMetrics`] is the stock
//! sink: it forwards to the `metrics` facade, which a
//! `metrics-exporter-prometheus` recorder turns into the text exposition
//! format (see [`init_prometheus`] and [`render_metrics`]).

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{Label, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use thiserror::Error;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic; updates carry the cumulative value.
    Counter,
    Gauge,
    Histogram,
}

/// Registration record for one metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDef {
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
    pub kind: MetricKind,
}

impl MetricDef {
    pub fn new(name: impl Into<String>, help: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: Vec::new(),
            kind,
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_names = labels.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metric already registered: {0}")]
    AlreadyRegistered(String),

    #[error("metric not registered: {0}")]
    NotRegistered(String),

    #[error("metric {name} expects {expected} label values, got {actual}")]
    LabelMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("failed to install metrics recorder: {0}")]
    Recorder(String),
}

/// Destination for published metrics.
pub trait MetricsSink: Send + Sync {
    /// Register a metric. Registering a name twice is an error.
    fn register_metric(&self, def: MetricDef) -> Result<(), MetricsError>;

    /// Publish a value; `label_values` are positional against the registered label names.
    fn update_metric(&self, name: &str, value: f64, label_values: &[&str]) -> Result<(), MetricsError>;
}

/// [`MetricsSink`] backed by the `metrics` facade.
///
/// Updates go to whatever recorder is installed at call time.
#[derive(Debug, Default)]
pub struct PrometheusMetrics {
    registry: DashMap<String, MetricDef>,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn register_metric(&self, def: MetricDef) -> Result<(), MetricsError> {
        match self.registry.entry(def.name.clone()) {
            Entry::Occupied(_) => Err(MetricsError::AlreadyRegistered(def.name)),
            Entry::Vacant(slot) => {
                let name = def.name.clone();
                let help = def.help.clone();
                match def.kind {
                    MetricKind::Counter => describe_counter!(name, help),
                    MetricKind::Gauge => describe_gauge!(name, help),
                    MetricKind::Histogram => describe_histogram!(name, help),
                }
                slot.insert(def);
                Ok(())
            }
        }
    }

    fn update_metric(&self, name: &str, value: f64, label_values: &[&str]) -> Result<(), MetricsError> {
        let def = self
            .registry
            .get(name)
            .ok_or_else(|| MetricsError::NotRegistered(name.to_string()))?;

        if def.label_names.len() != label_values.len() {
            return Err(MetricsError::LabelMismatch {
                name: name.to_string(),
                expected: def.label_names.len(),
                actual: label_values.len(),
            });
        }

        let labels: Vec<Label> = def
            .label_names
            .iter()
            .zip(label_values)
            .map(|(k, v)| Label::new(k.clone(), v.to_string()))
            .collect();

        match def.kind {
            MetricKind::Counter => counter!(def.name.clone(), labels).absolute(value as u64),
            MetricKind::Gauge => gauge!(def.name.clone(), labels).set(value),
            MetricKind::Histogram => histogram!(def.name.clone(), labels).record(value),
        }
        Ok(())
    }
}

/// Install a Prometheus recorder as the process-wide `metrics` recorder.
///
/// Idempotent: once installed, later calls return the same handle. Fails when
/// a different recorder already owns the process.
pub fn init_prometheus() -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Recorder(e.to_string()))?;
    tracing::info!("prometheus recorder installed");
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Current metrics in Prometheus text format, `None` before [`init_prometheus`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}
