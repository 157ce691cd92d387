//! Tracing bootstrap with a reloadable log level.
//!
//! Library code only emits `tracing` events; a host process that has no
//! subscriber of its own can install this one from its [`LoggingConfig`].

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber at `logging.level`; `RUST_LOG` overrides it.
///
/// Returns `false` when some subscriber is already installed, in which case
/// [`apply_logging_level`] has nothing to act on.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(&logging.level)),
        Err(_) => level_filter(&logging.level),
    };
    let (filter_layer, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER_HANDLE.set(handle);
        tracing::debug!(level = %logging.level, "tracing initialised");
    }
    installed
}

/// Swap the active filter. `false` if [`init_tracing`] never installed one.
pub fn apply_logging_level(level: &str) -> bool {
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    handle.reload(level_filter(level)).is_ok()
}
