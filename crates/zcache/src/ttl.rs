//! Entry lifetimes.

use std::time::Duration;

/// Lifetime requested for a cache entry.
///
/// `Persistent` is the "no expiry" sentinel. Its meaning is tier specific:
/// the local tier still evicts under capacity pressure, while Redis keeps the
/// key until it is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Ttl {
    #[default]
    Persistent,
    Expires(Duration),
}

impl Ttl {
    /// A zero duration maps to `Persistent`, matching the non-positive sentinel.
    pub fn after(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::Persistent
        } else {
            Self::Expires(duration)
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::after(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::after(Duration::from_millis(millis))
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Persistent => None,
            Self::Expires(d) => Some(*d),
        }
    }

    /// Milliseconds for `PX`/`PEXPIRE`, rounded up so sub-millisecond lifetimes
    /// never become zero.
    pub(crate) fn as_millis(&self) -> Option<u64> {
        self.duration().map(|d| {
            let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
            if ms == 0 { 1 } else { ms }
        })
    }
}

impl From<Option<Duration>> for Ttl {
    fn from(value: Option<Duration>) -> Self {
        value.map_or(Self::Persistent, Self::after)
    }
}

/// Remaining lifetime of a key as reported by Redis `PTTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after this duration.
    Expires(Duration),
}

impl KeyTtl {
    pub(crate) fn from_pttl(pttl: i64) -> Self {
        match pttl {
            -2 => Self::Missing,
            n if n < 0 => Self::Persistent,
            n => Self::Expires(Duration::from_millis(n as u64)),
        }
    }
}
