//! Key namespacing shared by both cache tiers.
//!
//! Callers always work with logical keys. Each tier owns a [`KeyPrefix`] and
//! maps logical keys to full keys (`prefix/key`) right before talking to its
//! store, so the prefix never leaks above the tier boundary.

use std::fmt;

/// Separator placed between a prefix and a logical key.
pub const KEY_SEPARATOR: char = '/';

/// A fixed, per-instance key prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    /// Create a prefix. An empty string disables prefixing.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// Compose a global prefix with a tier prefix, skipping empty parts.
    ///
    /// `join("app", "users")` yields `app/users`; `join("", "users")` yields `users`.
    pub fn join(global: &str, tier: &str) -> Self {
        match (global.is_empty(), tier.is_empty()) {
            (true, _) => Self::new(tier),
            (false, true) => Self::new(global),
            (false, false) => Self::new(format!("{global}{KEY_SEPARATOR}{tier}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Map a logical key to the key stored in the backing tier.
    pub fn full_key(&self, key: &str) -> String {
        if self.0.is_empty() {
            key.to_string()
        } else {
            format!("{}{KEY_SEPARATOR}{key}", self.0)
        }
    }

    /// Map a batch of logical keys.
    pub fn full_keys<S: AsRef<str>>(&self, keys: &[S]) -> Vec<String> {
        keys.iter().map(|k| self.full_key(k.as_ref())).collect()
    }

    /// Recover the logical key from a full key.
    ///
    /// Keys outside this namespace are returned unchanged.
    pub fn strip<'a>(&self, full_key: &'a str) -> &'a str {
        if self.0.is_empty() {
            return full_key;
        }
        full_key
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix(KEY_SEPARATOR))
            .unwrap_or(full_key)
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyPrefix {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for KeyPrefix {
    fn from(value: String) -> Self {
        Self(value)
    }
}
