//! Runtime configuration. Defaults are overridable through `KCTL_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecreateConfig {
    /// Upper bound on waiting for a delete to be observed.
    pub deletion_timeout: Duration,
    /// Appended to the name of the dry-run validation copy.
    pub validate_suffix: String,
    /// Grace period used when removing orphaned dependents.
    pub sweep_grace_seconds: u32,
    /// Serialize concurrent updates to the same `kind/namespace/name` within this process.
    pub serialize_updates: bool,
    pub default_namespace: String,
    /// Capacity of the channel between a watch and its listener.
    pub event_buffer: usize,
}

impl Default for RecreateConfig {
    fn default() -> Self {
        Self {
            deletion_timeout: Duration::from_secs(30),
            validate_suffix: "-validate".to_string(),
            sweep_grace_seconds: 0,
            serialize_updates: true,
            default_namespace: "default".to_string(),
            event_buffer: 64,
        }
    }
}

impl RecreateConfig {
    /// Shortest deletion wait accepted from any source.
    pub const MIN_DELETION_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn clamp_timeout(timeout: Duration) -> Duration {
        timeout.max(Self::MIN_DELETION_TIMEOUT)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(secs) = parsed::<u64>(&lookup, "KCTL_DELETE_TIMEOUT_SECS") {
            cfg.deletion_timeout = Self::clamp_timeout(Duration::from_secs(secs));
        }
        if let Some(s) = lookup("KCTL_VALIDATE_SUFFIX").filter(|s| !s.is_empty()) {
            cfg.validate_suffix = s;
        }
        if let Some(g) = parsed::<u32>(&lookup, "KCTL_SWEEP_GRACE_SECS") {
            cfg.sweep_grace_seconds = g;
        }
        if let Some(v) = lookup("KCTL_SERIALIZE_UPDATES") {
            cfg.serialize_updates = !(v == "0" || v.eq_ignore_ascii_case("false"));
        }
        if let Some(ns) = lookup("KCTL_NAMESPACE").filter(|s| !s.is_empty()) {
            cfg.default_namespace = ns;
        }
        if let Some(n) = parsed::<usize>(&lookup, "KCTL_EVENT_BUFFER") {
            cfg.event_buffer = n.max(1);
        }
        cfg
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid config value");
            None
        }
    }
}
