//! Caller-constructed configuration (SPEC_FULL.md §1/§3/§6).
//!
//! No I/O happens while building a [`CoreConfig`]; reading environment
//! variables to pick a default `data_root` is a separate pure helper a
//! front-end may call, mirroring the teacher's split between `ConfigManager`
//! (reads a path it's given) and whatever resolves that path in the first
//! place.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_root: PathBuf,
    pub avoid_recent: Duration,
    pub cooldown_floor_score: f64,
    pub throttle_interval: Duration,
    pub auto_sync_timeout: Duration,
    pub connect_timeout: Duration,
    pub sync_timeout: Duration,
    pub history_cap: usize,
    pub queue_gc_age: Duration,
}

impl CoreConfig {
    pub fn default_at(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            avoid_recent: Duration::from_secs(30 * 60),
            cooldown_floor_score: -9_000.0,
            throttle_interval: Duration::from_secs(30),
            auto_sync_timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(5 * 60),
            history_cap: 200,
            queue_gc_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// `$XDG_DATA_HOME/caam` or `~/.local/share/caam`. A front-end convenience;
/// `CoreConfig` never calls this implicitly.
pub fn default_data_root() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("caam");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".local").join("share").join("caam");
        }
    }
    PathBuf::from(".").join("caam")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_at_sets_documented_defaults() {
        let config = CoreConfig::default_at("/tmp/caam-test");
        assert_eq!(config.avoid_recent, Duration::from_secs(1800));
        assert_eq!(config.cooldown_floor_score, -9_000.0);
        assert_eq!(config.history_cap, 200);
        assert_eq!(config.queue_gc_age, Duration::from_secs(86_400));
    }
}
