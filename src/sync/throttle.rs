//! Auto-sync throttle (SPEC_FULL.md §4.7, §9 "Global throttler" design note).
//!
//! An explicit struct the caller constructs once and plumbs into every call
//! site capable of triggering auto-sync — never a `static`/`OnceLock`
//! singleton, per the spec's re-architecture directive.

use crate::provider::Provider;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct Throttler {
    last_fire: Mutex<HashMap<(Provider, String), Instant>>,
}

impl Throttler {
    pub fn new() -> Self {
        Self { last_fire: Mutex::new(HashMap::new()) }
    }

    /// Records the attempt timestamp immediately, before the caller even
    /// starts a sync, so a failing sync cannot retry-storm within the
    /// interval (SPEC_FULL §4.7 step 3).
    pub fn check_and_record(&self, provider: Provider, profile: &str, interval: Duration) -> bool {
        let key = (provider, profile.to_string());
        let now = Instant::now();
        let mut last_fire = self.last_fire.lock().unwrap();
        match last_fire.get(&key) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                last_fire.insert(key, now);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn reset(&self) {
        self.last_fire.lock().unwrap().clear();
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn only_one_fire_per_interval_per_key() {
        let throttler = Throttler::new();
        let interval = Duration::from_millis(50);
        assert!(throttler.check_and_record(Provider::Codex, "work", interval));
        assert!(!throttler.check_and_record(Provider::Codex, "work", interval));
        sleep(Duration::from_millis(60));
        assert!(throttler.check_and_record(Provider::Codex, "work", interval));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let throttler = Throttler::new();
        let interval = Duration::from_secs(30);
        assert!(throttler.check_and_record(Provider::Claude, "a", interval));
        assert!(throttler.check_and_record(Provider::Claude, "b", interval));
    }

    #[test]
    fn reset_clears_recorded_timestamps() {
        let throttler = Throttler::new();
        let interval = Duration::from_secs(30);
        assert!(throttler.check_and_record(Provider::Gemini, "p", interval));
        throttler.reset();
        assert!(throttler.check_and_record(Provider::Gemini, "p", interval));
    }
}
