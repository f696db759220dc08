//! Append-only event log and cooldown logic (SPEC_FULL.md §4.2).
//!
//! One NDJSON file per `(provider, profile)` pair under
//! `<data_root>/events/<provider>/<profile>.ndjson`, so `last_activation` and
//! `active_cooldown` never scan events for unrelated profiles. Appends are
//! serialised per-file so ordering matches the order `log()` returns
//! (SPEC_FULL §5).

use crate::error::{CaamError, Result};
use crate::provider::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Activate,
    Refresh,
    CooldownSet,
    CooldownClear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub provider: Provider,
    pub profile: String,
    /// Cooldown duration in seconds, set only for `cooldown_set`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_duration_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Event {
    pub fn activate(provider: Provider, profile: &str, now: i64) -> Self {
        Self { timestamp: now, event_type: EventType::Activate, provider, profile: profile.into(), cooldown_duration_secs: None, reason: None }
    }

    pub fn refresh(provider: Provider, profile: &str, now: i64) -> Self {
        Self { timestamp: now, event_type: EventType::Refresh, provider, profile: profile.into(), cooldown_duration_secs: None, reason: None }
    }

    pub fn cooldown_set(provider: Provider, profile: &str, now: i64, duration_secs: i64, reason: &str) -> Self {
        Self {
            timestamp: now,
            event_type: EventType::CooldownSet,
            provider,
            profile: profile.into(),
            cooldown_duration_secs: Some(duration_secs),
            reason: Some(reason.into()),
        }
    }

    pub fn cooldown_clear(provider: Provider, profile: &str, now: i64) -> Self {
        Self { timestamp: now, event_type: EventType::CooldownClear, provider, profile: profile.into(), cooldown_duration_secs: None, reason: None }
    }
}

pub struct EventStore {
    root: PathBuf,
    /// One mutex per `(provider, profile)` file, created on first access, so
    /// concurrent appends to the same file serialise without blocking
    /// unrelated profiles.
    locks: Mutex<HashMap<(Provider, String), std::sync::Arc<Mutex<()>>>>,
}

impl EventStore {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self { root: data_root.into().join("events"), locks: Mutex::new(HashMap::new()) }
    }

    fn file_path(&self, provider: Provider, profile: &str) -> PathBuf {
        self.root.join(provider.as_str()).join(format!("{profile}.ndjson"))
    }

    fn file_lock(&self, provider: Provider, profile: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry((provider, profile.to_string()))
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_all(&self, provider: Provider, profile: &str) -> Result<Vec<Event>> {
        let path = self.file_path(provider, profile);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| CaamError::io(&path, e))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| CaamError::corruption(format!("parsing event log line: {e}"))))
            .collect()
    }

    /// Append `event`, returning the 0-based append position (the
    /// "storage-assigned id" the spec requires for total ordering).
    pub fn log(&self, event: Event) -> Result<usize> {
        let lock = self.file_lock(event.provider, &event.profile);
        let _guard = lock.lock().unwrap();

        let path = self.file_path(event.provider, &event.profile);
        if let Some(parent) = path.parent() {
            crate::atomic::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&event)
            .map_err(|e| CaamError::Internal(format!("serializing event: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CaamError::io(&path, e))?;
        writeln!(file, "{line}").map_err(|e| CaamError::io(&path, e))?;
        file.sync_data().map_err(|e| CaamError::io(&path, e))?;

        let count = self.read_all(event.provider, &event.profile)?.len();
        Ok(count.saturating_sub(1))
    }

    /// The timestamp of the most recent `activate` event, scanning by type —
    /// never "last N events then filter" (SPEC_FULL §4.2's critical
    /// correctness contract).
    pub fn last_activation(&self, provider: Provider, profile: &str) -> Result<Option<i64>> {
        let events = self.read_all(provider, profile)?;
        Ok(events
            .into_iter()
            .filter(|e| e.event_type == EventType::Activate)
            .map(|e| e.timestamp)
            .max())
    }

    /// The most recent `cooldown_set` whose interval contains `now` and
    /// which has no superseding `cooldown_set`/`cooldown_clear` after it.
    pub fn active_cooldown(&self, provider: Provider, profile: &str, now: i64) -> Result<Option<Event>> {
        let events = self.read_all(provider, profile)?;
        let mut last_cooldown: Option<Event> = None;
        for event in events {
            match event.event_type {
                EventType::CooldownSet => last_cooldown = Some(event),
                EventType::CooldownClear => last_cooldown = None,
                _ => {}
            }
        }
        Ok(last_cooldown.filter(|e| {
            let duration = e.cooldown_duration_secs.unwrap_or(0);
            now >= e.timestamp && now < e.timestamp + duration
        }))
    }

    pub fn list_active_cooldowns(&self, providers_and_profiles: &[(Provider, String)], now: i64) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        for (provider, profile) in providers_and_profiles {
            if let Some(event) = self.active_cooldown(*provider, profile, now)? {
                out.push(event);
            }
        }
        Ok(out)
    }

    pub fn clear_cooldown(&self, provider: Provider, profile: &str, now: i64) -> Result<()> {
        self.log(Event::cooldown_clear(provider, profile, now))?;
        Ok(())
    }

    pub fn clear_all_cooldowns(&self, providers_and_profiles: &[(Provider, String)], now: i64) -> Result<()> {
        for (provider, profile) in providers_and_profiles {
            self.clear_cooldown(*provider, profile, now)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn events_for_test(&self, provider: Provider, profile: &str) -> Result<Vec<Event>> {
        self.read_all(provider, profile)
    }
}

pub fn root_path(data_root: &Path) -> PathBuf {
    data_root.join("events")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;

    #[test]
    fn last_activation_ignores_intervening_non_activation_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.log(Event::activate(Provider::Codex, "p", 100)).unwrap();
        for i in 0..50 {
            store.log(Event::cooldown_set(Provider::Codex, "p", 200 + i, 60, "rate limited")).unwrap();
            store.log(Event::cooldown_clear(Provider::Codex, "p", 201 + i)).unwrap();
        }
        assert_eq!(store.last_activation(Provider::Codex, "p").unwrap(), Some(100));
    }

    #[test]
    fn active_cooldown_respects_interval_and_supersession() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.log(Event::cooldown_set(Provider::Claude, "p", 1000, 60, "rl")).unwrap();

        assert!(store.active_cooldown(Provider::Claude, "p", 1030).unwrap().is_some());
        assert!(store.active_cooldown(Provider::Claude, "p", 1060).unwrap().is_none());

        store.log(Event::cooldown_clear(Provider::Claude, "p", 1020)).unwrap();
        assert!(store.active_cooldown(Provider::Claude, "p", 1030).unwrap().is_none());
    }

    #[test]
    fn new_cooldown_supersedes_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.log(Event::cooldown_set(Provider::Gemini, "p", 1000, 60, "first")).unwrap();
        store.log(Event::cooldown_set(Provider::Gemini, "p", 1010, 600, "second")).unwrap();

        let active = store.active_cooldown(Provider::Gemini, "p", 1200).unwrap().unwrap();
        assert_eq!(active.reason.as_deref(), Some("second"));
    }

    #[test]
    fn events_for_unrelated_profile_do_not_leak() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.log(Event::activate(Provider::Codex, "a", 100)).unwrap();
        store.log(Event::activate(Provider::Codex, "b", 200)).unwrap();
        assert_eq!(store.last_activation(Provider::Codex, "a").unwrap(), Some(100));
        assert_eq!(store.last_activation(Provider::Codex, "b").unwrap(), Some(200));
    }
}
