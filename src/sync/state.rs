//! Sync state: identity, peer pool, retry queue, operation history
//! (SPEC_FULL.md §3, §4.6). Four atomic-written JSON files loaded once per
//! session, saved after every mutating call.

use crate::atomic;
use crate::error::{CaamError, Result};
use crate::machines::DiscoverySource;
use crate::provider::Provider;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Online,
    Offline,
    Syncing,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub ssh_user: String,
    pub ssh_key_path: Option<PathBuf>,
    pub remote_vault_path: PathBuf,
    pub status: MachineStatus,
    pub last_sync: Option<i64>,
    pub last_error: Option<String>,
    pub added_at: i64,
    pub source: DiscoverySource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPool {
    pub local_machine_id: Option<Uuid>,
    pub machines: HashMap<Uuid, Machine>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_sync: bool,
    pub last_full_sync: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Push,
    Pull,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Backup,
    Refresh,
    Manual,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub provider: Provider,
    pub profile: String,
    pub machine_id: Uuid,
    pub added_at: i64,
    pub attempts: u32,
    pub last_attempt: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub trigger: SyncTrigger,
    pub provider: Provider,
    pub profile: String,
    pub machine_name: String,
    pub action: SyncAction,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Identity {
    machine_id: Uuid,
    machine_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueFile {
    entries: Vec<QueueEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryFile {
    entries: VecDeque<HistoryEntry>,
}

/// Owns the four persisted files under `<data_root>/sync/`. Reads take
/// `&self`; `save` takes `&mut self` so the type itself prevents two
/// concurrent saves of the same state (SPEC_FULL §5).
pub struct SyncState {
    root: PathBuf,
    history_cap: usize,
    identity: Identity,
    pool: SyncPool,
    queue: Vec<QueueEntry>,
    history: VecDeque<HistoryEntry>,
}

fn identity_path(root: &Path) -> PathBuf {
    root.join("identity.json")
}
fn pool_path(root: &Path) -> PathBuf {
    root.join("pool.json")
}
fn queue_path(root: &Path) -> PathBuf {
    root.join("queue.json")
}
fn history_path(root: &Path) -> PathBuf {
    root.join("history.json")
}

fn read_json_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Ok(T::default());
    }
    let bytes = std::fs::read(path).map_err(|e| CaamError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| CaamError::corruption(format!("parsing {}: {e}", path.display())))
}

impl SyncState {
    /// Load from `<data_root>/sync/`, creating a fresh identity (random
    /// machine id) if `identity.json` does not yet exist.
    pub fn load(data_root: &Path, local_machine_name: &str, history_cap: usize, now: i64) -> Result<Self> {
        let root = data_root.join("sync");
        let identity: Identity = if identity_path(&root).is_file() {
            read_json_or_default(&identity_path(&root))?
        } else {
            Identity { machine_id: Uuid::new_v4(), machine_name: local_machine_name.to_string() }
        };
        let pool: SyncPool = read_json_or_default(&pool_path(&root))?;
        let queue_file: QueueFile = read_json_or_default(&queue_path(&root))?;
        let history_file: HistoryFile = read_json_or_default(&history_path(&root))?;
        let _ = now;

        Ok(Self { root, history_cap, identity, pool, queue: queue_file.entries, history: history_file.entries })
    }

    pub fn local_machine_id(&self) -> Uuid {
        self.identity.machine_id
    }

    pub fn pool(&self) -> &SyncPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut SyncPool {
        &mut self.pool
    }

    pub fn queue(&self) -> &[QueueEntry] {
        &self.queue
    }

    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    /// Upsert by `(provider, profile, machine_id)`: a second failure for the
    /// same key increments `attempts` and updates `last_*` instead of adding
    /// a duplicate row.
    pub fn upsert_queue_entry(&mut self, provider: Provider, profile: &str, machine_id: Uuid, now: i64, error: Option<String>) {
        if let Some(existing) = self
            .queue
            .iter_mut()
            .find(|e| e.provider == provider && e.profile == profile && e.machine_id == machine_id)
        {
            existing.attempts += 1;
            existing.last_attempt = now;
            existing.last_error = error;
        } else {
            self.queue.push(QueueEntry {
                provider,
                profile: profile.to_string(),
                machine_id,
                added_at: now,
                attempts: 1,
                last_attempt: now,
                last_error: error,
            });
        }
    }

    pub fn remove_queue_entry(&mut self, provider: Provider, profile: &str, machine_id: Uuid) {
        self.queue.retain(|e| !(e.provider == provider && e.profile == profile && e.machine_id == machine_id));
    }

    /// Drop entries older than `max_age_secs`, run before every drain cycle.
    pub fn gc_queue(&mut self, now: i64, max_age_secs: i64) {
        self.queue.retain(|e| now - e.added_at < max_age_secs);
    }

    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push_back(entry);
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
    }

    pub async fn save(&mut self) -> Result<()> {
        atomic::create_dir_all(&self.root)?;
        atomic::write_async(&identity_path(&self.root), serde_json::to_vec_pretty(&self.identity).unwrap()).await?;
        atomic::write_async(&pool_path(&self.root), serde_json::to_vec_pretty(&self.pool).unwrap()).await?;
        let queue_file = QueueFile { entries: self.queue.clone() };
        atomic::write_async(&queue_path(&self.root), serde_json::to_vec_pretty(&queue_file).unwrap()).await?;
        let history_file = HistoryFile { entries: self.history.clone() };
        atomic::write_async(&history_path(&self.root), serde_json::to_vec_pretty(&history_file).unwrap()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_increments_attempts_on_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SyncState::load(dir.path(), "local", 200, 0).unwrap();
        let machine_id = Uuid::new_v4();
        state.upsert_queue_entry(Provider::Codex, "work", machine_id, 100, Some("timeout".into()));
        state.upsert_queue_entry(Provider::Codex, "work", machine_id, 200, Some("timeout again".into()));

        assert_eq!(state.queue().len(), 1);
        assert_eq!(state.queue()[0].attempts, 2);
        assert_eq!(state.queue()[0].last_attempt, 200);
    }

    #[test]
    fn gc_queue_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SyncState::load(dir.path(), "local", 200, 0).unwrap();
        state.upsert_queue_entry(Provider::Claude, "old", Uuid::new_v4(), 0, None);
        state.upsert_queue_entry(Provider::Claude, "fresh", Uuid::new_v4(), 1_000_000, None);

        state.gc_queue(1_000_100, 86_400);
        assert_eq!(state.queue().len(), 1);
        assert_eq!(state.queue()[0].profile, "fresh");
    }

    #[test]
    fn history_trims_to_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SyncState::load(dir.path(), "local", 2, 0).unwrap();
        for i in 0..5 {
            state.push_history(HistoryEntry {
                timestamp: i,
                trigger: SyncTrigger::Manual,
                provider: Provider::Gemini,
                profile: "p".into(),
                machine_name: "peer".into(),
                action: SyncAction::Push,
                success: true,
                error: None,
                duration_ms: 10,
            });
        }
        assert_eq!(state.history().len(), 2);
        assert_eq!(state.history().front().unwrap().timestamp, 3);
    }

    #[tokio::test]
    async fn save_then_load_round_trips_identity_and_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SyncState::load(dir.path(), "laptop", 200, 0).unwrap();
        state.pool_mut().enabled = true;
        state.pool_mut().auto_sync = true;
        let id = state.local_machine_id();
        state.save().await.unwrap();

        let reloaded = SyncState::load(dir.path(), "laptop", 200, 0).unwrap();
        assert_eq!(reloaded.local_machine_id(), id);
        assert!(reloaded.pool().enabled);
        assert!(reloaded.pool().auto_sync);
    }
}
