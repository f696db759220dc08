//! Sync engine: per-peer plan + execute, queue/history updates
//! (SPEC_FULL.md §4.6).

use super::state::{HistoryEntry, Machine, SyncAction, SyncState, SyncTrigger};
use crate::error::{CaamError, Result};
use crate::freshness::{self, FileSet, Freshness};
use crate::provider::Provider;
use crate::ssh::{ConnectTarget, ConnectionPool};
use crate::vault::Vault;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub provider: Provider,
    pub profile: String,
    pub machine_id: Uuid,
    pub action: SyncAction,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub results: Vec<SyncResult>,
    pub cancelled: bool,
}

enum Presence<'a> {
    Missing,
    Present(&'a Freshness),
    Error(&'a CaamError),
}

fn classify(result: &Result<Freshness>) -> Presence<'_> {
    match result {
        Ok(f) => Presence::Present(f),
        Err(e) if e.is_not_found() => Presence::Missing,
        Err(e) => Presence::Error(e),
    }
}

/// The decision table from SPEC_FULL §4.6.
fn plan(local: &Result<Freshness>, remote: &Result<Freshness>) -> Result<SyncAction> {
    match (classify(local), classify(remote)) {
        (Presence::Error(e), _) => Err(CaamError::corruption(format!("local freshness error: {e}"))),
        (_, Presence::Error(e)) => Err(CaamError::corruption(format!("remote freshness error: {e}"))),
        (Presence::Missing, Presence::Missing) => Ok(SyncAction::Skip),
        (Presence::Missing, Presence::Present(_)) => Ok(SyncAction::Pull),
        (Presence::Present(_), Presence::Missing) => Ok(SyncAction::Push),
        (Presence::Present(l), Presence::Present(r)) => {
            if freshness::fresher(Some(l), Some(r)) {
                Ok(SyncAction::Push)
            } else if freshness::fresher(Some(r), Some(l)) {
                Ok(SyncAction::Pull)
            } else {
                Ok(SyncAction::Skip)
            }
        }
    }
}

fn remote_profile_dir(machine: &Machine, provider: Provider, profile: &str) -> String {
    format!("{}/{}/{}", machine.remote_vault_path.display(), provider.as_str(), profile)
}

pub struct SyncEngine<'a> {
    pub vault: &'a Vault,
    pub pool: &'a ConnectionPool,
    /// Wraps each profile's push/pull (`CoreConfig::sync_timeout`, default 5
    /// min). The connect timeout lives on `TransportConfig` instead, since
    /// it guards the pool's dial rather than any one sync operation.
    pub sync_timeout: Duration,
}

impl<'a> SyncEngine<'a> {
    async fn execute_with_timeout(&self, machine: &Machine, provider: Provider, profile: &str, action: SyncAction) -> Result<()> {
        match tokio::time::timeout(self.sync_timeout, self.execute(machine, provider, profile, action)).await {
            Ok(result) => result,
            Err(_) => Err(CaamError::transport(&machine.name, crate::error::TransportErrorKind::Timeout)),
        }
    }

    fn connect_target(&self, machine: &Machine) -> ConnectTarget {
        ConnectTarget { id: machine.id, host: machine.address.clone(), port: machine.port, user: machine.ssh_user.clone(), key_path: machine.ssh_key_path.clone() }
    }

    async fn remote_freshness(&self, machine: &Machine, provider: Provider, profile: &str) -> Result<Freshness> {
        let target = self.connect_target(machine);
        let connection = self.pool.get(&target).await?;
        let remote_dir = remote_profile_dir(machine, provider, profile);

        let entries = connection.list(&remote_dir).await?;
        if entries.is_empty() {
            return Err(CaamError::not_found(format!("remote profile {}/{} on {}", provider, profile, machine.name)));
        }

        let mut files: HashMap<String, (Vec<u8>, SystemTime)> = HashMap::new();
        for name in entries {
            let path = format!("{remote_dir}/{name}");
            let bytes = connection.read(&path).await?;
            let attrs = connection.stat(&path).await.ok();
            let mtime = attrs
                .and_then(|a| a.mtime)
                .map(|secs| SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs as u64))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.insert(name, (bytes, mtime));
        }

        freshness::extract(provider, profile, &FileSet::InMemoryWithMtimes(&files), &machine.name)
    }

    fn local_freshness(&self, provider: Provider, profile: &str) -> Result<Freshness> {
        let dir = self.vault.profile_dir(provider, profile);
        freshness::extract_from_dir(provider, profile, &dir, "local")
    }

    async fn execute(&self, machine: &Machine, provider: Provider, profile: &str, action: SyncAction) -> Result<()> {
        match action {
            SyncAction::Skip => Ok(()),
            SyncAction::Push => {
                let target = self.connect_target(machine);
                let connection = self.pool.get(&target).await?;
                let remote_dir = remote_profile_dir(machine, provider, profile);
                connection.mkdir_all(&remote_dir).await?;
                for (name, bytes) in self.vault.read_profile_files(provider, profile)? {
                    connection.write_atomic(&format!("{remote_dir}/{name}"), &bytes).await?;
                }
                Ok(())
            }
            SyncAction::Pull => {
                let target = self.connect_target(machine);
                let connection = self.pool.get(&target).await?;
                let remote_dir = remote_profile_dir(machine, provider, profile);
                let mut files = Vec::new();
                for name in connection.list(&remote_dir).await? {
                    let bytes = connection.read(&format!("{remote_dir}/{name}")).await?;
                    files.push((name, bytes));
                }
                self.vault.backup(provider, profile, &files)
            }
        }
    }

    /// Union of providers × (local ∪ remote profile names) for one peer.
    async fn enumerate_profiles(&self, machine: &Machine) -> Result<Vec<(Provider, String)>> {
        let target = self.connect_target(machine);
        let connection = self.pool.get(&target).await?;

        let mut out = Vec::new();
        for provider in Provider::ALL {
            let mut names: std::collections::BTreeSet<String> = self.vault.list_profiles(provider, false)?.into_iter().collect();
            let remote_provider_dir = format!("{}/{}", machine.remote_vault_path.display(), provider.as_str());
            for name in connection.list(&remote_provider_dir).await? {
                if !crate::provider::is_system_profile(&name) {
                    names.insert(name);
                }
            }
            for name in names {
                out.push((provider, name));
            }
        }
        Ok(out)
    }

    /// Sync every `(provider, profile)` against a single peer.
    pub async fn sync_with_machine(&self, state: &mut SyncState, machine_id: Uuid, trigger: SyncTrigger, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let machine = state
            .pool()
            .machines
            .get(&machine_id)
            .cloned()
            .ok_or_else(|| CaamError::not_found(format!("machine {machine_id}")))?;

        let mut outcome = SyncOutcome::default();
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let profiles = match self.enumerate_profiles(&machine).await {
            Ok(p) => p,
            Err(e) => {
                // Can't enumerate without a connection, so there is no
                // profile list to attach per-profile failures to.
                tracing::warn!(machine = %machine.name, error = %e, "sync enumeration failed, connection unavailable");
                return Ok(outcome);
            }
        };

        for (provider, profile) in profiles {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let started = Instant::now();
            let local = self.local_freshness(provider, &profile);
            let remote = self.remote_freshness(&machine, provider, &profile).await;
            let (action, exec_result) = match plan(&local, &remote) {
                Ok(action) => {
                    let r = self.execute_with_timeout(&machine, provider, &profile, action).await;
                    (action, r)
                }
                Err(e) => (SyncAction::Skip, Err(e)),
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            let success = exec_result.is_ok();
            let error = exec_result.as_ref().err().map(|e| e.to_string());

            let now = chrono::Utc::now().timestamp();
            if success {
                state.remove_queue_entry(provider, &profile, machine_id);
            } else {
                state.upsert_queue_entry(provider, &profile, machine_id, now, error.clone());
            }
            state.push_history(HistoryEntry {
                timestamp: now,
                trigger,
                provider,
                profile: profile.clone(),
                machine_name: machine.name.clone(),
                action,
                success,
                error: error.clone(),
                duration_ms,
            });

            outcome.results.push(SyncResult { provider, profile, machine_id, action, success, error, duration_ms });
        }

        Ok(outcome)
    }

    /// Sync every profile against every known peer (a full fleet sync, as
    /// opposed to the auto-sync trigger's single-profile
    /// [`sync_profile_to_all_peers`]).
    pub async fn sync_all_peers(&self, state: &mut SyncState, trigger: SyncTrigger, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let machine_ids: Vec<Uuid> = state.pool().machines.keys().copied().collect();
        let mut outcome = SyncOutcome::default();

        for machine_id in machine_ids {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let per_machine = self.sync_with_machine(state, machine_id, trigger, cancel).await?;
            outcome.results.extend(per_machine.results);
            if per_machine.cancelled {
                outcome.cancelled = true;
                break;
            }
        }

        Ok(outcome)
    }

    /// Sync one profile against every enabled peer (the auto-sync trigger's
    /// entry point).
    pub async fn sync_profile_to_all_peers(&self, state: &mut SyncState, provider: Provider, profile: &str, trigger: SyncTrigger, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let machine_ids: Vec<Uuid> = state.pool().machines.keys().copied().collect();
        let mut outcome = SyncOutcome::default();

        for machine_id in machine_ids {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let machine = state.pool().machines.get(&machine_id).cloned();
            let Some(machine) = machine else { continue };

            let started = Instant::now();
            let local = self.local_freshness(provider, profile);
            let remote = self.remote_freshness(&machine, provider, profile).await;
            let (action, exec_result) = match plan(&local, &remote) {
                Ok(action) => (action, self.execute_with_timeout(&machine, provider, profile, action).await),
                Err(e) => (SyncAction::Skip, Err(e)),
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            let success = exec_result.is_ok();
            let error = exec_result.as_ref().err().map(|e| e.to_string());
            let now = chrono::Utc::now().timestamp();

            if success {
                state.remove_queue_entry(provider, profile, machine_id);
            } else {
                state.upsert_queue_entry(provider, profile, machine_id, now, error.clone());
            }
            state.push_history(HistoryEntry {
                timestamp: now,
                trigger,
                provider,
                profile: profile.to_string(),
                machine_name: machine.name.clone(),
                action,
                success,
                error: error.clone(),
                duration_ms,
            });
            outcome.results.push(SyncResult { provider, profile: profile.to_string(), machine_id, action, success, error, duration_ms });
        }

        Ok(outcome)
    }

    /// Drain the retry queue: garbage-collect first, then retry each
    /// surviving entry against only its named peer. Iteration snapshots the
    /// queue up front; mutations (success removal, failure re-upsert) happen
    /// after each attempt, never aliasing the snapshot.
    pub async fn drain_queue(&self, state: &mut SyncState, max_age_secs: i64, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let now = chrono::Utc::now().timestamp();
        state.gc_queue(now, max_age_secs);
        let snapshot: Vec<_> = state.queue().to_vec();
        tracing::debug!(entries = snapshot.len(), "sync: draining retry queue");

        let mut outcome = SyncOutcome::default();
        for entry in snapshot {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let Some(machine) = state.pool().machines.get(&entry.machine_id).cloned() else { continue };

            let started = Instant::now();
            let local = self.local_freshness(entry.provider, &entry.profile);
            let remote = self.remote_freshness(&machine, entry.provider, &entry.profile).await;
            let (action, exec_result) = match plan(&local, &remote) {
                Ok(action) => (action, self.execute_with_timeout(&machine, entry.provider, &entry.profile, action).await),
                Err(e) => (SyncAction::Skip, Err(e)),
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            let success = exec_result.is_ok();
            let error = exec_result.as_ref().err().map(|e| e.to_string());
            let attempt_now = chrono::Utc::now().timestamp();

            if success {
                state.remove_queue_entry(entry.provider, &entry.profile, entry.machine_id);
            } else {
                state.upsert_queue_entry(entry.provider, &entry.profile, entry.machine_id, attempt_now, error.clone());
            }
            state.push_history(HistoryEntry {
                timestamp: attempt_now,
                trigger: SyncTrigger::Retry,
                provider: entry.provider,
                profile: entry.profile.clone(),
                machine_name: machine.name.clone(),
                action,
                success,
                error: error.clone(),
                duration_ms,
            });
            outcome.results.push(SyncResult { provider: entry.provider, profile: entry.profile, machine_id: entry.machine_id, action, success, error, duration_ms });
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn fresh(expires_at: Option<i64>, modified_at: SystemTime) -> Freshness {
        Freshness { provider: Provider::Codex, profile: "p".into(), expires_at, modified_at, is_expired: false, source: "t".into() }
    }

    #[test]
    fn plan_missing_missing_is_skip() {
        let local: Result<Freshness> = Err(CaamError::not_found("x"));
        let remote: Result<Freshness> = Err(CaamError::not_found("x"));
        assert_eq!(plan(&local, &remote).unwrap(), SyncAction::Skip);
    }

    #[test]
    fn plan_missing_present_is_pull() {
        let local: Result<Freshness> = Err(CaamError::not_found("x"));
        let remote: Result<Freshness> = Ok(fresh(Some(100), SystemTime::UNIX_EPOCH));
        assert_eq!(plan(&local, &remote).unwrap(), SyncAction::Pull);
    }

    #[test]
    fn plan_present_missing_is_push() {
        let local: Result<Freshness> = Ok(fresh(Some(100), SystemTime::UNIX_EPOCH));
        let remote: Result<Freshness> = Err(CaamError::not_found("x"));
        assert_eq!(plan(&local, &remote).unwrap(), SyncAction::Push);
    }

    #[test]
    fn plan_fresher_local_is_push() {
        let local: Result<Freshness> = Ok(fresh(Some(200), SystemTime::UNIX_EPOCH));
        let remote: Result<Freshness> = Ok(fresh(Some(100), SystemTime::UNIX_EPOCH));
        assert_eq!(plan(&local, &remote).unwrap(), SyncAction::Push);
    }

    #[test]
    fn plan_equal_is_skip() {
        let local: Result<Freshness> = Ok(fresh(Some(100), SystemTime::UNIX_EPOCH));
        let remote: Result<Freshness> = Ok(fresh(Some(100), SystemTime::UNIX_EPOCH));
        assert_eq!(plan(&local, &remote).unwrap(), SyncAction::Skip);
    }

    #[test]
    fn plan_other_error_fails() {
        let local: Result<Freshness> = Err(CaamError::corruption("bad json"));
        let remote: Result<Freshness> = Ok(fresh(Some(100), SystemTime::UNIX_EPOCH));
        assert!(plan(&local, &remote).is_err());
    }
}
