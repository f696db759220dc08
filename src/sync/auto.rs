//! Auto-sync trigger (SPEC_FULL.md §4.7): a throttled, fire-and-forget sync
//! spawned after any operation that mutates credentials. Never blocks the
//! caller, never propagates an error back to it.

use super::engine::SyncEngine;
use super::state::{SyncState, SyncTrigger};
use super::throttle::Throttler;
use crate::provider::Provider;
use crate::ssh::ConnectionPool;
use crate::vault::Vault;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct AutoSyncConfig {
    pub throttle_interval: Duration,
    pub total_timeout: Duration,
    pub sync_timeout: Duration,
    pub history_cap: usize,
    pub local_machine_name: String,
}

/// Step 2-4 of §4.7: consult the throttler, and if it allows firing, spawn a
/// background task that reloads state, checks `enabled`/`auto_sync`, and
/// syncs only `profile` across every peer.
pub fn spawn_auto_sync(
    data_root: PathBuf,
    vault: Arc<Vault>,
    pool: Arc<ConnectionPool>,
    throttler: Arc<Throttler>,
    config: AutoSyncConfig,
    provider: Provider,
    profile: String,
) {
    if !throttler.check_and_record(provider, &profile, config.throttle_interval) {
        return;
    }

    tokio::spawn(async move {
        let work = async {
            let mut state = match SyncState::load(&data_root, &config.local_machine_name, config.history_cap, 0) {
                Ok(state) => state,
                Err(e) => {
                    tracing::debug!(error = %e, "auto-sync: failed to load sync state, skipping silently");
                    return;
                }
            };

            if !state.pool().enabled || !state.pool().auto_sync {
                return;
            }

            let engine = SyncEngine { vault: &vault, pool: &pool, sync_timeout: config.sync_timeout };
            let cancel = CancellationToken::new();
            match engine.sync_profile_to_all_peers(&mut state, provider, &profile, SyncTrigger::Backup, &cancel).await {
                Ok(outcome) => {
                    let failures = outcome.results.iter().filter(|r| !r.success).count();
                    if failures > 0 {
                        tracing::warn!(provider = %provider, profile = %profile, failures, "auto-sync: some peers failed, retry queued");
                    }
                }
                Err(e) => tracing::warn!(provider = %provider, profile = %profile, error = %e, "auto-sync: sync call failed"),
            }

            if let Err(e) = state.save().await {
                tracing::warn!(error = %e, "auto-sync: failed to persist sync state");
            }
        };

        if tokio::time::timeout(config.total_timeout, work).await.is_err() {
            tracing::warn!(provider = %provider, profile = %profile, "auto-sync: timed out");
        }
    });
}
