//! SSH/SFTP transport: connection pool, TOFU host keys, typed errors
//! (SPEC_FULL.md §4.5).
//!
//! Built on `russh` for the transport and `russh-sftp` for the SFTP
//! subsystem, mirroring how the teacher layers `AiClient` (async, network)
//! over `auth/config.rs` (sync, local file I/O) — this module is the async
//! network layer the sync engine calls into, never the other way around.

mod hostkey;
mod pool;

pub use hostkey::{default_known_hosts_path, HostKeyDecision, KnownHosts};
pub use pool::{ConnectionPool, PooledConnection};

use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Everything the pool needs to dial a peer, independent of `sync::Machine`
/// so this module has no dependency on the sync state types.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub id: Uuid,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub known_hosts_path: PathBuf,
    /// Disables TOFU host-key verification entirely. Only reachable via
    /// `TransportConfig::insecure_for_tests`, never the default constructor,
    /// so production code paths cannot silently disable it.
    pub insecure_skip_host_key_check: bool,
}

impl TransportConfig {
    pub fn new(connect_timeout: Duration, known_hosts_path: PathBuf) -> Self {
        Self { connect_timeout, known_hosts_path, insecure_skip_host_key_check: false }
    }

    #[cfg(test)]
    pub fn insecure_for_tests(connect_timeout: Duration, known_hosts_path: PathBuf) -> Self {
        Self { connect_timeout, known_hosts_path, insecure_skip_host_key_check: true }
    }
}
