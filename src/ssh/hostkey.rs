//! Trust-On-First-Use host key store (SPEC_FULL.md §4.5).
//!
//! A flat text file, one line per known host: `host:port key-base64`. Kept
//! deliberately simpler than OpenSSH's `known_hosts` (no hashed hostnames,
//! one key algorithm) since this crate only ever dials hosts it discovered
//! itself.

use crate::atomic;
use crate::error::Result;
use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyDecision {
    Unknown,
    Match,
    Mismatch,
}

pub struct KnownHosts {
    path: PathBuf,
    entries: HashMap<String, Vec<u8>>,
}

fn entry_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

impl KnownHosts {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        if let Ok(content) = std::fs::read_to_string(&path) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((host_port, key_b64)) = line.split_once(' ') {
                    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(key_b64.trim()) {
                        entries.insert(host_port.to_string(), bytes);
                    }
                }
            }
        }
        Ok(Self { path, entries })
    }

    /// Compare `key` against the stored entry for `host:port`, if any.
    pub fn check(&self, host: &str, port: u16, key: &[u8]) -> HostKeyDecision {
        match self.entries.get(&entry_key(host, port)) {
            None => HostKeyDecision::Unknown,
            Some(stored) if stored == key => HostKeyDecision::Match,
            Some(_) => HostKeyDecision::Mismatch,
        }
    }

    /// Record `key` for `host:port`, overwriting any previous entry for the
    /// same address. Only called after `check` returned `Unknown`.
    pub fn trust(&mut self, host: &str, port: u16, key: &[u8]) -> Result<()> {
        self.entries.insert(entry_key(host, port), key.to_vec());
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let mut lines = self
            .entries
            .iter()
            .map(|(host_port, key)| format!("{host_port} {}", base64::engine::general_purpose::STANDARD.encode(key)))
            .collect::<Vec<_>>();
        lines.sort();
        atomic::write(&self.path, lines.join("\n").as_bytes())
    }
}

pub fn default_known_hosts_path(data_root: &Path) -> PathBuf {
    data_root.join("known_hosts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_host_then_trust_then_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let mut hosts = KnownHosts::load(&path).unwrap();

        assert_eq!(hosts.check("10.0.0.1", 22, b"key-a"), HostKeyDecision::Unknown);
        hosts.trust("10.0.0.1", 22, b"key-a").unwrap();
        assert_eq!(hosts.check("10.0.0.1", 22, b"key-a"), HostKeyDecision::Match);

        let reloaded = KnownHosts::load(&path).unwrap();
        assert_eq!(reloaded.check("10.0.0.1", 22, b"key-a"), HostKeyDecision::Match);
    }

    #[test]
    fn changed_key_is_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut hosts = KnownHosts::load(dir.path().join("known_hosts")).unwrap();
        hosts.trust("10.0.0.1", 22, b"key-a").unwrap();
        assert_eq!(hosts.check("10.0.0.1", 22, b"key-b"), HostKeyDecision::Mismatch);
    }

    #[test]
    fn distinct_ports_on_same_host_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut hosts = KnownHosts::load(dir.path().join("known_hosts")).unwrap();
        hosts.trust("10.0.0.1", 22, b"key-a").unwrap();
        assert_eq!(hosts.check("10.0.0.1", 2222, b"key-a"), HostKeyDecision::Unknown);
    }
}
