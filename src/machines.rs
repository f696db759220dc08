//! Peer discovery: CSV peer file and `~/.ssh/config` host discovery
//! (SPEC_FULL.md §6). Grounded on `auth/sniff.rs`'s small hand-rolled parsers
//! over known file formats, generalized from JSON to CSV and to a
//! line-oriented SSH config grammar.

use crate::error::{CaamError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredMachine {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub key_path: Option<PathBuf>,
    pub source: DiscoverySource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    SshConfig,
    Csv,
    Manual,
}

/// Parse `[user@]host[:port]`, with `[ipv6]:port` supported for IPv6.
pub fn parse_address(addr: &str, current_user: &str) -> Result<(Option<String>, String, u16)> {
    let (user, rest) = match addr.split_once('@') {
        Some((u, r)) => (Some(u.to_string()), r),
        None => (None, addr),
    };

    let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
        // [ipv6]:port or bare [ipv6]
        let end = stripped
            .find(']')
            .ok_or_else(|| CaamError::validation("address", format!("unterminated IPv6 literal in `{addr}`")))?;
        let host = stripped[..end].to_string();
        let after = &stripped[end + 1..];
        let port = if let Some(p) = after.strip_prefix(':') {
            p.parse::<u16>().map_err(|_| CaamError::validation("address", format!("invalid port in `{addr}`")))?
        } else {
            22
        };
        (host, port)
    } else if let Some((h, p)) = rest.rsplit_once(':') {
        // Only treat as host:port if `p` is a valid port number; a bare IPv6
        // address without brackets would otherwise be mis-split.
        match p.parse::<u16>() {
            Ok(port) => (h.to_string(), port),
            Err(_) => (rest.to_string(), 22),
        }
    } else {
        (rest.to_string(), 22)
    };

    if host.is_empty() {
        return Err(CaamError::validation("address", format!("empty host in `{addr}`")));
    }
    let _ = current_user;
    Ok((user, host, port))
}

fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else if path == "~" {
        home.to_path_buf()
    } else {
        PathBuf::from(path)
    }
}

/// Parse a `~/.caam/sync_machines.csv` file: `machine_name,address,ssh_key_path`.
/// `#` starts a comment line; a header line beginning with `machine_name` is
/// skipped.
pub fn parse_csv_peers(content: &str, current_user: &str, home: &Path) -> Result<Vec<DiscoveredMachine>> {
    let mut out = Vec::new();
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(content.as_bytes());

    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| CaamError::validation("sync_machines.csv", e.to_string()))?;
        if record.is_empty() {
            continue;
        }
        let first_field = record.get(0).unwrap_or("").trim();
        if first_field.starts_with('#') || first_field.is_empty() {
            continue;
        }
        if i == 0 && first_field.eq_ignore_ascii_case("machine_name") {
            continue;
        }

        let name = first_field.to_string();
        let address = record.get(1).unwrap_or("").trim();
        let key_path_field = record.get(2).map(|s| s.trim()).filter(|s| !s.is_empty());

        if address.is_empty() {
            return Err(CaamError::validation("sync_machines.csv", format!("row {i} missing address")));
        }
        let (user, host, port) = parse_address(address, current_user)?;

        out.push(DiscoveredMachine {
            name,
            host,
            port,
            user: user.or_else(|| Some(current_user.to_string())),
            key_path: key_path_field.map(|p| expand_tilde(p, home)),
            source: DiscoverySource::Csv,
        });
    }

    Ok(out)
}

/// Hosts that are never treated as sync peers, regardless of `~/.ssh/config`
/// contents (SPEC_FULL §6).
const BLOCKED_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org", "codeberg.org", "sr.ht", "ssh.github.com"];

fn is_wildcard_or_negated(pattern: &str) -> bool {
    pattern.starts_with('!') || pattern.contains('*') || pattern.contains('?')
}

/// Parse `~/.ssh/config`, skipping wildcard/negated host patterns, hosts with
/// `ProxyJump`/`ProxyCommand`, and the fixed code-hosting blocklist.
pub fn parse_ssh_config(content: &str, current_user: &str, home: &Path) -> Vec<DiscoveredMachine> {
    struct Block {
        patterns: Vec<String>,
        host_name: Option<String>,
        port: u16,
        user: Option<String>,
        identity_file: Option<String>,
        has_proxy: bool,
    }

    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Option<Block> = None;

    for raw_line in content.lines() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        let Some(keyword) = parts.next() else { continue };
        let value = parts.next().unwrap_or("").trim();
        let keyword_lower = keyword.to_ascii_lowercase();

        if keyword_lower == "host" {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            let patterns = value.split_whitespace().map(|s| s.to_string()).collect();
            current = Some(Block { patterns, host_name: None, port: 22, user: None, identity_file: None, has_proxy: false });
            continue;
        }

        let Some(block) = current.as_mut() else { continue };
        match keyword_lower.as_str() {
            "hostname" => block.host_name = Some(value.to_string()),
            "port" => block.port = value.parse().unwrap_or(22),
            "user" => block.user = Some(value.to_string()),
            "identityfile" => block.identity_file = Some(value.to_string()),
            "proxyjump" | "proxycommand" => block.has_proxy = true,
            _ => {}
        }
    }
    if let Some(block) = current.take() {
        blocks.push(block);
    }

    let mut out = Vec::new();
    for block in blocks {
        if block.has_proxy {
            continue;
        }
        for pattern in &block.patterns {
            if is_wildcard_or_negated(pattern) {
                continue;
            }
            let host = block.host_name.clone().unwrap_or_else(|| pattern.clone());
            if BLOCKED_HOSTS.iter().any(|b| b.eq_ignore_ascii_case(&host)) {
                continue;
            }
            out.push(DiscoveredMachine {
                name: pattern.clone(),
                host,
                port: block.port,
                user: block.user.clone().or_else(|| Some(current_user.to_string())),
                key_path: block.identity_file.as_deref().map(|p| expand_tilde(p, home)),
                source: DiscoverySource::SshConfig,
            });
        }
    }
    out
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_token = false;
    for (i, c) in line.char_indices() {
        if c == '#' && (i == 0 || line.as_bytes()[i - 1].is_ascii_whitespace()) && !in_token {
            return &line[..i];
        }
        in_token = !c.is_whitespace();
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv6_literal_with_port() {
        let (user, host, port) = parse_address("[::1]:2222", "me").unwrap();
        assert_eq!(user, None);
        assert_eq!(host, "::1");
        assert_eq!(port, 2222);
    }

    #[test]
    fn parses_user_host_port() {
        let (user, host, port) = parse_address("bob@10.0.0.5:2200", "me").unwrap();
        assert_eq!(user.as_deref(), Some("bob"));
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 2200);
    }

    #[test]
    fn missing_port_defaults_to_22() {
        let (_, _, port) = parse_address("host.example.com", "me").unwrap();
        assert_eq!(port, 22);
    }

    #[test]
    fn csv_skips_comments_header_and_blank_lines() {
        let csv = "machine_name,address,ssh_key_path\n# comment\n\nhome,alice@10.0.0.1:22,~/.ssh/id_ed25519\n";
        let home = Path::new("/home/me");
        let peers = parse_csv_peers(csv, "me", home).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "home");
        assert_eq!(peers[0].key_path, Some(home.join(".ssh/id_ed25519")));
    }

    #[test]
    fn ssh_config_skips_wildcards_negations_proxies_and_blocked_hosts() {
        let config = "\
Host *
  User nobody

Host !excluded
  HostName 10.0.0.9

Host viajump
  ProxyJump bastion
  HostName 10.0.0.8

Host github.com
  HostName github.com

Host workbox other-name
  HostName 10.0.0.2
  Port 2222
  User alice
  IdentityFile ~/.ssh/work_key
";
        let home = Path::new("/home/alice");
        let machines = parse_ssh_config(config, "alice", home);
        let names: Vec<_> = machines.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["workbox", "other-name"]);
        assert_eq!(machines[0].host, "10.0.0.2");
        assert_eq!(machines[0].port, 2222);
        assert_eq!(machines[0].key_path, Some(home.join(".ssh/work_key")));
    }

    #[test]
    fn inline_comments_are_stripped() {
        let config = "Host box # a comment\n  HostName 10.0.0.3 # trailing\n";
        let machines = parse_ssh_config(config, "me", Path::new("/home/me"));
        assert_eq!(machines[0].host, "10.0.0.3");
    }
}
