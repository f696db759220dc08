//! Token-freshness extraction and comparison (SPEC_FULL.md §4.3).
//!
//! Grounded on `auth/sniff.rs`'s per-provider file parsers and
//! `auth/mod.rs`'s `Credential::is_expired`, generalized into a single
//! extractor keyed off the closed [`Provider`] enum instead of string
//! dispatch.

use crate::error::{CaamError, Result};
use crate::provider::Provider;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

/// A provider's credential files, either already loaded into memory or
/// available on disk. Matching is always by exact basename (SPEC_FULL §4.3 —
/// a substring match would wrongly treat `auth.json.backup` as `auth.json`).
pub enum FileSet<'a> {
    InMemory(&'a HashMap<String, Vec<u8>>),
    /// Like `InMemory`, but each entry also carries a known modification
    /// time — used for remote (SFTP) reads, where bytes and `mtime` come
    /// from two separate round trips instead of one filesystem stat.
    InMemoryWithMtimes(&'a HashMap<String, (Vec<u8>, SystemTime)>),
    OnDisk(&'a Path),
}

impl<'a> FileSet<'a> {
    fn read(&self, basename: &str) -> Option<(Vec<u8>, Option<SystemTime>)> {
        match self {
            FileSet::InMemory(map) => map.get(basename).map(|bytes| (bytes.clone(), None)),
            FileSet::InMemoryWithMtimes(map) => map.get(basename).map(|(bytes, mtime)| (bytes.clone(), Some(*mtime))),
            FileSet::OnDisk(dir) => {
                let path = dir.join(basename);
                let bytes = std::fs::read(&path).ok()?;
                let modified = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
                Some((bytes, modified))
            }
        }
    }
}

/// Derived, not stored: a comparable freshness record for one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Freshness {
    pub provider: Provider,
    pub profile: String,
    /// Unix milliseconds since epoch, if known.
    pub expires_at: Option<i64>,
    pub modified_at: SystemTime,
    pub is_expired: bool,
    pub source: String,
}

impl Freshness {
    fn expires_key(&self) -> Option<i64> {
        self.expires_at
    }
}

/// Whether `raw` should be interpreted as Unix millis or seconds. Isolated
/// per the Claude `expiresAt`-units open question (SPEC_FULL §9): the
/// heuristic can be tightened in one place if providers standardise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryUnit {
    Seconds,
    Millis,
}

pub fn classify_expiry_unit(raw: i64) -> ExpiryUnit {
    if raw > 10i64.pow(12) {
        ExpiryUnit::Millis
    } else {
        ExpiryUnit::Seconds
    }
}

fn to_millis(raw: i64, unit: ExpiryUnit) -> i64 {
    match unit {
        ExpiryUnit::Millis => raw,
        ExpiryUnit::Seconds => raw * 1000,
    }
}

fn system_time_zero() -> SystemTime {
    SystemTime::UNIX_EPOCH
}

/// Extract a [`Freshness`] record for `provider`/`profile` from `files`.
pub fn extract(provider: Provider, profile: &str, files: &FileSet, source: &str) -> Result<Freshness> {
    let (expires_at, modified_at) = match provider {
        Provider::Claude => extract_claude(files)?,
        Provider::Codex => extract_codex(files)?,
        Provider::Gemini => extract_gemini(files)?,
    };

    let now_ms = Utc::now().timestamp_millis();
    let is_expired = expires_at.map(|e| now_ms > e).unwrap_or(false);

    Ok(Freshness {
        provider,
        profile: profile.to_string(),
        expires_at,
        modified_at: modified_at.unwrap_or_else(system_time_zero),
        is_expired,
        source: source.to_string(),
    })
}

fn extract_claude(files: &FileSet) -> Result<(Option<i64>, Option<SystemTime>)> {
    if let Some((bytes, mtime)) = files.read(".credentials.json") {
        let json: Value = serde_json::from_slice(&bytes)
            .map_err(|e| CaamError::corruption(format!("parsing .credentials.json: {e}")))?;
        if let Some(raw) = json
            .get("claudeAiOauth")
            .and_then(|v| v.get("expiresAt"))
            .and_then(|v| v.as_i64())
        {
            let unit = classify_expiry_unit(raw);
            return Ok((Some(to_millis(raw, unit)), mtime));
        }
        // credentials file present but lacks expiry: fall through to legacy.
        if let Some((legacy_bytes, legacy_mtime)) = files.read(".claude.json") {
            if let Some(expires) = parse_legacy_claude_expiry(&legacy_bytes)? {
                return Ok((Some(expires), legacy_mtime));
            }
        }
        return Ok((None, mtime));
    }

    if let Some((bytes, mtime)) = files.read(".claude.json") {
        return Ok((parse_legacy_claude_expiry(&bytes)?, mtime));
    }

    Err(CaamError::not_found("claude credential file (.credentials.json or .claude.json)"))
}

fn parse_legacy_claude_expiry(bytes: &[u8]) -> Result<Option<i64>> {
    let json: Value = serde_json::from_slice(bytes)
        .map_err(|e| CaamError::corruption(format!("parsing .claude.json: {e}")))?;
    let Some(expiry) = json.get("oauthToken").and_then(|v| v.get("expiry")).and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let dt = DateTime::parse_from_rfc3339(expiry)
        .map_err(|e| CaamError::corruption(format!("parsing legacy Claude expiry `{expiry}`: {e}")))?;
    Ok(Some(dt.timestamp_millis()))
}

fn extract_codex(files: &FileSet) -> Result<(Option<i64>, Option<SystemTime>)> {
    let (bytes, mtime) = files
        .read("auth.json")
        .ok_or_else(|| CaamError::not_found("codex credential file (auth.json)"))?;
    let json: Value = serde_json::from_slice(&bytes)
        .map_err(|e| CaamError::corruption(format!("parsing auth.json: {e}")))?;
    let expires = json.get("expires_at").and_then(|v| v.as_i64()).map(|secs| secs * 1000);
    Ok((expires, mtime))
}

fn extract_gemini(files: &FileSet) -> Result<(Option<i64>, Option<SystemTime>)> {
    let (bytes, mtime) = files
        .read("settings.json")
        .ok_or_else(|| CaamError::not_found("gemini credential file (settings.json)"))?;
    let json: Value = serde_json::from_slice(&bytes)
        .map_err(|e| CaamError::corruption(format!("parsing settings.json: {e}")))?;

    let expiry_str = json
        .get("oauth_credentials")
        .and_then(|v| v.get("expiry"))
        .and_then(|v| v.as_str())
        .or_else(|| json.get("expiry").and_then(|v| v.as_str()));

    let Some(expiry_str) = expiry_str else {
        return Ok((None, mtime));
    };
    let dt = DateTime::parse_from_rfc3339(expiry_str)
        .map_err(|e| CaamError::corruption(format!("parsing gemini expiry `{expiry_str}`: {e}")))?;
    Ok((Some(dt.timestamp_millis()), mtime))
}

/// Given two freshness records, is `a` strictly fresher than `b`?
/// (SPEC_FULL §4.3 — a total pre-order; equal records return false both
/// directions, which callers treat as "skip".)
pub fn fresher(a: Option<&Freshness>, b: Option<&Freshness>) -> bool {
    match (a, b) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(a), Some(b)) => {
            match (a.expires_key(), b.expires_key()) {
                (None, _) | (_, None) => a.modified_at > b.modified_at,
                (Some(ea), Some(eb)) => {
                    if ea != eb {
                        ea > eb
                    } else {
                        a.modified_at > b.modified_at
                    }
                }
            }
        }
    }
}

/// Read credential files for `provider` from an on-disk profile directory.
pub fn extract_from_dir(provider: Provider, profile: &str, dir: &Path, source: &str) -> Result<Freshness> {
    extract(provider, profile, &FileSet::OnDisk(dir), source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn files(entries: &[(&str, &str)]) -> HashMap<String, Vec<u8>> {
        entries.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect()
    }

    #[test]
    fn claude_prefers_credentials_json_over_legacy() {
        let now_plus = Utc::now().timestamp_millis() + 3_600_000;
        let map = files(&[
            (".credentials.json", &format!(r#"{{"claudeAiOauth":{{"expiresAt":{now_plus}}}}}"#)),
            (".claude.json", r#"{"oauthToken":{"expiry":"2000-01-01T00:00:00Z"}}"#),
        ]);
        let fs = extract(Provider::Claude, "p", &FileSet::InMemory(&map), "local").unwrap();
        assert_eq!(fs.expires_at, Some(now_plus));
    }

    #[test]
    fn claude_falls_back_to_legacy_when_credentials_lacks_expiry() {
        let map = files(&[
            (".credentials.json", r#"{"claudeAiOauth":{}}"#),
            (".claude.json", r#"{"oauthToken":{"expiry":"2099-01-01T00:00:00Z"}}"#),
        ]);
        let fs = extract(Provider::Claude, "p", &FileSet::InMemory(&map), "local").unwrap();
        assert!(fs.expires_at.is_some());
    }

    #[test]
    fn claude_expiry_unit_heuristic() {
        assert_eq!(classify_expiry_unit(1_700_000_000), ExpiryUnit::Seconds);
        assert_eq!(classify_expiry_unit(1_700_000_000_000), ExpiryUnit::Millis);
    }

    #[test]
    fn codex_reads_expires_at_seconds() {
        let map = files(&[("auth.json", r#"{"expires_at": 1700000000}"#)]);
        let fs = extract(Provider::Codex, "p", &FileSet::InMemory(&map), "local").unwrap();
        assert_eq!(fs.expires_at, Some(1_700_000_000_000));
    }

    #[test]
    fn gemini_prefers_oauth_credentials_expiry() {
        let map = files(&[(
            "settings.json",
            r#"{"oauth_credentials":{"expiry":"2030-01-01T00:00:00Z"},"expiry":"2000-01-01T00:00:00Z"}"#,
        )]);
        let fs = extract(Provider::Gemini, "p", &FileSet::InMemory(&map), "local").unwrap();
        assert!(fs.expires_at.unwrap() > Utc::now().timestamp_millis());
    }

    #[test]
    fn file_base_matching_is_exact_not_substring() {
        let map = files(&[("auth.json.backup", r#"{"expires_at": 1700000000}"#)]);
        let err = extract(Provider::Codex, "p", &FileSet::InMemory(&map), "local").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn fresher_is_irreflexive_and_antisymmetric() {
        let a = Freshness {
            provider: Provider::Codex,
            profile: "p".into(),
            expires_at: Some(1000),
            modified_at: SystemTime::UNIX_EPOCH,
            is_expired: false,
            source: "local".into(),
        };
        assert!(!fresher(Some(&a), Some(&a)));

        let mut b = a.clone();
        b.expires_at = Some(2000);
        assert!(fresher(Some(&b), Some(&a)));
        assert!(!fresher(Some(&a), Some(&b)));
    }

    #[test]
    fn fresher_none_vs_some() {
        let a = Freshness {
            provider: Provider::Codex,
            profile: "p".into(),
            expires_at: None,
            modified_at: SystemTime::UNIX_EPOCH,
            is_expired: false,
            source: "local".into(),
        };
        assert!(fresher(Some(&a), None));
        assert!(!fresher(None, Some(&a)));
        assert!(!fresher(None, None));
    }

    #[test]
    fn fresher_ties_on_expiry_break_by_modified_at() {
        let older = Freshness {
            provider: Provider::Codex,
            profile: "p".into(),
            expires_at: Some(500),
            modified_at: SystemTime::UNIX_EPOCH,
            is_expired: false,
            source: "local".into(),
        };
        let mut newer = older.clone();
        newer.modified_at = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(10);
        assert!(fresher(Some(&newer), Some(&older)));
    }
}
