//! Bundle decoding: safe extraction, checksum verification, merge into the
//! vault (SPEC_FULL.md §4.9).

use super::crypto;
use super::encode::{name_matches, CompanionPaths};
use super::manifest::{validate_manifest, BundleManifest};
use crate::atomic;
use crate::error::{CaamError, Result};
use crate::freshness::{self, FileSet};
use crate::provider::Provider;
use crate::vault::{atomic_replace_profile_dir, Vault};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

const MAX_ENTRY_BYTES: u64 = 100 * 1024 * 1024;
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Per-profile: keep whichever side is fresher (ties favor local).
    Smart,
    /// Add profiles the bundle has that the vault lacks; never overwrite.
    Merge,
    /// Bundle always wins.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    Verified,
    Mismatch,
    Missing,
    Extra,
}

#[derive(Debug, Clone)]
pub struct ChecksumReport {
    pub path: String,
    pub status: ChecksumStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileDecision {
    Applied,
    SkippedVaultFresher,
    SkippedBundleFreshnessUnknown,
    SkippedAlreadyPresent,
}

#[derive(Debug, Clone)]
pub struct ProfileOutcome {
    pub provider: Provider,
    pub profile: String,
    pub decision: ProfileDecision,
}

/// Outcome of one optional component (config/projects/health/database/
/// sync_config) from §4.9 step 8.
#[derive(Debug, Clone)]
pub struct ComponentOutcome {
    pub name: &'static str,
    pub applied: bool,
    pub reason: Option<String>,
}

impl ComponentOutcome {
    fn applied(name: &'static str) -> Self {
        Self { name, applied: true, reason: None }
    }

    fn skipped(name: &'static str, reason: impl Into<String>) -> Self {
        Self { name, applied: false, reason: Some(reason.into()) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOutcome {
    pub manifest: Option<BundleManifest>,
    pub checksums: Vec<ChecksumReport>,
    pub profiles: Vec<ProfileOutcome>,
    pub components: Vec<ComponentOutcome>,
}

/// A reader wrapper that errors once more than `limit` bytes have been
/// pulled through it — guards against a zip bomb inflating one entry past
/// any sane credential-bundle size (SPEC_FULL §4.9 step 3).
struct CappedReader<R: Read> {
    inner: R,
    remaining: u64,
}

impl<R: Read> CappedReader<R> {
    fn new(inner: R, limit: u64) -> Self {
        Self { inner, remaining: limit }
    }
}

impl<R: Read> Read for CappedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "zip entry exceeds maximum allowed size"));
        }
        let cap = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..cap])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Reject absolute paths and `..` components, and confirm the resolved
/// destination stays under `root` (SPEC_FULL §4.9 step 3 — zip-slip guard).
fn safe_join(root: &Path, entry_name: &str) -> Result<PathBuf> {
    let rel = Path::new(entry_name);
    if rel.is_absolute() {
        return Err(CaamError::validation("bundle_entry", format!("`{entry_name}` is an absolute path")));
    }
    for component in rel.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(CaamError::validation("bundle_entry", format!("`{entry_name}` contains a parent-directory segment")));
        }
    }
    let joined = root.join(rel);
    Ok(joined)
}

/// Unpack `bundle_bytes` (already decrypted if the bundle was encrypted)
/// into a fresh temp directory, enforcing path safety and the per-entry
/// size cap on every file as it is extracted.
fn extract_to_temp(bundle_bytes: Vec<u8>) -> Result<tempfile::TempDir> {
    let temp_dir = tempfile::tempdir().map_err(|e| CaamError::Internal(format!("creating extraction dir: {e}")))?;
    let cursor = std::io::Cursor::new(bundle_bytes);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|e| CaamError::corruption(format!("invalid zip archive: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| CaamError::corruption(format!("reading zip entry {i}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let dest = safe_join(temp_dir.path(), &name)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CaamError::io(parent, e))?;
        }
        let mut out = std::fs::File::create(&dest).map_err(|e| CaamError::io(&dest, e))?;
        let mut capped = CappedReader::new(&mut entry, MAX_ENTRY_BYTES);
        std::io::copy(&mut capped, &mut out).map_err(|e| CaamError::Internal(format!("extracting `{name}`: {e}")))?;
    }

    Ok(temp_dir)
}

/// Is this bundle encrypted? SPEC_FULL §4.9 step 1: a sidecar `.meta` file
/// next to the bundle, or a `.enc` suffix before `.zip`, both indicate yes.
pub fn is_encrypted(bundle_path: &Path) -> bool {
    super::encode::sidecar_meta_path(bundle_path).is_file() || bundle_path.to_string_lossy().ends_with(".enc.zip")
}

/// The other half of §4.9 step 1's detection: an already-extracted directory
/// carries the marker file the encoder wrote at archive root.
pub fn extracted_dir_has_marker(dir: &Path) -> bool {
    dir.join(super::encode::ENCRYPTED_MARKER_FILE).is_file()
}

fn load_and_open(bundle_path: &Path, password: Option<&str>) -> Result<Vec<u8>> {
    let raw = std::fs::read(bundle_path).map_err(|e| CaamError::io(bundle_path, e))?;
    if !is_encrypted(bundle_path) {
        return Ok(raw);
    }
    let Some(password) = password else {
        return Err(CaamError::validation("password", "bundle is encrypted, a password is required"));
    };
    let meta_path = super::encode::sidecar_meta_path(bundle_path);
    let meta_bytes = std::fs::read(&meta_path).map_err(|e| CaamError::io(&meta_path, e))?;
    let metadata = serde_json::from_slice(&meta_bytes).map_err(|e| CaamError::corruption(format!("parsing encryption metadata: {e}")))?;
    crypto::open(&raw, password, &metadata)
}

fn compute_checksums(staged: &Path, manifest: &BundleManifest) -> Vec<ChecksumReport> {
    let mut seen: HashMap<String, String> = HashMap::new();
    for entry in walkdir::WalkDir::new(staged).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(staged).unwrap_or(entry.path());
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if rel_str == MANIFEST_FILE {
            continue;
        }
        if let Ok(bytes) = std::fs::read(entry.path()) {
            let digest = Sha256::digest(&bytes);
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            seen.insert(rel_str, hex);
        }
    }

    let mut reports = Vec::new();
    for (path, expected) in &manifest.checksums.files {
        match seen.remove(path) {
            Some(actual) if &actual == expected => reports.push(ChecksumReport { path: path.clone(), status: ChecksumStatus::Verified }),
            Some(_) => reports.push(ChecksumReport { path: path.clone(), status: ChecksumStatus::Mismatch }),
            None => reports.push(ChecksumReport { path: path.clone(), status: ChecksumStatus::Missing }),
        }
    }
    for path in seen.into_keys() {
        reports.push(ChecksumReport { path, status: ChecksumStatus::Extra });
    }
    reports
}

fn apply_profile(vault: &Vault, provider: Provider, profile: &str, staged_profile_dir: &Path, mode: MergeMode) -> Result<ProfileDecision> {
    let exists = vault.profile_exists(provider, profile);

    match mode {
        MergeMode::Merge if exists => return Ok(ProfileDecision::SkippedAlreadyPresent),
        MergeMode::Smart if exists => {
            let local = freshness::extract_from_dir(provider, profile, &vault.profile_dir(provider, profile), "local");
            let incoming_files: HashMap<String, Vec<u8>> = read_dir_files(staged_profile_dir)?;
            let incoming = freshness::extract(provider, profile, &FileSet::InMemory(&incoming_files), "bundle");
            match (local, incoming) {
                (_, Err(_)) => return Ok(ProfileDecision::SkippedBundleFreshnessUnknown),
                (Ok(local), Ok(incoming)) if !freshness::fresher(Some(&incoming), Some(&local)) => {
                    return Ok(ProfileDecision::SkippedVaultFresher);
                }
                _ => {}
            }
        }
        _ => {}
    }

    let dest = vault.profile_dir(provider, profile);
    let staging = tempfile::tempdir().map_err(|e| CaamError::Internal(format!("staging profile apply: {e}")))?;
    let staged_dest = staging.path().join(profile);
    copy_dir(staged_profile_dir, &staged_dest)?;
    atomic_replace_profile_dir(&dest, &staged_dest)?;
    Ok(ProfileDecision::Applied)
}

fn read_dir_files(dir: &Path) -> Result<HashMap<String, Vec<u8>>> {
    let mut out = HashMap::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir).map_err(|e| CaamError::io(dir, e))? {
        let entry = entry.map_err(|e| CaamError::io(dir, e))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            let bytes = std::fs::read(entry.path()).map_err(|e| CaamError::io(entry.path(), e))?;
            out.insert(entry.file_name().to_string_lossy().into_owned(), bytes);
        }
    }
    Ok(out)
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| CaamError::io(dest, e))?;
    for entry in std::fs::read_dir(src).map_err(|e| CaamError::io(src, e))? {
        let entry = entry.map_err(|e| CaamError::io(src, e))?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            copy_dir(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path).map_err(|e| CaamError::io(&dest_path, e))?;
        }
    }
    Ok(())
}

/// Recursive directory merge: every file the bundle staged overwrites the
/// same-relative-path file at `dest`; files only `dest` has are left alone.
fn merge_dir(src: &Path, dest: &Path) -> Result<()> {
    atomic::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src).map_err(|e| CaamError::io(src, e))? {
        let entry = entry.map_err(|e| CaamError::io(src, e))?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            merge_dir(&entry.path(), &dest_path)?;
        } else {
            let bytes = std::fs::read(entry.path()).map_err(|e| CaamError::io(entry.path(), e))?;
            atomic::write(&dest_path, &bytes)?;
        }
    }
    Ok(())
}

/// §4.9 step 8, plain-copy components (`config.json`, `database.sqlite`):
/// copy the staged file over `dest` verbatim if the bundle included it and
/// the caller named a destination.
fn apply_plain_copy(staged_file: &Path, dest: Option<&PathBuf>, name: &'static str) -> Result<ComponentOutcome> {
    let Some(dest) = dest else {
        return Ok(ComponentOutcome::skipped(name, "no destination path configured"));
    };
    if !staged_file.is_file() {
        return Ok(ComponentOutcome::skipped(name, "bundle does not include this component"));
    }
    let bytes = std::fs::read(staged_file).map_err(|e| CaamError::io(staged_file, e))?;
    atomic::write(dest, &bytes)?;
    Ok(ComponentOutcome::applied(name))
}

/// §4.9 step 8, `projects.json`: JSON-merge over whatever is already at
/// `dest` (bundle wins at the top level, corrupt/missing local is `{}`).
fn apply_projects(staged_file: &Path, dest: Option<&PathBuf>) -> Result<ComponentOutcome> {
    let Some(dest) = dest else {
        return Ok(ComponentOutcome::skipped("projects", "no destination path configured"));
    };
    if !staged_file.is_file() {
        return Ok(ComponentOutcome::skipped("projects", "bundle does not include this component"));
    }
    let bundle_bytes = std::fs::read(staged_file).map_err(|e| CaamError::io(staged_file, e))?;
    let local_bytes = std::fs::read(dest).ok();
    let merged = merge_projects_json(local_bytes.as_deref(), &bundle_bytes)?;
    atomic::write(dest, &merged)?;
    Ok(ComponentOutcome::applied("projects"))
}

/// §4.9 step 8, health: the encoder stages this as either `health.json` (a
/// file source) or `health/` (a directory source) — on import we don't have
/// the original source to ask, so the destination's extension disambiguates:
/// a path with an extension is a file, otherwise it's treated as a directory
/// to merge into.
fn apply_health(staged_root: &Path, dest: Option<&PathBuf>) -> Result<ComponentOutcome> {
    let Some(dest) = dest else {
        return Ok(ComponentOutcome::skipped("health", "no destination path configured"));
    };
    if dest.extension().is_some() {
        apply_plain_copy(&staged_root.join("health.json"), Some(dest), "health")
    } else {
        let staged_dir = staged_root.join("health");
        if !staged_dir.is_dir() {
            return Ok(ComponentOutcome::skipped("health", "bundle does not include this component"));
        }
        merge_dir(&staged_dir, dest)?;
        Ok(ComponentOutcome::applied("health"))
    }
}

/// §4.9 step 8, `sync_config/`: directory-merge into `dest`.
fn apply_sync_config(staged_root: &Path, dest: Option<&PathBuf>) -> Result<ComponentOutcome> {
    let Some(dest) = dest else {
        return Ok(ComponentOutcome::skipped("sync_config", "no destination path configured"));
    };
    let staged_dir = staged_root.join("sync_config");
    if !staged_dir.is_dir() {
        return Ok(ComponentOutcome::skipped("sync_config", "bundle does not include this component"));
    }
    merge_dir(&staged_dir, dest)?;
    Ok(ComponentOutcome::applied("sync_config"))
}

/// Shallow one-level merge of a bundle's `projects.json` over the local
/// copy: bundle entries win at the top level, a corrupt local file is
/// treated as `{}` rather than aborting the import.
pub fn merge_projects_json(local_bytes: Option<&[u8]>, bundle_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut local: serde_json::Value = local_bytes
        .and_then(|b| serde_json::from_slice(b).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    let bundle: serde_json::Value =
        serde_json::from_slice(bundle_bytes).map_err(|e| CaamError::corruption(format!("parsing bundle projects.json: {e}")))?;

    if let (Some(local_map), Some(bundle_map)) = (local.as_object_mut(), bundle.as_object()) {
        for (key, value) in bundle_map {
            local_map.insert(key.clone(), value.clone());
        }
    } else {
        local = bundle;
    }
    serde_json::to_vec_pretty(&local).map_err(|e| CaamError::Internal(format!("serializing merged projects.json: {e}")))
}

/// Decode and apply a bundle at `bundle_path` into `vault`, following the
/// full §4.9 procedure: decrypt, extract with path-safety, validate the
/// manifest, verify checksums, merge vault profiles per `mode` (filtered by
/// `providers` and `name_pattern`, same filters the encoder applies on
/// export), then restore whichever optional components `companion` names a
/// destination for.
///
/// A checksum mismatch or a manifest entry missing from the extracted
/// archive aborts the import unless `force` is set.
#[allow(clippy::too_many_arguments)]
pub fn decode(
    vault: &Vault,
    bundle_path: &Path,
    password: Option<&str>,
    providers: Option<&[Provider]>,
    name_pattern: Option<&str>,
    companion: &CompanionPaths,
    mode: MergeMode,
    force: bool,
) -> Result<DecodeOutcome> {
    let bundle_bytes = load_and_open(bundle_path, password)?;
    let staged = extract_to_temp(bundle_bytes)?;
    let staged_root = staged.path();

    let manifest_path = staged_root.join(MANIFEST_FILE);
    let manifest_bytes = std::fs::read(&manifest_path).map_err(|e| CaamError::io(&manifest_path, e))?;
    let manifest: BundleManifest =
        serde_json::from_slice(&manifest_bytes).map_err(|e| CaamError::corruption(format!("parsing manifest.json: {e}")))?;
    validate_manifest(&manifest)?;

    let checksums = compute_checksums(staged_root, &manifest);
    let invalid = checksums.iter().any(|c| matches!(c.status, ChecksumStatus::Mismatch | ChecksumStatus::Missing));
    if invalid && !force {
        tracing::warn!(path = %bundle_path.display(), "bundle: checksum verification failed, aborting without force");
        return Err(CaamError::conflict("bundle failed checksum verification (mismatch or missing file); retry with force to import anyway"));
    }
    if invalid {
        tracing::warn!(path = %bundle_path.display(), "bundle: checksum verification failed, importing anyway (force)");
    }

    let wanted_providers: Vec<Provider> = providers.map(|p| p.to_vec()).unwrap_or_else(|| Provider::ALL.to_vec());
    let mut profile_outcomes = Vec::new();

    for provider in &wanted_providers {
        let Some(profiles) = manifest.contents.vault.profiles.get(provider) else {
            continue;
        };
        let provider_dir = staged_root.join("vault").join(provider.as_str());
        for profile in profiles {
            if !name_matches(profile, name_pattern) {
                continue;
            }
            let staged_profile_dir = provider_dir.join(profile);
            if !staged_profile_dir.is_dir() {
                continue;
            }
            let decision = apply_profile(vault, *provider, profile, &staged_profile_dir, mode)?;
            profile_outcomes.push(ProfileOutcome { provider: *provider, profile: profile.clone(), decision });
        }
    }

    let components = vec![
        apply_plain_copy(&staged_root.join("config.json"), companion.config.as_ref(), "config")?,
        apply_projects(&staged_root.join("projects.json"), companion.projects.as_ref())?,
        apply_health(staged_root, companion.health.as_ref())?,
        apply_plain_copy(&staged_root.join("database.sqlite"), companion.database.as_ref(), "database")?,
        apply_sync_config(staged_root, companion.sync_config_dir.as_ref())?,
    ];

    tracing::info!(
        path = %bundle_path.display(),
        applied = profile_outcomes.iter().filter(|p| p.decision == ProfileDecision::Applied).count(),
        components = components.iter().filter(|c| c.applied).count(),
        "bundle: decode complete"
    );
    Ok(DecodeOutcome { manifest: Some(manifest), checksums, profiles: profile_outcomes, components })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::encode::{encode, CompanionPaths, EncodeOptions};

    fn build_bundle(dir: &Path, profile: &str, body: &[u8]) -> (Vault, PathBuf) {
        let vault_dir = dir.join("vault_src");
        let vault = Vault::new(&vault_dir);
        vault.backup(Provider::Codex, profile, &[("auth.json".into(), body.to_vec())]).unwrap();

        let output_path = dir.join("bundle.zip");
        encode(
            &vault,
            &CompanionPaths::default(),
            &EncodeOptions { include_config: false, include_projects: false, include_health: false, include_database: false, include_sync_config: false, ..Default::default() },
            &output_path,
            1_700_000_000,
        )
        .unwrap();
        (vault, output_path)
    }

    #[test]
    fn decode_replace_mode_applies_new_profile() {
        let dir = tempfile::tempdir().unwrap();
        let (_src_vault, bundle_path) = build_bundle(dir.path(), "work", br#"{"expires_at": 1700003600}"#);

        let dest_dir = dir.path().join("vault_dest");
        let dest_vault = Vault::new(&dest_dir);
        let outcome = decode(&dest_vault, &bundle_path, None, None, None, &CompanionPaths::default(), MergeMode::Replace, false).unwrap();

        assert_eq!(outcome.profiles.len(), 1);
        assert_eq!(outcome.profiles[0].decision, ProfileDecision::Applied);
        assert!(dest_vault.profile_exists(Provider::Codex, "work"));
        assert!(outcome.checksums.iter().all(|c| c.status == ChecksumStatus::Verified));
    }

    #[test]
    fn decode_merge_mode_skips_existing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let (_src_vault, bundle_path) = build_bundle(dir.path(), "work", br#"{"expires_at": 1700003600}"#);

        let dest_dir = dir.path().join("vault_dest");
        let dest_vault = Vault::new(&dest_dir);
        dest_vault.backup(Provider::Codex, "work", &[("auth.json".into(), b"{\"expires_at\": 9999999999}".to_vec())]).unwrap();

        let outcome = decode(&dest_vault, &bundle_path, None, None, None, &CompanionPaths::default(), MergeMode::Merge, false).unwrap();
        assert_eq!(outcome.profiles[0].decision, ProfileDecision::SkippedAlreadyPresent);
    }

    #[test]
    fn decode_name_pattern_filters_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let vault_dir = dir.path().join("vault_src");
        let vault = Vault::new(&vault_dir);
        vault.backup(Provider::Codex, "work", &[("auth.json".into(), br#"{"expires_at": 1700003600}"#.to_vec())]).unwrap();
        vault.backup(Provider::Codex, "personal", &[("auth.json".into(), br#"{"expires_at": 1700003600}"#.to_vec())]).unwrap();

        let output_path = dir.path().join("bundle.zip");
        encode(
            &vault,
            &CompanionPaths::default(),
            &EncodeOptions { include_config: false, include_projects: false, include_health: false, include_database: false, include_sync_config: false, ..Default::default() },
            &output_path,
            1_700_000_000,
        )
        .unwrap();

        let dest_dir = dir.path().join("vault_dest");
        let dest_vault = Vault::new(&dest_dir);
        let outcome = decode(&dest_vault, &output_path, None, None, Some("work"), &CompanionPaths::default(), MergeMode::Replace, false).unwrap();

        assert_eq!(outcome.profiles.len(), 1);
        assert_eq!(outcome.profiles[0].profile, "work");
        assert!(dest_vault.profile_exists(Provider::Codex, "work"));
        assert!(!dest_vault.profile_exists(Provider::Codex, "personal"));
    }

    #[test]
    fn decode_smart_mode_skips_when_bundle_freshness_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (_src_vault, bundle_path) = build_bundle(dir.path(), "work", b"not valid json at all");

        let dest_dir = dir.path().join("vault_dest");
        let dest_vault = Vault::new(&dest_dir);
        dest_vault.backup(Provider::Codex, "work", &[("auth.json".into(), br#"{"expires_at": 1700003600}"#.to_vec())]).unwrap();

        let outcome = decode(&dest_vault, &bundle_path, None, None, None, &CompanionPaths::default(), MergeMode::Smart, true).unwrap();
        assert_eq!(outcome.profiles[0].decision, ProfileDecision::SkippedBundleFreshnessUnknown);
    }

    #[test]
    fn decode_restores_config_and_merges_projects() {
        let dir = tempfile::tempdir().unwrap();
        let vault_dir = dir.path().join("vault_src");
        let vault = Vault::new(&vault_dir);
        vault.backup(Provider::Codex, "work", &[("auth.json".into(), br#"{"expires_at": 1700003600}"#.to_vec())]).unwrap();

        let config_src = dir.path().join("config_src.json");
        std::fs::write(&config_src, br#"{"theme": "dark"}"#).unwrap();
        let projects_src = dir.path().join("projects_src.json");
        std::fs::write(&projects_src, br#"{"b": 3, "c": 4}"#).unwrap();

        let output_path = dir.path().join("bundle.zip");
        let companion = CompanionPaths { config: Some(config_src), projects: Some(projects_src), health: None, database: None, sync_config_dir: None };
        encode(
            &vault,
            &companion,
            &EncodeOptions { include_health: false, include_database: false, include_sync_config: false, ..Default::default() },
            &output_path,
            1_700_000_000,
        )
        .unwrap();

        let dest_dir = dir.path().join("vault_dest");
        let dest_vault = Vault::new(&dest_dir);
        let config_dest = dir.path().join("config_dest.json");
        let projects_dest = dir.path().join("projects_dest.json");
        std::fs::write(&projects_dest, br#"{"a": 1, "b": 2}"#).unwrap();

        let dest_companion = CompanionPaths { config: Some(config_dest.clone()), projects: Some(projects_dest.clone()), health: None, database: None, sync_config_dir: None };
        let outcome = decode(&dest_vault, &output_path, None, None, None, &dest_companion, MergeMode::Replace, false).unwrap();

        assert!(outcome.components.iter().any(|c| c.name == "config" && c.applied));
        assert!(outcome.components.iter().any(|c| c.name == "projects" && c.applied));
        assert_eq!(std::fs::read(&config_dest).unwrap(), br#"{"theme": "dark"}"#);
        let merged: serde_json::Value = serde_json::from_slice(&std::fs::read(&projects_dest).unwrap()).unwrap();
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 3);
        assert_eq!(merged["c"], 4);
    }

    #[test]
    fn safe_join_rejects_parent_dir_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = safe_join(dir.path(), "../escape.txt").unwrap_err();
        assert!(matches!(err, CaamError::Validation { .. }));
    }

    #[test]
    fn merge_projects_json_prefers_bundle_keys_shallow() {
        let local = br#"{"a": 1, "b": 2}"#;
        let bundle = br#"{"b": 3, "c": 4}"#;
        let merged = merge_projects_json(Some(local), bundle).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&merged).unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"], 3);
        assert_eq!(value["c"], 4);
    }
}
