//! Bundle encoding: gather, checksum, zip, optionally encrypt
//! (SPEC_FULL.md §4.8).

use super::crypto;
use super::manifest::{
    Arch, BundleManifest, Checksums, ChecksumAlgorithm, Contents, OptionalComponent, Platform, SourceInfo, VaultContents, CURRENT_SCHEMA_VERSION,
};
use crate::atomic;
use crate::error::{CaamError, Result};
use crate::provider::Provider;
use crate::vault::Vault;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ENCRYPTED_MARKER_FILE: &str = ".caam_encrypted";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default)]
pub struct CompanionPaths {
    pub config: Option<PathBuf>,
    pub projects: Option<PathBuf>,
    pub health: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub sync_config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub providers: Option<Vec<Provider>>,
    pub name_pattern: Option<String>,
    pub include_config: bool,
    pub include_projects: bool,
    pub include_health: bool,
    pub include_database: bool,
    pub include_sync_config: bool,
    pub password: Option<String>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            providers: None,
            name_pattern: None,
            include_config: true,
            include_projects: true,
            include_health: true,
            include_database: true,
            include_sync_config: true,
            password: None,
        }
    }
}

fn current_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn current_username() -> String {
    std::env::var("USER").or_else(|_| std::env::var("USERNAME")).unwrap_or_else(|_| "unknown".to_string())
}

pub fn timestamped_filename(now: i64) -> String {
    let dt = chrono::DateTime::from_timestamp(now, 0).unwrap_or_default();
    format!("caam_export_{}.zip", dt.format("%Y-%m-%d_%H%M"))
}

pub fn verbose_filename(now: i64) -> String {
    let dt = chrono::DateTime::from_timestamp(now, 0).unwrap_or_default();
    format!("Exported_Coding_Agent_Account_Auth_Info__As_of__{}.zip", dt.format("%m_%d_%Y__%I_%M_%p"))
}

pub(super) fn name_matches(profile: &str, pattern: Option<&str>) -> bool {
    match pattern {
        None => true,
        Some(p) => profile.contains(p),
    }
}

fn copy_into_checksummed(temp_root: &Path, rel_path: &str, bytes: &[u8], checksums: &mut HashMap<String, String>) -> Result<()> {
    let dest = temp_root.join(rel_path);
    atomic::write(&dest, bytes)?;
    let digest = Sha256::digest(bytes);
    checksums.insert(rel_path.replace('\\', "/"), hex_encode(&digest));
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn copy_optional_file(
    temp_root: &Path,
    rel_path: &str,
    src: &Option<PathBuf>,
    include: bool,
    checksums: &mut HashMap<String, String>,
) -> Result<OptionalComponent> {
    if !include {
        return Ok(OptionalComponent::excluded("not requested"));
    }
    let Some(src) = src else {
        return Ok(OptionalComponent::excluded("no source path configured"));
    };
    if !src.is_file() {
        return Ok(OptionalComponent::excluded("source file does not exist"));
    }
    let bytes = std::fs::read(src).map_err(|e| CaamError::io(src, e))?;
    copy_into_checksummed(temp_root, rel_path, &bytes, checksums)?;
    Ok(OptionalComponent::included_at(rel_path, 1))
}

fn copy_optional_dir(
    temp_root: &Path,
    rel_prefix: &str,
    src: &Option<PathBuf>,
    include: bool,
    checksums: &mut HashMap<String, String>,
) -> Result<OptionalComponent> {
    if !include {
        return Ok(OptionalComponent::excluded("not requested"));
    }
    let Some(src) = src else {
        return Ok(OptionalComponent::excluded("no source path configured"));
    };
    if !src.is_dir() {
        return Ok(OptionalComponent::excluded("source directory does not exist"));
    }

    let mut count = 0;
    for entry in walkdir::WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let rel_path = format!("{rel_prefix}/{}", rel.to_string_lossy());
        let bytes = std::fs::read(entry.path()).map_err(|e| CaamError::io(entry.path(), e))?;
        copy_into_checksummed(temp_root, &rel_path, &bytes, checksums)?;
        count += 1;
    }
    Ok(OptionalComponent::included_at(rel_prefix, count))
}

/// Build and write a bundle archive to `output_path`. Returns the manifest
/// that was embedded, so callers can report what was exported without
/// re-reading the archive.
pub fn encode(vault: &Vault, companion: &CompanionPaths, options: &EncodeOptions, output_path: &Path, now: i64) -> Result<BundleManifest> {
    let temp_dir = tempfile::tempdir().map_err(|e| CaamError::Internal(format!("creating staging dir: {e}")))?;
    let temp_root = temp_dir.path();
    let mut checksums = HashMap::new();

    let providers = options.providers.clone().unwrap_or_else(|| Provider::ALL.to_vec());
    let mut profiles_by_provider: HashMap<Provider, Vec<String>> = HashMap::new();
    let mut total_profiles = 0usize;

    for provider in &providers {
        let mut names = Vec::new();
        for profile in vault.list_profiles(*provider, false)? {
            if !name_matches(&profile, options.name_pattern.as_deref()) {
                continue;
            }
            for (file_name, bytes) in vault.read_profile_files(*provider, &profile)? {
                let rel_path = format!("vault/{}/{}/{}", provider.as_str(), profile, file_name);
                copy_into_checksummed(temp_root, &rel_path, &bytes, &mut checksums)?;
            }
            names.push(profile);
            total_profiles += 1;
        }
        profiles_by_provider.insert(*provider, names);
    }

    let config = copy_optional_file(temp_root, "config.json", &companion.config, options.include_config, &mut checksums)?;
    let projects = copy_optional_file(temp_root, "projects.json", &companion.projects, options.include_projects, &mut checksums)?;
    let health = if options.include_health {
        match &companion.health {
            Some(p) if p.is_dir() => copy_optional_dir(temp_root, "health", &companion.health, true, &mut checksums)?,
            Some(p) if p.is_file() => copy_optional_file(temp_root, "health.json", &companion.health, true, &mut checksums)?,
            _ => OptionalComponent::excluded("no source path configured"),
        }
    } else {
        OptionalComponent::excluded("not requested")
    };
    let database = copy_optional_file(temp_root, "database.sqlite", &companion.database, options.include_database, &mut checksums)?;
    let sync_config = copy_optional_dir(temp_root, "sync_config", &companion.sync_config_dir, options.include_sync_config, &mut checksums)?;

    let manifest = BundleManifest {
        schema_version: CURRENT_SCHEMA_VERSION,
        caam_version: env!("CARGO_PKG_VERSION").to_string(),
        export_timestamp: now,
        source: SourceInfo {
            hostname: current_hostname(),
            platform: Platform::from_os(std::env::consts::OS),
            arch: Arch::from_arch(std::env::consts::ARCH),
            username: current_username(),
            data_path: vault.root().to_string_lossy().into_owned(),
        },
        contents: Contents {
            vault: VaultContents { included: true, profiles: profiles_by_provider, total_profiles },
            config,
            projects,
            health,
            database,
            sync_config,
        },
        checksums: Checksums { algorithm: ChecksumAlgorithm::Sha256, files: checksums },
    };

    let manifest_bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| CaamError::Internal(format!("serializing manifest: {e}")))?;
    atomic::write(&temp_root.join(MANIFEST_FILE), &manifest_bytes)?;

    if options.password.is_some() {
        atomic::write(&temp_root.join(ENCRYPTED_MARKER_FILE), b"")?;
    }

    let archive_bytes = zip_directory(temp_root)?;

    if let Some(password) = &options.password {
        let (ciphertext, metadata) = crypto::seal(&archive_bytes, password)?;
        atomic::write(output_path, &ciphertext)?;
        let meta_path = sidecar_meta_path(output_path);
        let meta_bytes = serde_json::to_vec_pretty(&metadata).map_err(|e| CaamError::Internal(format!("serializing encryption metadata: {e}")))?;
        atomic::write(&meta_path, &meta_bytes)?;
    } else {
        atomic::write(output_path, &archive_bytes)?;
    }

    tracing::info!(path = %output_path.display(), profiles = total_profiles, encrypted = options.password.is_some(), "bundle: encode complete");
    Ok(manifest)
}

pub fn sidecar_meta_path(bundle_path: &Path) -> PathBuf {
    let mut name = bundle_path.as_os_str().to_os_string();
    name.push(".meta");
    PathBuf::from(name)
}

fn zip_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated).unix_permissions(0o600);

        for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            let name = rel.to_string_lossy().replace('\\', "/");
            writer.start_file(name, options).map_err(|e| CaamError::Internal(format!("zip write error: {e}")))?;
            let bytes = std::fs::read(entry.path()).map_err(|e| CaamError::io(entry.path(), e))?;
            writer.write_all(&bytes).map_err(|e| CaamError::Internal(format!("zip write error: {e}")))?;
        }
        writer.finish().map_err(|e| CaamError::Internal(format!("finishing zip: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_manifest_with_checksummed_profile() {
        let vault_dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(vault_dir.path());
        vault.backup(Provider::Codex, "work", &[("auth.json".into(), b"{\"k\":1}".to_vec())]).unwrap();

        let output = tempfile::tempdir().unwrap();
        let output_path = output.path().join("bundle.zip");
        let manifest = encode(&vault, &CompanionPaths::default(), &EncodeOptions { include_config: false, include_projects: false, include_health: false, include_database: false, include_sync_config: false, ..Default::default() }, &output_path, 1_700_000_000).unwrap();

        assert!(output_path.is_file());
        assert_eq!(manifest.contents.vault.total_profiles, 1);
        assert!(manifest.checksums.files.contains_key("vault/codex/work/auth.json"));
    }

    #[test]
    fn timestamped_filename_has_expected_shape() {
        let name = timestamped_filename(1_700_000_000);
        assert!(name.starts_with("caam_export_"));
        assert!(name.ends_with(".zip"));
    }
}
