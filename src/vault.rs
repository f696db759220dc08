//! Vault layout and profile lifecycle (SPEC_FULL.md §3, §6).
//!
//! `<data_root>/vault/<provider>/<profile>/...` — the vault exclusively owns
//! every file under its root. Grounded on `auth/config.rs`'s directory
//! creation + permission discipline, generalized from one JSON file to a
//! directory of files, plus the profile-import atomic-replace helper the
//! spec calls its "single most intricate atomic unit" (§9).

use crate::atomic;
use crate::error::{CaamError, Result};
use crate::provider::{validate_profile_name, Provider};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self { root: data_root.into().join("vault") }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn provider_dir(&self, provider: Provider) -> PathBuf {
        self.root.join(provider.as_str())
    }

    pub fn profile_dir(&self, provider: Provider, profile: &str) -> PathBuf {
        self.provider_dir(provider).join(profile)
    }

    pub fn profile_exists(&self, provider: Provider, profile: &str) -> bool {
        self.profile_dir(provider, profile).is_dir()
    }

    /// List profile names under `provider`, excluding system-reserved ones
    /// unless `include_system` is set. Sorted for deterministic iteration
    /// (the selector and sync engine both rely on stable ordering).
    pub fn list_profiles(&self, provider: Provider, include_system: bool) -> Result<Vec<String>> {
        let dir = self.provider_dir(provider);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&dir).map_err(|e| CaamError::io(&dir, e))? {
            let entry = entry.map_err(|e| CaamError::io(&dir, e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !include_system && crate::provider::is_system_profile(&name) {
                continue;
            }
            names.insert(name);
        }
        Ok(names.into_iter().collect())
    }

    /// Copy `files` (relative-basename -> bytes) into a freshly created
    /// profile directory — the "backup" operation. Every file goes through
    /// the atomic writer individually.
    pub fn backup(&self, provider: Provider, profile: &str, files: &[(String, Vec<u8>)]) -> Result<()> {
        validate_profile_name(profile)?;
        let dir = self.profile_dir(provider, profile);
        atomic::create_dir_all(&dir)?;
        for (name, bytes) in files {
            atomic::write(&dir.join(name), bytes)?;
        }
        tracing::debug!(provider = %provider, profile, files = files.len(), "vault: backup complete");
        Ok(())
    }

    /// Read back the files captured by [`backup`] for `provider`/`profile`.
    pub fn read_profile_files(&self, provider: Provider, profile: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let dir = self.profile_dir(provider, profile);
        if !dir.is_dir() {
            return Err(CaamError::not_found(format!("profile {}/{}", provider, profile)));
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| CaamError::io(&dir, e))? {
            let entry = entry.map_err(|e| CaamError::io(&dir, e))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let bytes = fs::read(entry.path()).map_err(|e| CaamError::io(entry.path(), e))?;
            out.push((name, bytes));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// "restore": write the vault's copy of a profile's files out to the
    /// live provider location(s). `write_live` does the actual per-file
    /// write (its own atomicity is the caller's concern — typically
    /// `atomic::write` for local targets, SFTP atomic write for remote).
    pub fn restore(
        &self,
        provider: Provider,
        profile: &str,
        mut write_live: impl FnMut(&str, &[u8]) -> Result<()>,
    ) -> Result<()> {
        for (name, bytes) in self.read_profile_files(provider, profile)? {
            write_live(&name, &bytes)?;
        }
        Ok(())
    }

    pub fn delete_profile(&self, provider: Provider, profile: &str) -> Result<()> {
        let dir = self.profile_dir(provider, profile);
        if dir.is_dir() {
            fs::remove_dir_all(&dir).map_err(|e| CaamError::io(&dir, e))?;
            tracing::debug!(provider = %provider, profile, "vault: profile deleted");
        }
        Ok(())
    }
}

/// Atomically replace a profile directory's contents with `staged`
/// (typically a temp directory freshly populated by the sync engine or
/// bundle decoder). This is the "single most intricate atomic unit" of §9:
///
/// 1. if `dest` exists, rename it to `<dest>.bak`
/// 2. rename `staged` into place at `dest`
/// 3. remove the backup on success, or restore it if step 2 fails
///
/// A half-imported profile is never observable: between steps there is
/// always either the old directory, the backup, or the new directory at
/// `dest`, never a partial tree.
pub fn atomic_replace_profile_dir(dest: &Path, staged: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        atomic::create_dir_all(parent)?;
    }
    let backup = dest.with_extension("bak");
    let had_existing = dest.exists();

    if had_existing {
        fs::rename(dest, &backup).map_err(|e| CaamError::io(dest, e))?;
    }

    match fs::rename(staged, dest) {
        Ok(()) => {
            if had_existing {
                let _ = fs::remove_dir_all(&backup);
            }
            Ok(())
        }
        Err(e) => {
            if had_existing {
                // Best-effort restore; if this also fails the original
                // directory is still intact under `backup`, never lost.
                let _ = fs::rename(&backup, dest);
            }
            tracing::warn!(dest = %dest.display(), error = %e, "vault: atomic profile replace failed, restored previous directory");
            Err(CaamError::io(dest, e))
        }
    }
}
