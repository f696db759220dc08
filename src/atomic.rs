//! Write-to-temp + fsync + rename primitive (SPEC_FULL.md §4.1).
//!
//! This is the only permitted way to mutate a file this crate owns. Every
//! persisted artifact (manifest, identity, pool, queue, history, credential
//! file copies, encryption metadata) goes through here.

use crate::error::{CaamError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
const FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{file_name}.tmp"))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else { return Ok(()) };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|e| CaamError::io(parent, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(DIR_MODE));
    }
    Ok(())
}

/// Write `bytes` to `path` atomically: create `<path>.tmp` (mode 0600), write,
/// fsync, close, rename over `path`. On any error before the rename, the temp
/// file is removed so no stray `.tmp` artifact survives a failed call.
pub fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp = tmp_path_for(path);

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp).map_err(|e| CaamError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| CaamError::io(&tmp, e))?;
        file.sync_all().map_err(|e| CaamError::io(&tmp, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(FILE_MODE))
                .map_err(|e| CaamError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| CaamError::io(path, e))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Convenience wrapper: serialize `value` as pretty JSON and write it
/// atomically.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| CaamError::Internal(format!("serializing {}: {e}", path.display())))?;
    write(path, &json)
}

/// Async variant for call sites already inside a `tokio` task (the sync
/// engine's per-peer loop). The fsync + permission-set step runs on the
/// blocking pool since `tokio::fs::File::sync_all` is not reliably
/// cancel-safe across platforms.
pub async fn write_async(path: &Path, bytes: Vec<u8>) -> Result<()> {
    ensure_parent_dir(path)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write(&path, &bytes))
        .await
        .map_err(|e| CaamError::Internal(format!("atomic write task panicked: {e}")))?
}

/// Directory creation with mode 0700, used wherever a vault/sync directory is
/// created for the first time.
pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| CaamError::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn overwrite_replaces_fully_no_tmp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        write(&path, b"first").unwrap();
        write(&path, b"second-longer-payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second-longer-payload");
        assert!(!tmp_path_for(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        write(&path, b"{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
    }

    #[tokio::test]
    async fn async_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b.json");
        write_async(&path, b"async-bytes".to_vec()).await.unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"async-bytes");
    }
}
