use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::debug;

/// Owner-only file mode for everything we persist (session blobs, queue
/// snapshots, caches). Directories get the matching 0700.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Crash-safe write of a byte blob to `path`.
///
/// The temp file is created in the same directory as the target so the
/// final rename never crosses a filesystem boundary. If the rename fails
/// the original file is untouched; a partial write is never observable.
pub fn write_atomic_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut tmp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to fsync temp file for {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(FILE_MODE))
            .with_context(|| format!("failed to chmod temp file for {}", path.display()))?;
    }

    tmp.persist(path)
        .with_context(|| format!("failed to rename temp file over {}", path.display()))?;

    // Durability of the rename itself is best-effort.
    if let Ok(dirfile) = fs::File::open(&dir) {
        let _ = dirfile.sync_all();
    }

    debug!("atomically wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Async wrapper so persister tasks do not block the runtime on fsync.
pub async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_sync(&path, &bytes))
        .await
        .context("atomic write task failed")?
}

/// Create the parent directory of `path` (owner-only on unix).
pub fn ensure_dir(path: &Path) -> Result<()> {
    let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))
            .with_context(|| format!("failed to chmod directory {}", dir.display()))?;
    }

    Ok(())
}
