//! Host filesystem capabilities used by the provisioning code.
//!
//! Kept behind a trait so disk sizing can be exercised against a fake
//! amount of free space.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::CanneryError;

pub trait HostStorage: Send + Sync {
    /// Bytes available to an unprivileged user on the filesystem holding `path`.
    fn available_space(&self, path: &Path) -> Result<u64, CanneryError>;

    /// Create a sparse file of `size` bytes. Must fail if `path` exists.
    fn create_sparse_file(&self, path: &Path, size: u64) -> std::io::Result<()>;
}

/// The real host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHost;

impl HostStorage for LocalHost {
    fn available_space(&self, path: &Path) -> Result<u64, CanneryError> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|errno| {
            CanneryError::io(
                format!("querying free space for {}", path.display()),
                std::io::Error::from(errno),
            )
        })?;
        let bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        tracing::debug!(path = %path.display(), bytes, "host free space");
        Ok(bytes)
    }

    fn create_sparse_file(&self, path: &Path, size: u64) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        file.sync_all()
    }
}

/// Move `path` into `trash_dir` under a unique, timestamped name and
/// return the new location. Nothing is deleted.
pub fn move_to_trash(path: &Path, trash_dir: &Path) -> Result<PathBuf, CanneryError> {
    std::fs::create_dir_all(trash_dir)
        .map_err(|e| CanneryError::io(format!("creating trash {}", trash_dir.display()), e))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "instance".into());
    let stamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut dest = trash_dir.join(format!("{name}-{stamp}"));
    let mut n = 1;
    while dest.exists() {
        dest = trash_dir.join(format!("{name}-{stamp}-{n}"));
        n += 1;
    }

    std::fs::rename(path, &dest).map_err(|e| {
        CanneryError::io(
            format!("moving {} to {}", path.display(), dest.display()),
            e,
        )
    })?;
    tracing::info!(from = %path.display(), to = %dest.display(), "moved to trash");
    Ok(dest)
}
