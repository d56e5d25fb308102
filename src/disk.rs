use std::path::{Path, PathBuf};

use crate::error::CanneryError;
use crate::host::HostStorage;
use crate::paths;
use crate::util::{GIB, format_size};

pub const HIGH_TIER: u64 = 128 * GIB;
pub const LOW_TIER: u64 = 64 * GIB;

/// The instance's boot disk as handed to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachment {
    pub path: PathBuf,
    pub capacity: u64,
    pub read_only: bool,
}

/// Capacity for a new disk given the host's free space.
pub fn select_capacity(available: u64) -> u64 {
    if available < HIGH_TIER {
        LOW_TIER
    } else {
        HIGH_TIER
    }
}

/// Attach the existing `disk.img`, or create a sparse one sized by free space.
///
/// An existing disk is never resized and free space is not consulted.
pub fn get_or_create(dir: &Path, host: &dyn HostStorage) -> Result<DiskAttachment, CanneryError> {
    let path = paths::disk_image_path(dir);

    match std::fs::metadata(&path) {
        Ok(meta) => {
            tracing::debug!(path = %path.display(), size = meta.len(), "using existing disk");
            return Ok(DiskAttachment {
                path,
                capacity: meta.len(),
                read_only: false,
            });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CanneryError::io(
                format!("inspecting disk {}", path.display()),
                e,
            ));
        }
    }

    let available = host.available_space(dir)?;
    let capacity = select_capacity(available);
    tracing::info!(
        path = %path.display(),
        capacity = %format_size(capacity),
        available = %format_size(available),
        "creating disk"
    );

    if let Err(e) = host.create_sparse_file(&path, capacity) {
        // AlreadyExists means another creator got there first; that file is theirs.
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            let _ = std::fs::remove_file(&path);
        }
        return Err(if is_space_error(&e) {
            CanneryError::DiskSpaceUnavailable {
                path: path.display().to_string(),
                requested: format_size(capacity),
            }
        } else {
            CanneryError::io(format!("creating disk {}", path.display()), e)
        });
    }

    Ok(DiskAttachment {
        path,
        capacity,
        read_only: false,
    })
}

fn is_space_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(e.kind(), ErrorKind::StorageFull | ErrorKind::FileTooLarge)
        || matches!(
            e.raw_os_error(),
            Some(code) if code == nix::errno::Errno::ENOSPC as i32
                || code == nix::errno::Errno::EFBIG as i32
        )
}
