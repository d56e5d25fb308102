//! Cross-process ownership of an instance directory.
//!
//! The process provisioning or running an instance holds an exclusive
//! `flock` on `<instance>/cannery.pid`, with its PID written inside. Other
//! processes refuse to boot or delete the instance while it is held. The
//! lock goes away with the process, so a crash never leaves a stale owner.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::CanneryError;
use crate::paths;

pub struct InstanceLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock for the instance in `dir`, failing with `InstanceBusy`
    /// if another holder has it.
    pub fn acquire(dir: &Path, name: &str) -> Result<Self, CanneryError> {
        let path = paths::pid_path(dir);
        let context = || format!("locking {}", path.display());
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CanneryError::io(context(), e))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(CanneryError::InstanceBusy {
                    name: name.to_string(),
                    pid: holder_pid(&path),
                });
            }
            Err((_, errno)) => return Err(CanneryError::io(context(), errno.into())),
        };

        lock.set_len(0).map_err(|e| CanneryError::io(context(), e))?;
        write!(lock, "{}", std::process::id()).map_err(|e| CanneryError::io(context(), e))?;
        tracing::debug!(path = %path.display(), "instance locked");

        Ok(Self { _file: lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// PID recorded by the current holder, if readable.
fn holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let first = InstanceLock::acquire(dir.path(), "vm").unwrap();
        assert_eq!(
            std::fs::read_to_string(first.path()).unwrap(),
            std::process::id().to_string()
        );

        match InstanceLock::acquire(dir.path(), "vm") {
            Err(CanneryError::InstanceBusy { name, pid }) => {
                assert_eq!(name, "vm");
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("expected InstanceBusy, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        drop(InstanceLock::acquire(dir.path(), "vm").unwrap());
        InstanceLock::acquire(dir.path(), "vm").unwrap();
    }
}
