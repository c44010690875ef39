use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::error::{PowerguardError, Result};

pub const DEFAULT_LOCK_PATH: &str = "/run/powerguard.lock";

/// Exclusive advisory lock held for the lifetime of the daemon
///
/// Only one process may own the privileged register handles; a second
/// instance fails fast instead of racing on the same registers.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| PowerguardError::from_open(&path.display().to_string(), e))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => {
                return Err(PowerguardError::InstanceLocked(path.display().to_string()))
            }
            Err(e) => return Err(PowerguardError::NixError(e)),
        }

        tracing::debug!("Acquired instance lock {}", path.display());
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("powerguard.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        let second = InstanceLock::acquire(&path);
        assert!(matches!(second, Err(PowerguardError::InstanceLocked(_))));
        assert!(second.unwrap_err().is_fatal());

        drop(first);
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
