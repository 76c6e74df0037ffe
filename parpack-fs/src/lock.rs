use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Error};

/// Scoped exclusive advisory lock on a file.
///
/// The lock is taken with `flock(2)` and released when the guard is
/// dropped (closing the descriptor releases the lock).
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Opens (creating if necessary) `path` and blocks until an exclusive
    /// lock is acquired.
    pub fn lock_exclusive(path: &Path, mode: u32) -> Result<Self, Error> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(path)
        {
            Ok(file) => file,
            Err(err) => bail!("unable to open lock {:?} - {}", path, err),
        };
        nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusive)?;
        Ok(FileLock { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        let guard = FileLock::lock_exclusive(&path, 0o600).unwrap();

        // A non-blocking attempt from a second descriptor must fail while
        // the guard is alive, and succeed after it is dropped.
        let probe = std::fs::File::open(&path).unwrap();
        let busy = nix::fcntl::flock(
            probe.as_raw_fd(),
            nix::fcntl::FlockArg::LockExclusiveNonblock,
        );
        assert!(busy.is_err());

        drop(guard);
        nix::fcntl::flock(
            probe.as_raw_fd(),
            nix::fcntl::FlockArg::LockExclusiveNonblock,
        )
        .unwrap();
    }
}
