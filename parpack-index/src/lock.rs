//! Per-hash-directory locking.
//!
//! Mutual exclusion is two-layered: an in-process mutex per hash
//! directory, and while that is held, an exclusive advisory lock on the
//! directory's `lock` sentinel file so separate processes can share one
//! index. All locks are exclusive; concurrency comes from there being up
//! to 2^16 independent ones.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use anyhow::Error;
use parpack_fs::{FileLock, PosixFileSystem};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

thread_local! {
    /// Hash locks held by the current thread, for reentrancy detection.
    static HELD: RefCell<HashSet<(usize, u16)>> = RefCell::new(HashSet::new());
}

/// One hash directory's lock pair. Created on first demand and kept for
/// the life of the process.
pub(crate) struct HashDirectoryLock {
    hash: u16,
    mutex: Mutex<()>,
    lock_path: PathBuf,
}

struct HeldRegistration {
    key: (usize, u16),
}

impl Drop for HeldRegistration {
    fn drop(&mut self) {
        HELD.with(|held| {
            held.borrow_mut().remove(&self.key);
        });
    }
}

/// Scoped hash-directory lock; drops release the file lock, then the
/// mutex.
pub(crate) struct HashDirectoryGuard<'a> {
    _file: FileLock,
    _mutex: MutexGuard<'a, ()>,
    _registration: HeldRegistration,
}

impl HashDirectoryLock {
    pub fn new(hash: u16, lock_path: PathBuf) -> Self {
        HashDirectoryLock {
            hash,
            mutex: Mutex::new(()),
            lock_path,
        }
    }

    /// Takes the in-process mutex, then the cross-process file lock.
    ///
    /// The lock is not reentrant; taking it twice on one thread is a
    /// programming error and panics instead of deadlocking.
    pub fn acquire(&self, fs: &dyn PosixFileSystem) -> Result<HashDirectoryGuard<'_>, Error> {
        let key = (self as *const Self as usize, self.hash);
        HELD.with(|held| {
            if !held.borrow_mut().insert(key) {
                panic!(
                    "hash directory lock {:04x} is already held by this thread",
                    self.hash
                );
            }
        });
        let registration = HeldRegistration { key };
        let mutex = lock_unpoisoned(&self.mutex);
        let file = fs.lock(&self.lock_path)?;
        Ok(HashDirectoryGuard {
            _file: file,
            _mutex: mutex,
            _registration: registration,
        })
    }
}
