//! Narrow POSIX filesystem contract shared by the pack transport and the
//! dedup data index.
//!
//! The consumers only ever talk to [`PosixFileSystem`]; the production
//! implementation is [`DefaultPosixFileSystem`]. Keeping the surface this
//! small is what allows the index and the transport to be tested against
//! scratch directories and, later, alternative backends.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

mod default;
mod lock;
mod stat;

pub use default::DefaultPosixFileSystem;
pub use lock::FileLock;
pub use stat::{FileKind, Stat};

/// Longest permitted path component, in bytes (POSIX `NAME_MAX`).
pub const MAX_NAME_LENGTH: usize = 255;

/// Validates a single path component.
///
/// Rejects empty names, `.`, `..`, names containing NUL or `/`, and names
/// longer than [`MAX_NAME_LENGTH`] bytes.
pub fn check_file_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        bail!("path component must not be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        bail!(
            "path component must not be longer than {} bytes: {:?}",
            MAX_NAME_LENGTH,
            name
        );
    }
    if name.contains('\0') {
        bail!("path component must not contain the NUL character: {:?}", name);
    }
    if name.contains('/') {
        bail!("path component must not contain '/': {:?}", name);
    }
    if name == "." {
        bail!("path component must not be \".\"");
    }
    if name == ".." {
        bail!("path component must not be \"..\"");
    }
    Ok(())
}

/// The most basic layer of what POSIX file systems have in common.
///
/// All metadata queries use `lstat` semantics; symlinks are never
/// followed. `chown` applies to the link itself so symlink ownership can
/// be restored.
pub trait PosixFileSystem: Send + Sync {
    /// Stats the node at `path`; `Ok(None)` when it does not exist.
    fn stat(&self, path: &Path) -> Result<Option<Stat>, Error>;

    /// Atomically creates an empty regular file with the given permission
    /// bits and returns the open write handle. Fails if the path exists.
    fn create_file(&self, path: &Path, mode: u32) -> Result<File, Error>;

    /// Opens an existing regular file read-only.
    fn open(&self, path: &Path) -> Result<File, Error>;

    /// Atomically creates a directory with the given permission bits.
    /// Fails if the path exists.
    fn create_directory(&self, path: &Path, mode: u32) -> Result<(), Error>;

    /// Lists the children of a directory. The returned iterator is lazy,
    /// finite and non-restartable; drop it to release the handle.
    fn list(
        &self,
        path: &Path,
    ) -> Result<Box<dyn Iterator<Item = Result<PathBuf, Error>> + Send>, Error>;

    /// Takes a scoped exclusive advisory lock on `path`, creating the
    /// file when missing. Released when the guard is dropped.
    fn lock(&self, path: &Path) -> Result<FileLock, Error>;

    /// Removes a single node (`unlink` or `rmdir` by kind).
    fn delete(&self, path: &Path) -> Result<(), Error>;

    /// Removes a node and, for directories, everything below it.
    fn delete_recursive(&self, path: &Path) -> Result<(), Error>;

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error>;

    fn symlink(&self, target: &str, path: &Path) -> Result<(), Error>;

    fn hard_link(&self, existing: &Path, new_path: &Path) -> Result<(), Error>;

    fn read_link(&self, path: &Path) -> Result<String, Error>;

    /// Creates a device node. `mode` carries the device kind bit
    /// (`S_IFBLK`/`S_IFCHR`) in addition to the permission bits.
    fn mknod(&self, path: &Path, mode: u32, device: u64) -> Result<(), Error>;

    fn mkfifo(&self, path: &Path, mode: u32) -> Result<(), Error>;

    /// Changes ownership of the link itself (`lchown` semantics).
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), Error>;

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), Error>;

    /// Sets access and modification times, in millisecond epoch values.
    fn utime(&self, path: &Path, atime_ms: i64, mtime_ms: i64) -> Result<(), Error>;
}
