use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use nix::fcntl::OFlag;
use nix::sys::stat::{FchmodatFlags, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{FchownatFlags, Gid, Uid};

use crate::lock::FileLock;
use crate::stat::{FileKind, Stat};
use crate::PosixFileSystem;

/// [`PosixFileSystem`] backed by the real kernel interfaces.
pub struct DefaultPosixFileSystem;

impl PosixFileSystem for DefaultPosixFileSystem {
    fn stat(&self, path: &Path) -> Result<Option<Stat>, Error> {
        match nix::sys::stat::lstat(path) {
            Ok(stat) => Ok(Some(Stat::from_file_stat(&stat)?)),
            Err(nix::errno::Errno::ENOENT) => Ok(None),
            Err(err) => Err(format_err!("lstat {:?} failed - {}", path, err)),
        }
    }

    fn create_file(&self, path: &Path, mode: u32) -> Result<File, Error> {
        let fd = nix::fcntl::open(
            path,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(mode),
        )
        .map_err(|err| format_err!("unable to create file {:?} - {}", path, err))?;
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn open(&self, path: &Path) -> Result<File, Error> {
        File::open(path).with_context(|| format!("unable to open {:?}", path))
    }

    fn create_directory(&self, path: &Path, mode: u32) -> Result<(), Error> {
        nix::unistd::mkdir(path, Mode::from_bits_truncate(mode))
            .map_err(|err| format_err!("unable to create directory {:?} - {}", path, err))?;
        Ok(())
    }

    fn list(
        &self,
        path: &Path,
    ) -> Result<Box<dyn Iterator<Item = Result<PathBuf, Error>> + Send>, Error> {
        let read_dir =
            std::fs::read_dir(path).with_context(|| format!("unable to list {:?}", path))?;
        Ok(Box::new(read_dir.map(|entry| {
            entry.map(|e| e.path()).map_err(Error::from)
        })))
    }

    fn lock(&self, path: &Path) -> Result<FileLock, Error> {
        FileLock::lock_exclusive(path, 0o600)
    }

    fn delete(&self, path: &Path) -> Result<(), Error> {
        let stat = self
            .stat(path)?
            .ok_or_else(|| format_err!("unable to delete {:?} - no such file", path))?;
        if stat.kind == FileKind::Directory {
            std::fs::remove_dir(path).with_context(|| format!("unable to remove {:?}", path))?;
        } else {
            std::fs::remove_file(path).with_context(|| format!("unable to remove {:?}", path))?;
        }
        Ok(())
    }

    fn delete_recursive(&self, path: &Path) -> Result<(), Error> {
        let stat = self
            .stat(path)?
            .ok_or_else(|| format_err!("unable to delete {:?} - no such file", path))?;
        if stat.kind == FileKind::Directory {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("unable to remove tree {:?}", path))?;
        } else {
            std::fs::remove_file(path).with_context(|| format!("unable to remove {:?}", path))?;
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        std::fs::rename(from, to)
            .with_context(|| format!("unable to rename {:?} to {:?}", from, to))
    }

    fn symlink(&self, target: &str, path: &Path) -> Result<(), Error> {
        std::os::unix::fs::symlink(target, path)
            .with_context(|| format!("unable to create symlink {:?}", path))
    }

    fn hard_link(&self, existing: &Path, new_path: &Path) -> Result<(), Error> {
        std::fs::hard_link(existing, new_path).with_context(|| {
            format!("unable to link {:?} to {:?}", new_path, existing)
        })
    }

    fn read_link(&self, path: &Path) -> Result<String, Error> {
        let target =
            std::fs::read_link(path).with_context(|| format!("unable to read link {:?}", path))?;
        target
            .into_os_string()
            .into_string()
            .map_err(|target| format_err!("symlink target is not UTF-8: {:?}", target))
    }

    fn mknod(&self, path: &Path, mode: u32, device: u64) -> Result<(), Error> {
        let kind = SFlag::from_bits_truncate(mode) & SFlag::S_IFMT;
        if kind != SFlag::S_IFBLK && kind != SFlag::S_IFCHR {
            bail!("mknod {:?} requires a device kind bit in mode 0o{:o}", path, mode);
        }
        nix::sys::stat::mknod(path, kind, Mode::from_bits_truncate(mode), device)
            .map_err(|err| format_err!("mknod {:?} failed - {}", path, err))?;
        Ok(())
    }

    fn mkfifo(&self, path: &Path, mode: u32) -> Result<(), Error> {
        nix::unistd::mkfifo(path, Mode::from_bits_truncate(mode))
            .map_err(|err| format_err!("mkfifo {:?} failed - {}", path, err))?;
        Ok(())
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
        nix::unistd::fchownat(
            None,
            path,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
            FchownatFlags::NoFollowSymlink,
        )
        .map_err(|err| format_err!("chown {:?} failed - {}", path, err))?;
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), Error> {
        nix::sys::stat::fchmodat(
            None,
            path,
            Mode::from_bits_truncate(mode),
            FchmodatFlags::FollowSymlink,
        )
        .map_err(|err| format_err!("chmod {:?} failed - {}", path, err))?;
        Ok(())
    }

    fn utime(&self, path: &Path, atime_ms: i64, mtime_ms: i64) -> Result<(), Error> {
        nix::sys::stat::utimensat(
            None,
            path,
            &timespec_from_millis(atime_ms),
            &timespec_from_millis(mtime_ms),
            UtimensatFlags::FollowSymlink,
        )
        .map_err(|err| format_err!("utime {:?} failed - {}", path, err))?;
        Ok(())
    }
}

fn timespec_from_millis(ms: i64) -> TimeSpec {
    TimeSpec::new(ms.div_euclid(1000), ms.rem_euclid(1000) * 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_of_missing_path_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultPosixFileSystem;
        assert!(fs.stat(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn create_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultPosixFileSystem;
        let path = dir.path().join("f");
        fs.create_file(&path, 0o600).unwrap();
        assert!(fs.create_file(&path, 0o600).is_err());
    }

    #[test]
    fn utime_round_trips_millis() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultPosixFileSystem;
        let path = dir.path().join("f");
        fs.create_file(&path, 0o600).unwrap();
        fs.utime(&path, 1_000, 2_000).unwrap();
        let stat = fs.stat(&path).unwrap().unwrap();
        assert_eq!(stat.atime_ms, 1_000);
        assert_eq!(stat.mtime_ms, 2_000);
    }

    #[test]
    fn delete_picks_unlink_or_rmdir() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DefaultPosixFileSystem;
        let file = dir.path().join("f");
        let sub = dir.path().join("d");
        fs.create_file(&file, 0o600).unwrap();
        fs.create_directory(&sub, 0o700).unwrap();
        fs.delete(&file).unwrap();
        fs.delete(&sub).unwrap();
        assert!(fs.stat(&file).unwrap().is_none());
        assert!(fs.stat(&sub).unwrap().is_none());
    }
}
