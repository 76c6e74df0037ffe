use anyhow::{bail, Error};
use nix::sys::stat::{FileStat, SFlag};

/// The node kinds a POSIX file system can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharacterDevice,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Result<Self, Error> {
        let kind = mode & SFlag::S_IFMT.bits();
        if kind == SFlag::S_IFREG.bits() {
            Ok(FileKind::Regular)
        } else if kind == SFlag::S_IFDIR.bits() {
            Ok(FileKind::Directory)
        } else if kind == SFlag::S_IFLNK.bits() {
            Ok(FileKind::Symlink)
        } else if kind == SFlag::S_IFBLK.bits() {
            Ok(FileKind::BlockDevice)
        } else if kind == SFlag::S_IFCHR.bits() {
            Ok(FileKind::CharacterDevice)
        } else if kind == SFlag::S_IFIFO.bits() {
            Ok(FileKind::Fifo)
        } else if kind == SFlag::S_IFSOCK.bits() {
            Ok(FileKind::Socket)
        } else {
            bail!("unsupported file type in mode 0o{:o}", mode)
        }
    }

    /// The `S_IFMT` bits for this kind.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::Regular => SFlag::S_IFREG.bits(),
            FileKind::Directory => SFlag::S_IFDIR.bits(),
            FileKind::Symlink => SFlag::S_IFLNK.bits(),
            FileKind::BlockDevice => SFlag::S_IFBLK.bits(),
            FileKind::CharacterDevice => SFlag::S_IFCHR.bits(),
            FileKind::Fifo => SFlag::S_IFIFO.bits(),
            FileKind::Socket => SFlag::S_IFSOCK.bits(),
        }
    }
}

/// Snapshot of a node's metadata, taken with `lstat` (symlinks are never
/// followed). Timestamps are millisecond epoch values.
#[derive(Clone, Debug)]
pub struct Stat {
    pub kind: FileKind,
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub dev: u64,
    pub ino: u64,
    /// Device identifier for block and character devices.
    pub rdev: u64,
    pub size: u64,
    pub atime_ms: i64,
    pub mtime_ms: i64,
}

impl Stat {
    pub fn from_file_stat(stat: &FileStat) -> Result<Self, Error> {
        Ok(Stat {
            kind: FileKind::from_mode(stat.st_mode as u32)?,
            mode: stat.st_mode as u32,
            uid: stat.st_uid,
            gid: stat.st_gid,
            nlink: stat.st_nlink as u64,
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
            rdev: stat.st_rdev as u64,
            size: stat.st_size as u64,
            atime_ms: millis(stat.st_atime, stat.st_atime_nsec),
            mtime_ms: millis(stat.st_mtime, stat.st_mtime_nsec),
        })
    }

    /// Permission bits only (including setuid/setgid/sticky).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

fn millis(secs: i64, nsecs: i64) -> i64 {
    secs * 1000 + nsecs / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_mode_bits() {
        for kind in [
            FileKind::Regular,
            FileKind::Directory,
            FileKind::Symlink,
            FileKind::BlockDevice,
            FileKind::CharacterDevice,
            FileKind::Fifo,
            FileKind::Socket,
        ] {
            assert_eq!(FileKind::from_mode(kind.mode_bits() | 0o644).unwrap(), kind);
        }
    }

    #[test]
    fn mode_without_type_bits_is_rejected() {
        assert!(FileKind::from_mode(0o644).is_err());
    }
}
