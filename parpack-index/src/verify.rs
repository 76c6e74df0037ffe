//! Orphan cleanup and background verification.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Error;

use parpack_fs::{FileKind, PosixFileSystem, Stat};

use crate::chunk_name::{parse_hash_dir, ChunkName};
use crate::index::{
    is_dense, md5_digest, DedupDataIndex, LOCK_FILE_NAME, VERIFICATION_INTERVAL_MS,
};

/// Outcome of one [`DedupDataIndex::verify`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifyStats {
    /// Chunk files with a link count of one, deleted.
    pub orphans_removed: u64,
    /// Chunks re-read and re-hashed by the slow pass.
    pub chunks_verified: u64,
    /// Chunks whose content no longer matched their name, renamed
    /// `.corrupt`.
    pub corrupt_found: u64,
    /// Corrupt chunks without a healthy copy left; callers must arrange
    /// a re-upload.
    pub corrupt_unreplicated: u64,
    /// Hash directories removed after becoming empty.
    pub hash_directories_removed: u64,
}

impl DedupDataIndex {
    /// Cleans orphaned chunk files, keeps the numbering dense and, when
    /// `quick` is false, re-verifies chunk content against the names.
    ///
    /// The hash lock is held one file at a time and released between
    /// files, so foreground traffic is never starved. Orphans created
    /// while the pass runs may be missed until the next pass. Chunks are
    /// re-verified roughly once per [`VERIFICATION_INTERVAL_MS`], using
    /// each chunk's mtime as the record of its last verification.
    pub fn verify(&self, quick: bool) -> Result<VerifyStats, Error> {
        let mut stats = VerifyStats::default();
        for entry in self.fs().list(self.root())? {
            let dir = entry?;
            let dir_name = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_owned(),
                None => {
                    log::warn!("skipping non-hash directory: {:?}", dir);
                    continue;
                }
            };
            if dir_name == LOCK_FILE_NAME {
                continue;
            }
            let hash = match parse_hash_dir(&dir_name) {
                Some(hash) => hash,
                None => {
                    log::warn!("skipping non-hash directory: {:?}", dir);
                    continue;
                }
            };
            self.verify_hash_dir(hash, &dir, quick, &mut stats)?;
        }
        Ok(stats)
    }

    fn verify_hash_dir(
        &self,
        hash: u16,
        dir: &Path,
        quick: bool,
        stats: &mut VerifyStats,
    ) -> Result<(), Error> {
        let hash_lock = self.hash_lock(hash)?;

        let names: Vec<String> = {
            let _guard = hash_lock.acquire(self.fs())?;
            match self.fs().stat(dir)? {
                // Raced away on a live file system.
                Some(stat) if stat.kind == FileKind::Directory => {}
                _ => return Ok(()),
            }
            let mut names = Vec::new();
            for entry in self.fs().list(dir)? {
                if let Some(name) = entry?.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_owned());
                }
            }
            names
        };

        let mut removed_any = false;
        for file_name in &names {
            if file_name == LOCK_FILE_NAME {
                continue;
            }
            {
                let _guard = hash_lock.acquire(self.fs())?;
                let path = dir.join(file_name);
                if let Some(stat) = self.fs().stat(&path)? {
                    match ChunkName::parse(file_name) {
                        None => log::warn!("skipping malformed chunk name: {:?}", path),
                        Some(name) => {
                            if stat.kind == FileKind::Regular && stat.nlink == 1 {
                                log::warn!("Removing orphan: {:?}", path);
                                self.fs().delete(&path)?;
                                stats.orphans_removed += 1;
                                removed_any = true;
                            } else if !quick
                                && !name.corrupt
                                && stat.kind == FileKind::Regular
                                && now_millis() - stat.mtime_ms >= VERIFICATION_INTERVAL_MS
                            {
                                self.verify_chunk(hash, dir, &name, &stat, stats)?;
                            }
                        }
                    }
                }
            }
            // Let foreground traffic grab the lock between files.
            std::thread::yield_now();
        }

        if removed_any {
            let _guard = hash_lock.acquire(self.fs())?;
            self.renumber_directory(dir)?;
        }

        // Remove the hash directory once only the lock sentinel is left.
        {
            let _guard = hash_lock.acquire(self.fs())?;
            let mut remaining = Vec::new();
            if self.fs().stat(dir)?.is_some() {
                for entry in self.fs().list(dir)? {
                    if let Some(name) = entry?.file_name().and_then(|n| n.to_str()) {
                        remaining.push(name.to_owned());
                    }
                }
                if remaining.iter().all(|name| name == LOCK_FILE_NAME) {
                    for name in &remaining {
                        self.fs().delete(&dir.join(name))?;
                    }
                    match self.fs().delete(dir) {
                        Ok(()) => stats.hash_directories_removed += 1,
                        // A racing insert may have refilled it.
                        Err(err) => log::debug!("leaving {:?} in place - {:#}", dir, err),
                    }
                }
            }
        }
        Ok(())
    }

    fn verify_chunk(
        &self,
        hash: u16,
        dir: &Path,
        name: &ChunkName,
        stat: &Stat,
        stats: &mut VerifyStats,
    ) -> Result<(), Error> {
        let path = dir.join(name.to_string());
        stats.chunks_verified += 1;
        let matches = match self.read_chunk(dir, name) {
            Ok(content) => {
                let digest = md5_digest(&content)?;
                content.len() as u64 == name.len
                    && u16::from_be_bytes([digest[0], digest[1]]) == hash
                    && digest[2..] == name.rem
            }
            Err(err) => {
                log::warn!("unable to read chunk {:?} - {:#}", path, err);
                false
            }
        };
        if matches {
            // The mtime records when the chunk was last verified.
            self.fs().utime(&path, stat.atime_ms, now_millis())?;
        } else {
            let corrupt = ChunkName {
                corrupt: true,
                ..name.clone()
            };
            self.fs().rename(&path, &dir.join(corrupt.to_string()))?;
            stats.corrupt_found += 1;
            let has_healthy_copy = self
                .scan_group(dir, &name.rem, name.len)?
                .iter()
                .any(|sibling| sibling.collision == name.collision && !sibling.corrupt);
            if has_healthy_copy {
                log::warn!(
                    "chunk {:?} failed verification, marked corrupt; references can migrate to a healthy copy",
                    path
                );
            } else {
                log::error!(
                    "chunk {:?} failed verification and has no healthy copy",
                    path
                );
                stats.corrupt_unreplicated += 1;
            }
        }
        Ok(())
    }

    /// Re-derives dense `collision#`/`link#` numbering for every group
    /// in one hash directory.
    fn renumber_directory(&self, dir: &Path) -> Result<(), Error> {
        let mut names: Vec<ChunkName> = Vec::new();
        for entry in self.fs().list(dir)? {
            if let Some(file_name) = entry?.file_name().and_then(|n| n.to_str()) {
                if file_name == LOCK_FILE_NAME {
                    continue;
                }
                if let Some(name) = ChunkName::parse(file_name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        let mut start = 0;
        while start < names.len() {
            let (rem, len) = (names[start].rem, names[start].len);
            let end = start
                + names[start..]
                    .iter()
                    .position(|name| name.rem != rem || name.len != len)
                    .unwrap_or(names.len() - start);
            if !is_dense(&names[start..end]) {
                self.renumber(dir, &mut names[start..end])?;
            }
            start = end;
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
