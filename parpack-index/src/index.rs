//! The index proper: lookup/insert of content-addressed chunks.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Context, Error};
use flate2::Compression;
use lazy_static::lazy_static;
use openssl::hash::{hash, MessageDigest};

use parpack_fs::{FileKind, PosixFileSystem, Stat};

use crate::chunk_name::{hash_dir_name, ChunkName};
use crate::lock::{lock_unpoisoned, HashDirectoryLock};

/// Hard links per inode before a fresh copy of the content is stored.
/// ext4 allows 65000; staying below leaves headroom for administrative
/// links.
pub const FILE_SYSTEM_MAX_LINK_COUNT: u64 = 60000;

/// Reference count at which a second copy of a chunk is created.
pub const DUPLICATE_LINK_COUNT: u64 = 100;

/// Reference count at which a duplicated chunk collapses back to a
/// single copy.
pub const COALESCE_LINK_COUNT: u64 = 50;

/// Assumed file system block size; compression only pays off when it
/// crosses a block boundary.
pub const FILE_SYSTEM_BLOCK_SIZE: u64 = 4096;

/// How often the slow verifier re-checks each chunk.
pub const VERIFICATION_INTERVAL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Bits of the MD5 used for the directory hash.
pub const DIRECTORY_HASH_BITS: u32 = 16;

/// Number of hash directories (and hash locks).
pub const HASH_DIRECTORY_COUNT: u32 = 1 << DIRECTORY_HASH_BITS;

pub(crate) const LOCK_FILE_NAME: &str = "lock";

const DIRECTORY_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

lazy_static! {
    /// One index instance per root path, process-wide.
    static ref INSTANCES: Mutex<HashMap<PathBuf, Arc<DedupDataIndex>>> =
        Mutex::new(HashMap::new());
}

/// A content-addressed chunk index rooted at one directory.
///
/// See the crate docs for the on-disk layout. All operations serialize
/// per hash directory; distinct hash directories proceed in parallel.
pub struct DedupDataIndex {
    fs: Arc<dyn PosixFileSystem>,
    root: PathBuf,
    hash_locks: Mutex<HashMap<u16, Arc<HashDirectoryLock>>>,
}

impl DedupDataIndex {
    /// Gets the index for `root`, creating the directory when missing.
    /// Only one instance exists per root path.
    pub fn get_instance(
        fs: Arc<dyn PosixFileSystem>,
        root: PathBuf,
    ) -> Result<Arc<DedupDataIndex>, Error> {
        let mut instances = lock_unpoisoned(&INSTANCES);
        if let Some(instance) = instances.get(&root) {
            return Ok(instance.clone());
        }
        match fs.stat(&root)? {
            None => fs.create_directory(&root, DIRECTORY_MODE)?,
            Some(stat) if stat.kind != FileKind::Directory => {
                bail!("Not a directory: {:?}", root)
            }
            Some(_) => {}
        }
        let instance = Arc::new(DedupDataIndex {
            fs,
            root: root.clone(),
            hash_locks: Mutex::new(HashMap::new()),
        });
        instances.insert(root, instance.clone());
        Ok(instance)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn fs(&self) -> &dyn PosixFileSystem {
        self.fs.as_ref()
    }

    /// Gets the lock for one hash directory, creating the directory and
    /// its `lock` sentinel on first use. Locks are never discarded.
    pub(crate) fn hash_lock(&self, hash: u16) -> Result<Arc<HashDirectoryLock>, Error> {
        let mut locks = lock_unpoisoned(&self.hash_locks);
        if let Some(lock) = locks.get(&hash) {
            return Ok(lock.clone());
        }
        let dir = self.root.join(format!("{:04x}", hash));
        match self.fs.stat(&dir)? {
            None => {
                if let Err(err) = self.fs.create_directory(&dir, DIRECTORY_MODE) {
                    // Another process may have raced us to it.
                    match self.fs.stat(&dir)? {
                        Some(stat) if stat.kind == FileKind::Directory => {}
                        _ => return Err(err),
                    }
                }
            }
            Some(stat) if stat.kind != FileKind::Directory => {
                bail!("Not a directory: {:?}", dir)
            }
            Some(_) => {}
        }
        let lock_path = dir.join(LOCK_FILE_NAME);
        match self.fs.stat(&lock_path)? {
            None => {
                if let Err(err) = self.fs.create_file(&lock_path, FILE_MODE) {
                    match self.fs.stat(&lock_path)? {
                        Some(stat) if stat.kind == FileKind::Regular => {}
                        _ => return Err(err),
                    }
                }
            }
            Some(stat) if stat.kind != FileKind::Regular => {
                bail!("Not a regular file: {:?}", lock_path)
            }
            Some(_) => {}
        }
        let lock = Arc::new(HashDirectoryLock::new(hash, lock_path));
        locks.insert(hash, lock.clone());
        Ok(lock)
    }

    /// Finds or stores a chunk for `content` and returns the path of the
    /// link copy new references should point at. The caller hard-links
    /// that path into its own tree.
    ///
    /// Zero-length content is never indexed.
    pub fn insert(&self, content: &[u8]) -> Result<PathBuf, Error> {
        if content.is_empty() {
            bail!("refusing to index a zero-length chunk");
        }
        let digest = md5_digest(content)?;
        let hash = u16::from_be_bytes([digest[0], digest[1]]);
        let hash_lock = self.hash_lock(hash)?;
        let _guard = hash_lock.acquire(self.fs.as_ref())?;

        let hash_dir = self.root.join(hash_dir_name(&digest));
        let mut rem = [0u8; 14];
        rem.copy_from_slice(&digest[2..]);
        let len = content.len() as u64;

        let mut group = self.scan_group(&hash_dir, &rem, len)?;
        if !is_dense(&group) {
            // Gap left by an unclean shutdown; repair before allocating.
            self.renumber(&hash_dir, &mut group)?;
        }

        let mut next_collision = 0;
        let mut start = 0;
        while start < group.len() {
            let collision = group[start].collision;
            let end = start
                + group[start..]
                    .iter()
                    .position(|name| name.collision != collision)
                    .unwrap_or(group.len() - start);
            next_collision = collision + 1;
            let members = &group[start..end];
            if let Some(canonical) = members.iter().find(|name| !name.corrupt) {
                let stored = self.read_chunk(&hash_dir, canonical)?;
                if stored == content {
                    return self.choose_link_copy(&hash_dir, members, content);
                }
            }
            start = end;
        }

        // No group carries these bytes: a fresh collision ordinal.
        let name = self.store_chunk(&hash_dir, rem, len, next_collision, 0, content)?;
        Ok(hash_dir.join(name.to_string()))
    }

    /// All names in `hash_dir` addressing `(rem, len)`, sorted by
    /// `(collision, link)`.
    pub(crate) fn scan_group(
        &self,
        hash_dir: &Path,
        rem: &[u8; 14],
        len: u64,
    ) -> Result<Vec<ChunkName>, Error> {
        let mut group = Vec::new();
        if self.fs.stat(hash_dir)?.is_none() {
            return Ok(group);
        }
        for entry in self.fs.list(hash_dir)? {
            let entry = entry?;
            let file_name = match entry.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if file_name == LOCK_FILE_NAME {
                continue;
            }
            if let Some(name) = ChunkName::parse(file_name) {
                if &name.rem == rem && name.len == len {
                    group.push(name);
                }
            }
        }
        group.sort();
        Ok(group)
    }

    fn choose_link_copy(
        &self,
        hash_dir: &Path,
        members: &[ChunkName],
        content: &[u8],
    ) -> Result<PathBuf, Error> {
        let mut copies: Vec<(&ChunkName, Stat)> = Vec::new();
        for name in members.iter().filter(|name| !name.corrupt) {
            if let Some(stat) = self.fs.stat(&hash_dir.join(name.to_string()))? {
                copies.push((name, stat));
            }
        }
        let sample = &members[0];
        let next_link = members.iter().map(|name| name.link).max().map_or(0, |m| m + 1);

        if copies.is_empty() {
            let name = self.store_chunk(
                hash_dir,
                sample.rem,
                sample.len,
                sample.collision,
                next_link,
                content,
            )?;
            return Ok(hash_dir.join(name.to_string()));
        }

        let total_refs: u64 = copies
            .iter()
            .map(|(_, stat)| stat.nlink.saturating_sub(1))
            .sum();

        // A coalesced group funnels new references back into copy 0 so
        // the extra copies drain and get reclaimed as orphans.
        if copies.len() > 1 && total_refs <= COALESCE_LINK_COUNT {
            let (name, stat) = &copies[0];
            if stat.nlink < FILE_SYSTEM_MAX_LINK_COUNT {
                return Ok(hash_dir.join(name.to_string()));
            }
        }

        if copies.len() == 1 {
            let (name, stat) = &copies[0];
            if stat.nlink.saturating_sub(1) >= DUPLICATE_LINK_COUNT {
                let new = self.store_chunk(
                    hash_dir,
                    name.rem,
                    name.len,
                    name.collision,
                    next_link,
                    content,
                )?;
                return Ok(hash_dir.join(new.to_string()));
            }
            if stat.nlink < FILE_SYSTEM_MAX_LINK_COUNT {
                return Ok(hash_dir.join(name.to_string()));
            }
        } else if let Some((name, _)) = copies
            .iter()
            .filter(|(_, stat)| stat.nlink < FILE_SYSTEM_MAX_LINK_COUNT)
            .min_by_key(|(name, stat)| (stat.nlink, name.link))
        {
            // Distribute references evenly across the copies with
            // headroom.
            return Ok(hash_dir.join(name.to_string()));
        }

        // Every existing copy is at the link ceiling.
        let new = self.store_chunk(
            hash_dir,
            sample.rem,
            sample.len,
            sample.collision,
            next_link,
            content,
        )?;
        Ok(hash_dir.join(new.to_string()))
    }

    /// Writes a new physical chunk file, applying the compression
    /// policy: content shorter than a block stays raw; otherwise gzip is
    /// kept only when it crosses a block boundary.
    fn store_chunk(
        &self,
        hash_dir: &Path,
        rem: [u8; 14],
        len: u64,
        collision: u32,
        link: u32,
        content: &[u8],
    ) -> Result<ChunkName, Error> {
        let mut gzipped = false;
        let mut stored: Cow<[u8]> = Cow::Borrowed(content);
        if len >= FILE_SYSTEM_BLOCK_SIZE {
            let compressed = gzip_bytes(content)?;
            if block_count(compressed.len() as u64) < block_count(len) {
                gzipped = true;
                stored = Cow::Owned(compressed);
            }
        }
        let name = ChunkName {
            rem,
            len,
            collision,
            link,
            gzipped,
            corrupt: false,
        };
        let path = hash_dir.join(name.to_string());
        let mut file = self.fs.create_file(&path, FILE_MODE)?;
        file.write_all(&stored)
            .with_context(|| format!("unable to write chunk {:?}", path))?;
        Ok(name)
    }

    /// Reads a chunk's content bytes, decompressing when stored gzipped.
    pub(crate) fn read_chunk(
        &self,
        hash_dir: &Path,
        name: &ChunkName,
    ) -> Result<Vec<u8>, Error> {
        let path = hash_dir.join(name.to_string());
        let mut file = self.fs.open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .with_context(|| format!("unable to read chunk {:?}", path))?;
        if name.gzipped {
            gunzip_bytes(&raw).with_context(|| format!("unable to decompress chunk {:?}", path))
        } else {
            Ok(raw)
        }
    }

    /// Renames the files of one `(rem, len)` group so `collision#` and
    /// `link#` are dense again. `group` must be sorted; it is updated in
    /// place.
    pub(crate) fn renumber(
        &self,
        hash_dir: &Path,
        group: &mut [ChunkName],
    ) -> Result<(), Error> {
        let mut previous: Option<u32> = None;
        let mut next_collision = 0u32;
        let mut next_link = 0u32;
        for name in group.iter_mut() {
            match previous {
                Some(collision) if collision == name.collision => {}
                Some(_) => {
                    next_collision += 1;
                    next_link = 0;
                    previous = Some(name.collision);
                }
                None => previous = Some(name.collision),
            }
            let new = ChunkName {
                collision: next_collision,
                link: next_link,
                ..name.clone()
            };
            next_link += 1;
            if new != *name {
                let from = hash_dir.join(name.to_string());
                let to = hash_dir.join(new.to_string());
                log::debug!("renumbering {:?} to {:?}", from, to);
                self.fs.rename(&from, &to)?;
                *name = new;
            }
        }
        Ok(())
    }
}

/// True when `collision#` values are dense from 0 and every group's
/// `link#` values are dense from 0. Expects `(collision, link)` order.
pub(crate) fn is_dense(group: &[ChunkName]) -> bool {
    let mut expected_collision = 0;
    let mut index = 0;
    while index < group.len() {
        let collision = group[index].collision;
        if collision != expected_collision {
            return false;
        }
        let mut expected_link = 0;
        while index < group.len() && group[index].collision == collision {
            if group[index].link != expected_link {
                return false;
            }
            expected_link += 1;
            index += 1;
        }
        expected_collision += 1;
    }
    true
}

pub(crate) fn md5_digest(content: &[u8]) -> Result<[u8; 16], Error> {
    let digest = hash(MessageDigest::md5(), content)?;
    <[u8; 16]>::try_from(digest.as_ref())
        .map_err(|_| format_err!("md5 digest has unexpected length"))
}

pub(crate) fn block_count(len: u64) -> u64 {
    (len + FILE_SYSTEM_BLOCK_SIZE - 1) / FILE_SYSTEM_BLOCK_SIZE
}

pub(crate) fn gzip_bytes(content: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(encoder.finish()?)
}

pub(crate) fn gunzip_bytes(raw: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = flate2::read::GzDecoder::new(raw);
    let mut content = Vec::new();
    decoder.read_to_end(&mut content)?;
    Ok(content)
}
