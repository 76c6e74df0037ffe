//! Unpacking a record stream into a target directory.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use flate2::read::GzDecoder;

use parpack_fs::{check_file_name, FileKind, PosixFileSystem, Stat};

use crate::dir_stack::DirMtimeStacks;
use crate::protocol::{RecordType, BUFFER_SIZE, HEADER, VERSION};
use crate::verbose::VerboseQueue;
use crate::wire::{read_bool, read_file_data, skip_file_data, PathDecoder, ReadExt};
use crate::{check_abort, AbortFlag};

/// Options for [`extract_pack`].
#[derive(Default)]
pub struct UnpackOptions {
    /// Read and validate the whole stream without touching the file
    /// system.
    pub dry_run: bool,
    /// Replace existing entries instead of failing on them.
    pub force: bool,
    /// Sink for one line per unpacked entry (the archive-relative path).
    pub verbose: Option<Box<dyn Write + Send>>,
    /// Cooperative cancellation; checked once per record.
    pub abort: Option<AbortFlag>,
}

enum PackReader<R: Read> {
    Plain(R),
    Gzip(GzDecoder<R>),
}

impl<R: Read> Read for PackReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PackReader::Plain(r) => r.read(buf),
            PackReader::Gzip(r) => r.read(buf),
        }
    }
}

struct PathAndCount {
    /// Pack path of the first materialized copy.
    path: String,
    remaining: i64,
}

struct Unpacker<'fs> {
    fs: &'fs dyn PosixFileSystem,
    dest: String,
    dry_run: bool,
    force: bool,
    codec: PathDecoder,
    /// Link id to the first materialized path of its group; entries
    /// leave the map once every expected reference has been replayed.
    links: HashMap<u64, PathAndCount>,
    stacks: DirMtimeStacks,
    /// Directories this run materialized ahead of their own record; the
    /// stream is post-ordered, so entries arrive before their parents.
    created_dirs: HashSet<String>,
    buffer: [u8; BUFFER_SIZE],
}

/// Unpacks a packer-produced stream into `destination`, which must exist
/// and be a directory. The input is consumed up to and including the END
/// record; the stream is not closed.
pub fn extract_pack<R: Read>(
    fs: &dyn PosixFileSystem,
    destination: &Path,
    mut input: R,
    options: UnpackOptions,
) -> Result<(), Error> {
    let dest_stat = fs
        .stat(destination)?
        .ok_or_else(|| format_err!("Directory not found: {:?}", destination))?;
    if dest_stat.kind != FileKind::Directory {
        bail!("Not a directory: {:?}", destination);
    }
    let dest = destination
        .to_str()
        .ok_or_else(|| format_err!("destination path is not UTF-8: {:?}", destination))?
        .trim_end_matches('/')
        .to_owned();

    let mut header = [0u8; HEADER.len()];
    input.read_exact(&mut header).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            format_err!("End of file while reading header")
        } else {
            Error::from(err)
        }
    })?;
    if &header != HEADER {
        bail!("ParallelPack header not found");
    }
    let version = input.read_be_u32()?;
    if version != VERSION {
        bail!(
            "Unsupported pack version {}, expecting version {}",
            version,
            VERSION
        );
    }
    let mut reader = if read_bool(&mut input)? {
        PackReader::Gzip(GzDecoder::new(input))
    } else {
        PackReader::Plain(input)
    };

    let verbose = options.verbose.map(VerboseQueue::spawn);

    let mut unpacker = Unpacker {
        fs,
        dest,
        dry_run: options.dry_run,
        force: options.force,
        codec: PathDecoder::new(),
        links: HashMap::new(),
        stacks: DirMtimeStacks::new(),
        created_dirs: HashSet::new(),
        buffer: [0u8; BUFFER_SIZE],
    };

    let result = unpacker.run(&mut reader, verbose.as_ref(), &options.abort);

    // Whatever happened, directories already written keep the mtimes
    // they were meant to have.
    match (result, unpacker.drain_stacks()) {
        (Ok(()), drained) => drained,
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(drain_err)) => {
            log::warn!("while recovering directory mtimes: {:#}", drain_err);
            Err(err)
        }
    }
}

impl<'fs> Unpacker<'fs> {
    fn run(
        &mut self,
        reader: &mut impl Read,
        verbose: Option<&VerboseQueue>,
        abort: &Option<AbortFlag>,
    ) -> Result<(), Error> {
        loop {
            check_abort(abort)?;
            let tag = reader.read_u8()?;
            let record = RecordType::from_u8(tag)
                .ok_or_else(|| format_err!("Unexpected record type: {}", tag))?;
            if record == RecordType::End {
                return Ok(());
            }

            let pack_path = self.codec.read(reader)?;
            if let Some(verbose) = verbose {
                verbose.send(pack_path.clone())?;
            }
            if pack_path.is_empty() {
                bail!("empty pack path on stream");
            }
            if !pack_path.starts_with('/') {
                bail!(
                    "invalid pack path, first character is not '/': {:?}",
                    pack_path
                );
            }
            for component in pack_path[1..].split('/') {
                check_file_name(component)?;
            }

            self.unroll_stacks(&pack_path)?;

            let full = PathBuf::from(format!("{}{}", self.dest, pack_path));
            let existing = self.fs.stat(&full)?;
            // A directory this run created ahead of its own record is
            // not a collision.
            let auto_created =
                record == RecordType::Directory && self.created_dirs.remove(&pack_path);
            if !self.force && existing.is_some() && !auto_created {
                bail!("Exists: {:?}", full);
            }
            if !self.dry_run {
                self.ensure_parents(&pack_path)?;
            }

            match record {
                RecordType::RegularFile => {
                    self.read_regular_file(reader, &pack_path, &full, existing)?
                }
                RecordType::Directory => {
                    self.read_directory(reader, &pack_path, &full, existing)?
                }
                RecordType::Symlink => self.read_symlink(reader, &full, existing)?,
                RecordType::BlockDevice => {
                    self.read_device(reader, &full, existing, FileKind::BlockDevice)?
                }
                RecordType::CharacterDevice => {
                    self.read_device(reader, &full, existing, FileKind::CharacterDevice)?
                }
                RecordType::Fifo => self.read_fifo(reader, &full, existing)?,
                RecordType::End => unreachable!(),
            }
        }
    }

    fn read_regular_file(
        &mut self,
        reader: &mut impl Read,
        pack_path: &str,
        full: &Path,
        existing: Option<Stat>,
    ) -> Result<(), Error> {
        let link_id = reader.read_be_u64()?;
        if link_id != 0 {
            if let Some(entry) = self.links.get_mut(&link_id) {
                // Group already materialized: replay the hard link.
                if !self.dry_run {
                    if existing.is_some() {
                        self.fs.delete_recursive(full)?;
                    }
                    let link_source = PathBuf::from(format!("{}{}", self.dest, entry.path));
                    self.fs.hard_link(&link_source, full)?;
                }
                entry.remaining -= 1;
                if entry.remaining <= 0 {
                    self.links.remove(&link_id);
                }
                return Ok(());
            }
        }

        let uid = reader.read_be_u32()?;
        let gid = reader.read_be_u32()?;
        let mode = reader.read_be_i64()?;
        let mtime_ms = reader.read_be_i64()?;
        let num_links = if link_id != 0 {
            let num_links = reader.read_be_u32()?;
            if num_links < 1 {
                bail!("Invalid link count: {}", num_links);
            }
            Some(num_links)
        } else {
            None
        };

        if self.dry_run {
            skip_file_data(reader, &mut self.buffer)?;
        } else {
            if existing.is_some() {
                self.fs.delete_recursive(full)?;
            }
            let mut file = self.fs.create_file(full, 0o600)?;
            read_file_data(reader, &mut file, &mut self.buffer)?;
            drop(file);
            self.fs.chown(full, uid, gid)?;
            self.fs.set_mode(full, mode as u32 & 0o7777)?;
            let stat = self
                .fs
                .stat(full)?
                .ok_or_else(|| format_err!("file vanished while unpacking: {:?}", full))?;
            self.fs.utime(full, stat.atime_ms, mtime_ms)?;
        }

        if let Some(num_links) = num_links {
            self.links.insert(
                link_id,
                PathAndCount {
                    path: pack_path.to_owned(),
                    remaining: num_links as i64 - 1,
                },
            );
        }
        Ok(())
    }

    fn read_directory(
        &mut self,
        reader: &mut impl Read,
        pack_path: &str,
        full: &Path,
        existing: Option<Stat>,
    ) -> Result<(), Error> {
        let uid = reader.read_be_u32()?;
        let gid = reader.read_be_u32()?;
        let mode = reader.read_be_i64()? as u32 & 0o7777;
        let mtime_ms = reader.read_be_i64()?;
        if !self.dry_run {
            match existing {
                Some(stat) if stat.kind == FileKind::Directory => {
                    // Reconcile only what differs.
                    if stat.uid != uid || stat.gid != gid {
                        self.fs.chown(full, uid, gid)?;
                    }
                    if stat.permissions() != mode {
                        self.fs.set_mode(full, mode)?;
                    }
                }
                Some(_) => {
                    self.fs.delete_recursive(full)?;
                    self.fs.create_directory(full, 0o700)?;
                    self.fs.chown(full, uid, gid)?;
                    self.fs.set_mode(full, mode)?;
                }
                None => {
                    self.fs.create_directory(full, 0o700)?;
                    self.fs.chown(full, uid, gid)?;
                    self.fs.set_mode(full, mode)?;
                }
            }
        }
        self.stacks.push(pack_path, mtime_ms);
        Ok(())
    }

    fn read_symlink(
        &mut self,
        reader: &mut impl Read,
        full: &Path,
        existing: Option<Stat>,
    ) -> Result<(), Error> {
        let uid = reader.read_be_u32()?;
        let gid = reader.read_be_u32()?;
        let target = self.codec.read(reader)?;
        if !self.dry_run {
            if existing.is_some() {
                self.fs.delete_recursive(full)?;
            }
            self.fs.symlink(&target, full)?;
            self.fs.chown(full, uid, gid)?;
        }
        Ok(())
    }

    fn read_device(
        &mut self,
        reader: &mut impl Read,
        full: &Path,
        existing: Option<Stat>,
        kind: FileKind,
    ) -> Result<(), Error> {
        let uid = reader.read_be_u32()?;
        let gid = reader.read_be_u32()?;
        let mode = reader.read_be_i64()?;
        let device = reader.read_be_i64()?;
        if !self.dry_run {
            if existing.is_some() {
                self.fs.delete_recursive(full)?;
            }
            self.fs
                .mknod(full, mode as u32 & 0o7777 | kind.mode_bits(), device as u64)?;
            self.fs.chown(full, uid, gid)?;
        }
        Ok(())
    }

    fn read_fifo(
        &mut self,
        reader: &mut impl Read,
        full: &Path,
        existing: Option<Stat>,
    ) -> Result<(), Error> {
        let uid = reader.read_be_u32()?;
        let gid = reader.read_be_u32()?;
        let mode = reader.read_be_i64()?;
        if !self.dry_run {
            if existing.is_some() {
                self.fs.delete_recursive(full)?;
            }
            self.fs.mkfifo(full, mode as u32 & 0o7777)?;
            self.fs.chown(full, uid, gid)?;
        }
        Ok(())
    }

    /// Creates any missing ancestors of `pack_path`. The stream emits
    /// children first, so a file's directory usually does not exist yet;
    /// the placeholder gets its real owner, mode and mtime when the
    /// directory's own record arrives.
    fn ensure_parents(&mut self, pack_path: &str) -> Result<(), Error> {
        let pos = match pack_path.rfind('/') {
            Some(pos) if pos > 0 => pos,
            _ => return Ok(()),
        };
        let parent = &pack_path[..pos];
        let full = PathBuf::from(format!("{}{}", self.dest, parent));
        match self.fs.stat(&full)? {
            Some(stat) if stat.kind == FileKind::Directory => Ok(()),
            Some(_) if self.force => {
                self.fs.delete_recursive(&full)?;
                self.fs.create_directory(&full, 0o700)?;
                self.created_dirs.insert(parent.to_owned());
                Ok(())
            }
            Some(_) => bail!("Exists: {:?}", full),
            None => {
                self.ensure_parents(parent)?;
                self.fs.create_directory(&full, 0o700)?;
                self.created_dirs.insert(parent.to_owned());
                Ok(())
            }
        }
    }

    fn unroll_stacks(&mut self, pack_path: &str) -> Result<(), Error> {
        let fs = self.fs;
        let dest = &self.dest;
        let dry_run = self.dry_run;
        self.stacks.unroll(pack_path, &mut |prefix, mtime_ms| {
            apply_dir_mtime(fs, dest, dry_run, prefix, mtime_ms)
        })
    }

    fn drain_stacks(&mut self) -> Result<(), Error> {
        let fs = self.fs;
        let dest = &self.dest;
        let dry_run = self.dry_run;
        self.stacks.drain(&mut |prefix, mtime_ms| {
            apply_dir_mtime(fs, dest, dry_run, prefix, mtime_ms)
        })
    }
}

fn apply_dir_mtime(
    fs: &dyn PosixFileSystem,
    dest: &str,
    dry_run: bool,
    prefix: &str,
    mtime_ms: i64,
) -> Result<(), Error> {
    if dry_run {
        return Ok(());
    }
    // The recorded prefix carries a trailing '/'.
    let dir = PathBuf::from(format!("{}{}", dest, &prefix[..prefix.len() - 1]));
    let stat = fs
        .stat(&dir)?
        .ok_or_else(|| format_err!("directory vanished before mtime restore: {:?}", dir))?;
    fs.utime(&dir, stat.atime_ms, mtime_ms)
}
