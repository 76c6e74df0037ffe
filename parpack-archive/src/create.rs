//! Packing one or more directory trees into the record stream.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use flate2::write::GzEncoder;
use flate2::Compression;

use parpack_fs::{FileKind, PosixFileSystem, Stat};

use crate::protocol::{RecordType, BUFFER_SIZE, HEADER, SYMLINK_TARGET_SLOT, VERSION};
use crate::verbose::VerboseQueue;
use crate::walk::{PostOrderWalk, TraversalKey};
use crate::wire::{write_file_data, PathEncoder, WriteExt};
use crate::{check_abort, AbortFlag};

/// Options for [`create_pack`].
#[derive(Default)]
pub struct PackOptions {
    /// Frame everything after the header through gzip.
    pub compress: bool,
    /// Sink for one line per packed entry (the archive-relative path).
    pub verbose: Option<Box<dyn Write + Send>>,
    /// Cooperative cancellation; checked once per record.
    pub abort: Option<AbortFlag>,
}

enum PackWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> Write for PackWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PackWriter::Plain(w) => w.write(buf),
            PackWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PackWriter::Plain(w) => w.flush(),
            PackWriter::Gzip(w) => w.flush(),
        }
    }
}

impl<W: Write> PackWriter<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            PackWriter::Plain(w) => Ok(w),
            PackWriter::Gzip(w) => w.finish(),
        }
    }
}

struct LinkAndCount {
    link_id: u64,
    remaining: u64,
}

struct Packer<'fs> {
    fs: &'fs dyn PosixFileSystem,
    codec: PathEncoder,
    /// `(device, inode)` of every multi-link file already emitted, with
    /// the number of references still expected. Entries leave the map at
    /// zero, bounding memory to the in-flight link groups.
    links: HashMap<(u64, u64), LinkAndCount>,
    /// Link id 0 is reserved for "no hard link".
    next_link_id: u64,
    buffer: [u8; BUFFER_SIZE],
}

/// Packs `sources` into `out`. The stream is flushed before returning.
///
/// Every source must exist and be a directory. The sources are walked in
/// one merged, post-ordered pass; see [`TraversalKey`] for the ordering
/// that makes the merge line up.
pub fn create_pack<W: Write>(
    fs: &dyn PosixFileSystem,
    sources: &[PathBuf],
    mut out: W,
    options: PackOptions,
) -> Result<(), Error> {
    if sources.is_empty() {
        bail!("no source directories given");
    }

    let mut next_files: BTreeMap<TraversalKey, Vec<PostOrderWalk>> = BTreeMap::new();
    let mut next_slot: u8 = 0;
    for source in sources {
        let stat = fs
            .stat(source)?
            .ok_or_else(|| format_err!("Directory not found: {:?}", source))?;
        if stat.kind != FileKind::Directory {
            bail!("Not a directory: {:?}", source);
        }
        let canonical = std::fs::canonicalize(source)
            .with_context(|| format!("unable to resolve {:?}", source))?;
        let canonical = canonical
            .to_str()
            .ok_or_else(|| format_err!("source path is not UTF-8: {:?}", canonical))?
            .to_owned();
        let pack_prefix = match canonical.rfind('/') {
            Some(pos) => canonical[pos..].to_owned(),
            None => canonical.clone(),
        };
        let mut walk = PostOrderWalk::new(fs, canonical, pack_prefix, next_slot)?;
        next_slot = if next_slot >= 62 { 0 } else { next_slot + 1 };
        if let Some(rel) = walk.next()? {
            next_files.entry(TraversalKey(rel)).or_default().push(walk);
        }
    }

    let verbose = options.verbose.map(VerboseQueue::spawn);

    out.write_all(HEADER)?;
    out.write_be_u32(VERSION)?;
    out.write_bool(options.compress)?;
    let mut writer = if options.compress {
        PackWriter::Gzip(GzEncoder::new(out, Compression::default()))
    } else {
        PackWriter::Plain(out)
    };

    let mut packer = Packer {
        fs,
        codec: PathEncoder::new(),
        links: HashMap::new(),
        next_link_id: 1,
        buffer: [0u8; BUFFER_SIZE],
    };

    while let Some((key, walkers)) = next_files.pop_first() {
        check_abort(&options.abort)?;
        for mut walk in walkers {
            let pack_path = format!("{}{}", walk.pack_prefix, key.0);
            if let Some(verbose) = &verbose {
                verbose.send(pack_path.clone())?;
            }
            let full = PathBuf::from(format!("{}{}", walk.root, key.0));
            packer.write_entry(&mut writer, &full, &pack_path, walk.slot)?;
            if let Some(rel) = walk.next()? {
                next_files.entry(TraversalKey(rel)).or_default().push(walk);
            }
        }
    }

    writer.write_u8(RecordType::End as u8)?;
    let mut out = writer.finish()?;
    out.flush()?;
    Ok(())
}

impl<'fs> Packer<'fs> {
    fn write_entry(
        &mut self,
        writer: &mut impl Write,
        full: &Path,
        pack_path: &str,
        slot: u8,
    ) -> Result<(), Error> {
        let stat = match self.fs.stat(full)? {
            Some(stat) => stat,
            None => {
                log::warn!("skipping vanished entry {:?}", full);
                return Ok(());
            }
        };
        match stat.kind {
            FileKind::Regular => self.write_regular_file(writer, full, pack_path, slot, &stat),
            FileKind::Directory => {
                writer.write_u8(RecordType::Directory as u8)?;
                self.codec.write(writer, slot, pack_path)?;
                self.write_metadata(writer, &stat)
            }
            FileKind::Symlink => {
                writer.write_u8(RecordType::Symlink as u8)?;
                self.codec.write(writer, slot, pack_path)?;
                writer.write_be_u32(stat.uid)?;
                writer.write_be_u32(stat.gid)?;
                let target = self.fs.read_link(full)?;
                self.codec.write(writer, SYMLINK_TARGET_SLOT, &target)
            }
            FileKind::BlockDevice | FileKind::CharacterDevice => {
                let tag = if stat.kind == FileKind::BlockDevice {
                    RecordType::BlockDevice
                } else {
                    RecordType::CharacterDevice
                };
                writer.write_u8(tag as u8)?;
                self.codec.write(writer, slot, pack_path)?;
                writer.write_be_u32(stat.uid)?;
                writer.write_be_u32(stat.gid)?;
                writer.write_be_i64(stat.mode as i64)?;
                writer.write_be_i64(stat.rdev as i64)?;
                Ok(())
            }
            FileKind::Fifo => {
                writer.write_u8(RecordType::Fifo as u8)?;
                self.codec.write(writer, slot, pack_path)?;
                writer.write_be_u32(stat.uid)?;
                writer.write_be_u32(stat.gid)?;
                writer.write_be_i64(stat.mode as i64)?;
                Ok(())
            }
            FileKind::Socket => bail!("Unable to pack socket: {:?}", full),
        }
    }

    fn write_regular_file(
        &mut self,
        writer: &mut impl Write,
        full: &Path,
        pack_path: &str,
        slot: u8,
        stat: &Stat,
    ) -> Result<(), Error> {
        writer.write_u8(RecordType::RegularFile as u8)?;
        self.codec.write(writer, slot, pack_path)?;
        if stat.nlink == 1 {
            writer.write_be_u64(0)?;
            self.write_metadata(writer, stat)?;
            self.write_contents(writer, full)
        } else if stat.nlink > 1 {
            let key = (stat.dev, stat.ino);
            if let Some(entry) = self.links.get_mut(&key) {
                // Already sent: the link id alone stands in for the file.
                writer.write_be_u64(entry.link_id)?;
                entry.remaining -= 1;
                if entry.remaining == 0 {
                    self.links.remove(&key);
                }
                Ok(())
            } else {
                let link_id = self.next_link_id;
                self.next_link_id += 1;
                writer.write_be_u64(link_id)?;
                self.write_metadata(writer, stat)?;
                writer.write_be_u32(stat.nlink as u32)?;
                self.write_contents(writer, full)?;
                self.links.insert(
                    key,
                    LinkAndCount {
                        link_id,
                        remaining: stat.nlink - 1,
                    },
                );
                Ok(())
            }
        } else {
            bail!("Invalid link count: {}", stat.nlink);
        }
    }

    fn write_metadata(&mut self, writer: &mut impl Write, stat: &Stat) -> Result<(), Error> {
        writer.write_be_u32(stat.uid)?;
        writer.write_be_u32(stat.gid)?;
        writer.write_be_i64(stat.mode as i64)?;
        writer.write_be_i64(stat.mtime_ms)?;
        Ok(())
    }

    fn write_contents(&mut self, writer: &mut impl Write, full: &Path) -> Result<(), Error> {
        let mut file = self.fs.open(full)?;
        write_file_data(&mut file, writer, &mut self.buffer)?;
        Ok(())
    }
}
