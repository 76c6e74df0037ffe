//! End-to-end pack/unpack round trips against real scratch directories.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use parpack_archive::{create_pack, extract_pack, PackOptions, UnpackOptions};
use parpack_fs::{DefaultPosixFileSystem, FileKind, PosixFileSystem};

fn pack_to_vec(sources: &[PathBuf], compress: bool) -> Vec<u8> {
    let fs = DefaultPosixFileSystem;
    let mut out = Vec::new();
    create_pack(
        &fs,
        sources,
        &mut out,
        PackOptions {
            compress,
            ..Default::default()
        },
    )
    .unwrap();
    out
}

fn unpack_into(bytes: &[u8], dest: &Path, force: bool) {
    let fs = DefaultPosixFileSystem;
    extract_pack(
        &fs,
        dest,
        Cursor::new(bytes),
        UnpackOptions {
            force,
            ..Default::default()
        },
    )
    .unwrap();
}

/// `a/x` (644, "hi", mtime 1000), `a/d` (755, mtime 2000), `a/d/y` hard
/// linked to `a/x`, a symlink with an awkward target, and a FIFO.
fn build_sample_tree(parent: &Path) -> PathBuf {
    let fs = DefaultPosixFileSystem;
    let src = parent.join("a");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("x"), b"hi").unwrap();
    fs.set_mode(&src.join("x"), 0o644).unwrap();
    std::fs::create_dir(src.join("d")).unwrap();
    fs.set_mode(&src.join("d"), 0o755).unwrap();
    std::fs::hard_link(src.join("x"), src.join("d/y")).unwrap();
    std::os::unix::fs::symlink("x häs spaces", src.join("ln")).unwrap();
    fs.mkfifo(&src.join("fifo"), 0o640).unwrap();
    fs.set_mode(&src.join("fifo"), 0o640).unwrap();
    // Directory mtimes last: creating entries above bumped them.
    fs.utime(&src.join("x"), 500, 1000).unwrap();
    fs.utime(&src.join("d"), 500, 2000).unwrap();
    fs.utime(&src, 500, 3000).unwrap();
    src
}

#[test]
fn round_trip_preserves_tree_metadata_and_hard_links() {
    let fs = DefaultPosixFileSystem;
    let tmp = tempfile::tempdir().unwrap();
    let src = build_sample_tree(tmp.path());

    let bytes = pack_to_vec(&[src], false);
    let dest = tmp.path().join("out");
    std::fs::create_dir(&dest).unwrap();
    unpack_into(&bytes, &dest, false);

    let root = dest.join("a");
    let x = fs.stat(&root.join("x")).unwrap().unwrap();
    assert_eq!(x.kind, FileKind::Regular);
    assert_eq!(x.permissions(), 0o644);
    assert_eq!(x.mtime_ms, 1000);
    assert_eq!(std::fs::read(root.join("x")).unwrap(), b"hi");

    // The hard link group shares one inode and has the original size.
    let y = fs.stat(&root.join("d/y")).unwrap().unwrap();
    assert_eq!(y.ino, x.ino);
    assert_eq!(x.nlink, 2);

    // Directory mtimes survive the writes made inside them.
    let d = fs.stat(&root.join("d")).unwrap().unwrap();
    assert_eq!(d.permissions(), 0o755);
    assert_eq!(d.mtime_ms, 2000);
    let a = fs.stat(&root).unwrap().unwrap();
    assert_eq!(a.mtime_ms, 3000);

    let ln = fs.stat(&root.join("ln")).unwrap().unwrap();
    assert_eq!(ln.kind, FileKind::Symlink);
    assert_eq!(fs.read_link(&root.join("ln")).unwrap(), "x häs spaces");

    let source_fifo = fs.stat(&tmp.path().join("a/fifo")).unwrap().unwrap();
    let fifo = fs.stat(&root.join("fifo")).unwrap().unwrap();
    assert_eq!(fifo.kind, FileKind::Fifo);
    assert_eq!(fifo.permissions(), source_fifo.permissions());
}

#[test]
fn compressed_round_trip() {
    let fs = DefaultPosixFileSystem;
    let tmp = tempfile::tempdir().unwrap();
    let src = build_sample_tree(tmp.path());

    let bytes = pack_to_vec(&[src], true);
    // Header and compression flag stay uncompressed.
    assert_eq!(&bytes[..12], b"ParallelPack");
    assert_eq!(bytes[16], 1);

    let dest = tmp.path().join("out");
    std::fs::create_dir(&dest).unwrap();
    unpack_into(&bytes, &dest, false);
    assert_eq!(std::fs::read(dest.join("a/x")).unwrap(), b"hi");
    assert_eq!(
        fs.stat(&dest.join("a/d")).unwrap().unwrap().mtime_ms,
        2000
    );
}

#[test]
fn boundary_file_sizes_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("sizes");
    std::fs::create_dir(&src).unwrap();
    let sizes = [0usize, 4096, 8192, 32767, 32768];
    for (index, size) in sizes.iter().enumerate() {
        let content: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
        std::fs::write(src.join(format!("f{}", index)), content).unwrap();
    }

    let bytes = pack_to_vec(&[src], false);
    let dest = tmp.path().join("out");
    std::fs::create_dir(&dest).unwrap();
    unpack_into(&bytes, &dest, false);

    for (index, size) in sizes.iter().enumerate() {
        let expected: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            std::fs::read(dest.join(format!("sizes/f{}", index))).unwrap(),
            expected,
            "file of {} bytes",
            size
        );
    }
}

#[test]
fn unpacking_twice_without_force_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let src = build_sample_tree(tmp.path());
    let bytes = pack_to_vec(&[src], false);
    let dest = tmp.path().join("out");
    std::fs::create_dir(&dest).unwrap();
    unpack_into(&bytes, &dest, false);

    let fs = DefaultPosixFileSystem;
    let err = extract_pack(
        &fs,
        &dest,
        Cursor::new(&bytes),
        UnpackOptions::default(),
    )
    .unwrap_err();
    assert!(err.to_string().starts_with("Exists:"), "{}", err);
}

#[test]
fn force_unpack_over_identical_tree_is_idempotent() {
    let fs = DefaultPosixFileSystem;
    let tmp = tempfile::tempdir().unwrap();
    let src = build_sample_tree(tmp.path());
    let bytes = pack_to_vec(&[src], false);
    let dest = tmp.path().join("out");
    std::fs::create_dir(&dest).unwrap();
    unpack_into(&bytes, &dest, false);
    unpack_into(&bytes, &dest, true);

    let root = dest.join("a");
    assert_eq!(std::fs::read(root.join("x")).unwrap(), b"hi");
    let x = fs.stat(&root.join("x")).unwrap().unwrap();
    let y = fs.stat(&root.join("d/y")).unwrap().unwrap();
    assert_eq!(x.ino, y.ino);
    assert_eq!(x.nlink, 2);
    assert_eq!(fs.stat(&root.join("d")).unwrap().unwrap().mtime_ms, 2000);
    assert_eq!(fs.stat(&root).unwrap().unwrap().mtime_ms, 3000);
}

#[test]
fn dry_run_consumes_the_stream_and_writes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let src = build_sample_tree(tmp.path());
    let bytes = pack_to_vec(&[src], false);

    let dest = tmp.path().join("out");
    std::fs::create_dir(&dest).unwrap();
    let fs = DefaultPosixFileSystem;
    let mut cursor = Cursor::new(&bytes);
    extract_pack(
        &fs,
        &dest,
        &mut cursor,
        UnpackOptions {
            dry_run: true,
            ..Default::default()
        },
    )
    .unwrap();

    // Everything was read, including END, and nothing was created.
    assert_eq!(cursor.position() as usize, bytes.len());
    assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
}

#[test]
fn multiple_sources_merge_into_one_stream() {
    let fs = DefaultPosixFileSystem;
    let tmp = tempfile::tempdir().unwrap();
    let one = tmp.path().join("one");
    let two = tmp.path().join("two");
    std::fs::create_dir(&one).unwrap();
    std::fs::create_dir(&two).unwrap();
    std::fs::write(one.join("f"), b"first").unwrap();
    std::fs::write(two.join("g"), b"second").unwrap();

    let bytes = pack_to_vec(&[one, two], false);
    let dest = tmp.path().join("out");
    std::fs::create_dir(&dest).unwrap();
    unpack_into(&bytes, &dest, false);

    assert_eq!(std::fs::read(dest.join("one/f")).unwrap(), b"first");
    assert_eq!(std::fs::read(dest.join("two/g")).unwrap(), b"second");
    assert_eq!(
        fs.stat(&dest.join("one")).unwrap().unwrap().kind,
        FileKind::Directory
    );
}

mod stream_scan {
    //! A minimal reader for the uncompressed stream framing, used to
    //! check record-level properties without going through the
    //! unpacker.

    use std::io::{Cursor, Read};

    pub fn record_paths(bytes: &[u8]) -> Vec<String> {
        let mut cursor = Cursor::new(bytes);
        let mut header = [0u8; 12];
        cursor.read_exact(&mut header).unwrap();
        assert_eq!(&header, b"ParallelPack");
        let mut version = [0u8; 4];
        cursor.read_exact(&mut version).unwrap();
        let mut flag = [0u8; 1];
        cursor.read_exact(&mut flag).unwrap();
        assert_eq!(flag[0], 0, "scanner only reads uncompressed streams");

        let mut slots: Vec<Vec<u8>> = vec![Vec::new(); 64];
        let mut paths = Vec::new();
        loop {
            let tag = read_u8(&mut cursor);
            if tag == 6 {
                break;
            }
            paths.push(read_path(&mut cursor, &mut slots));
            match tag {
                0 => {
                    let mut link_id = [0u8; 8];
                    cursor.read_exact(&mut link_id).unwrap();
                    if u64::from_be_bytes(link_id) != 0 {
                        panic!("scanner does not handle hard links");
                    }
                    skip(&mut cursor, 24);
                    loop {
                        let count = read_i16(&mut cursor);
                        if count == -1 {
                            break;
                        }
                        skip(&mut cursor, count as usize);
                    }
                }
                1 => skip(&mut cursor, 24),
                other => panic!("unexpected record tag {}", other),
            }
        }
        paths
    }

    fn read_u8(cursor: &mut Cursor<&[u8]>) -> u8 {
        let mut buf = [0u8; 1];
        cursor.read_exact(&mut buf).unwrap();
        buf[0]
    }

    fn read_i16(cursor: &mut Cursor<&[u8]>) -> i16 {
        let mut buf = [0u8; 2];
        cursor.read_exact(&mut buf).unwrap();
        i16::from_be_bytes(buf)
    }

    fn skip(cursor: &mut Cursor<&[u8]>, len: usize) {
        let mut sink = vec![0u8; len];
        cursor.read_exact(&mut sink).unwrap();
    }

    fn read_path(cursor: &mut Cursor<&[u8]>, slots: &mut [Vec<u8>]) -> String {
        let slot = read_u8(cursor) as usize;
        let shared = read_u8(cursor) as usize;
        let mut len = [0u8; 2];
        cursor.read_exact(&mut len).unwrap();
        let suffix_len = u16::from_be_bytes(len) as usize;
        let mut bytes = slots[slot][..shared].to_vec();
        let start = bytes.len();
        bytes.resize(start + suffix_len, 0);
        cursor.read_exact(&mut bytes[start..]).unwrap();
        slots[slot] = bytes.clone();
        String::from_utf8(bytes).unwrap()
    }
}

#[test]
fn archive_orders_contents_before_their_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("a");
    std::fs::create_dir(&src).unwrap();
    std::fs::create_dir(src.join("d")).unwrap();
    std::fs::write(src.join("d/y"), b"y").unwrap();
    std::fs::write(src.join("x"), b"x").unwrap();

    let bytes = pack_to_vec(&[src.clone()], false);
    let paths = stream_scan::record_paths(&bytes);
    assert_eq!(paths, ["/a/d/y", "/a/d", "/a/x", "/a"]);
}

mod stream_build {
    pub fn path(stream: &mut Vec<u8>, slot: u8, value: &str) {
        stream.push(slot);
        stream.push(0);
        stream.extend_from_slice(&(value.len() as u16).to_be_bytes());
        stream.extend_from_slice(value.as_bytes());
    }

    pub fn header(stream: &mut Vec<u8>) {
        stream.extend_from_slice(b"ParallelPack");
        stream.extend_from_slice(&3u32.to_be_bytes());
        stream.push(0);
    }
}

#[test]
fn hand_built_stream_with_devices_dry_runs_cleanly() {
    let mut stream = Vec::new();
    stream_build::header(&mut stream);

    // Block device /t/blk.
    stream.push(3);
    stream_build::path(&mut stream, 0, "/t/blk");
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.extend_from_slice(&0o660i64.to_be_bytes());
    stream.extend_from_slice(&0x0801i64.to_be_bytes());

    // Character device /t/chr.
    stream.push(4);
    stream_build::path(&mut stream, 0, "/t/chr");
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.extend_from_slice(&0o600i64.to_be_bytes());
    stream.extend_from_slice(&0x0103i64.to_be_bytes());

    // Regular file /t/f carrying one maximum-size data chunk.
    stream.push(0);
    stream_build::path(&mut stream, 0, "/t/f");
    stream.extend_from_slice(&0u64.to_be_bytes());
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.extend_from_slice(&0o644i64.to_be_bytes());
    stream.extend_from_slice(&1234i64.to_be_bytes());
    stream.extend_from_slice(&i16::MAX.to_be_bytes());
    stream.extend_from_slice(&vec![0xabu8; i16::MAX as usize]);
    stream.extend_from_slice(&(-1i16).to_be_bytes());

    // Directory record arrives after its contents.
    stream.push(1);
    stream_build::path(&mut stream, 0, "/t");
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.extend_from_slice(&0o755i64.to_be_bytes());
    stream.extend_from_slice(&1000i64.to_be_bytes());

    stream.push(6);

    let tmp = tempfile::tempdir().unwrap();
    let fs = DefaultPosixFileSystem;
    let mut cursor = Cursor::new(&stream);
    extract_pack(
        &fs,
        tmp.path(),
        &mut cursor,
        UnpackOptions {
            dry_run: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(cursor.position() as usize, stream.len());
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn path_traversal_components_are_rejected() {
    let mut stream = Vec::new();
    stream_build::header(&mut stream);
    stream.push(0);
    stream_build::path(&mut stream, 0, "/t/../escape");

    let tmp = tempfile::tempdir().unwrap();
    let fs = DefaultPosixFileSystem;
    let err = extract_pack(
        &fs,
        tmp.path(),
        Cursor::new(&stream),
        UnpackOptions::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains(".."), "{}", err);
}

#[test]
fn verbose_channel_reports_every_entry() {
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let src = build_sample_tree(tmp.path());

    let sink = SharedBuf(Arc::new(Mutex::new(Vec::new())));
    let fs = DefaultPosixFileSystem;
    let mut out = Vec::new();
    create_pack(
        &fs,
        &[src],
        &mut out,
        PackOptions {
            verbose: Some(Box::new(sink.clone())),
            ..Default::default()
        },
    )
    .unwrap();

    let printed = sink.0.lock().unwrap();
    let lines: Vec<&str> = std::str::from_utf8(&printed)
        .unwrap()
        .lines()
        .collect();
    // x, d/y, d, ln, fifo and the root: six entries.
    assert_eq!(lines.len(), 6);
    assert!(lines.contains(&"/a/d/y"));
    assert!(lines.contains(&"/a"));
}
