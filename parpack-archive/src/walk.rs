//! Post-order traversal of a source tree, and the path ordering used to
//! merge several traversals into one record stream.

use std::cmp::Ordering;
use std::path::PathBuf;

use anyhow::{bail, Error};
use parpack_fs::{FileKind, PosixFileSystem};

/// Source-relative path ordered so that every string sorts *after* all
/// strings that extend it.
///
/// This is lexicographic byte order with end-of-string treated as the
/// greatest symbol: a directory's entry comes after every entry beneath
/// it, which is what lets the merge across sources stay post-order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TraversalKey(pub String);

impl Ord for TraversalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.0.as_bytes();
        let b = other.0.as_bytes();
        let shared = a.len().min(b.len());
        match a[..shared].cmp(&b[..shared]) {
            // The longer string extends the shorter one and sorts first.
            Ordering::Equal => b.len().cmp(&a.len()),
            ordering => ordering,
        }
    }
}

impl PartialOrd for TraversalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct WalkFrame {
    /// Relative path of this directory; `""` for the source root.
    rel: String,
    /// Child names, sorted descending so `pop` yields ascending order.
    pending: Vec<String>,
}

/// Walks one source root depth-first, yielding source-relative paths
/// (each starting with `/`, the root itself as `""`) with every
/// directory emitted after its contents.
pub(crate) struct PostOrderWalk<'fs> {
    fs: &'fs dyn PosixFileSystem,
    /// Canonical source root as a string; relative paths append to it.
    pub root: String,
    /// Archive prefix for this source (the root's last path component).
    pub pack_prefix: String,
    /// Path slot dealt to this source.
    pub slot: u8,
    stack: Vec<WalkFrame>,
    done: bool,
}

impl<'fs> PostOrderWalk<'fs> {
    pub fn new(
        fs: &'fs dyn PosixFileSystem,
        root: String,
        pack_prefix: String,
        slot: u8,
    ) -> Result<Self, Error> {
        let mut walk = PostOrderWalk {
            fs,
            root,
            pack_prefix,
            slot,
            stack: Vec::new(),
            done: false,
        };
        let frame = walk.read_frame(String::new())?;
        walk.stack.push(frame);
        Ok(walk)
    }

    fn read_frame(&self, rel: String) -> Result<WalkFrame, Error> {
        let dir = PathBuf::from(format!("{}{}", self.root, rel));
        let mut pending = Vec::new();
        for entry in self.fs.list(&dir)? {
            let entry = entry?;
            let name = match entry.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_owned(),
                None => bail!("file name is not UTF-8: {:?}", entry),
            };
            pending.push(name);
        }
        pending.sort_unstable_by(|a, b| b.cmp(a));
        Ok(WalkFrame { rel, pending })
    }

    /// Advances to the next entry; `None` when the source is exhausted.
    pub fn next(&mut self) -> Result<Option<String>, Error> {
        if self.done {
            return Ok(None);
        }
        loop {
            let frame = match self.stack.last_mut() {
                Some(frame) => frame,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            match frame.pending.pop() {
                Some(name) => {
                    let rel = format!("{}/{}", frame.rel, name);
                    let full = PathBuf::from(format!("{}{}", self.root, rel));
                    let stat = match self.fs.stat(&full)? {
                        Some(stat) => stat,
                        // The tree is assumed quiescent, but a vanished
                        // entry only costs us its record.
                        None => {
                            log::warn!("skipping vanished entry {:?}", full);
                            continue;
                        }
                    };
                    if stat.kind == FileKind::Directory {
                        let child = self.read_frame(rel)?;
                        self.stack.push(child);
                        continue;
                    }
                    return Ok(Some(rel));
                }
                None => {
                    let rel = frame.rel.clone();
                    self.stack.pop();
                    return Ok(Some(rel));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parpack_fs::DefaultPosixFileSystem;

    fn key(s: &str) -> TraversalKey {
        TraversalKey(s.to_owned())
    }

    #[test]
    fn extensions_sort_before_their_prefix() {
        assert!(key("/a/x") < key("/a"));
        assert!(key("/a/d/y") < key("/a/d"));
        assert!(key("/a") < key(""));
        assert!(key("/ab") < key("/a"));
    }

    #[test]
    fn unrelated_paths_keep_lexicographic_order() {
        assert!(key("/a") < key("/b"));
        assert!(key("/a/x") < key("/ab"));
        assert!(key("/a/x") < key("/a/y"));
        assert_eq!(key("/a").cmp(&key("/a")), Ordering::Equal);
    }

    #[test]
    fn walk_emits_directories_after_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("d")).unwrap();
        std::fs::write(root.join("d/y"), b"y").unwrap();
        std::fs::write(root.join("x"), b"x").unwrap();

        let fs = DefaultPosixFileSystem;
        let mut walk = PostOrderWalk::new(
            &fs,
            root.to_str().unwrap().to_owned(),
            "/r".to_owned(),
            0,
        )
        .unwrap();

        let mut order = Vec::new();
        while let Some(rel) = walk.next().unwrap() {
            order.push(rel);
        }
        assert_eq!(order, ["/d/y", "/d", "/x", ""]);
    }
}
