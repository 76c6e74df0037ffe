//! Deferred restoration of directory modification times.
//!
//! Writing entries inside a directory bumps its mtime, so the recorded
//! value can only be applied once every descendant has been written.
//! Each top-level subtree in the archive keeps its own stack of pending
//! directories in root-to-leaf order; a stack entry is applied as soon
//! as the stream moves past that directory's prefix, and whatever is
//! left is applied when the stream ends - cleanly or not.

use std::collections::HashMap;

use anyhow::Error;

struct PendingDir {
    /// Pack path of the directory including the trailing `/`.
    prefix: String,
    mtime_ms: i64,
}

#[derive(Default)]
pub(crate) struct DirMtimeStacks {
    stacks: HashMap<String, Vec<PendingDir>>,
}

/// First segment of a pack path: up to the second `/`, or the whole
/// string when there is none.
pub(crate) fn subtree_root(pack_path: &str) -> &str {
    match pack_path[1..].find('/') {
        Some(pos) => &pack_path[..pos + 1],
        None => pack_path,
    }
}

impl DirMtimeStacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies and pops every pending directory of `pack_path`'s subtree
    /// that is not an ancestor of `pack_path`.
    pub fn unroll(
        &mut self,
        pack_path: &str,
        apply: &mut dyn FnMut(&str, i64) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if let Some(stack) = self.stacks.get_mut(subtree_root(pack_path)) {
            while let Some(top) = stack.last() {
                if pack_path.starts_with(&top.prefix) {
                    break;
                }
                apply(&top.prefix, top.mtime_ms)?;
                stack.pop();
            }
        }
        Ok(())
    }

    /// Records a directory whose mtime must be restored later.
    pub fn push(&mut self, dir_pack_path: &str, mtime_ms: i64) {
        self.stacks
            .entry(subtree_root(dir_pack_path).to_owned())
            .or_default()
            .push(PendingDir {
                prefix: format!("{}/", dir_pack_path),
                mtime_ms,
            });
    }

    /// Applies everything still pending, leaf-to-root per subtree.
    pub fn drain(
        &mut self,
        apply: &mut dyn FnMut(&str, i64) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for stack in self.stacks.values_mut() {
            while let Some(pending) = stack.pop() {
                apply(&pending.prefix, pending.mtime_ms)?;
            }
        }
        self.stacks.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_root_is_the_first_segment() {
        assert_eq!(subtree_root("/a"), "/a");
        assert_eq!(subtree_root("/a/b"), "/a");
        assert_eq!(subtree_root("/a/b/c"), "/a");
    }

    #[test]
    fn directories_are_applied_when_the_stream_leaves_them() {
        let mut stacks = DirMtimeStacks::new();
        let mut applied = Vec::new();

        stacks.push("/a/d", 2000);
        // Still inside /a/d/: nothing applies.
        stacks
            .unroll("/a/d/y", &mut |p, m| {
                applied.push((p.to_owned(), m));
                Ok(())
            })
            .unwrap();
        assert!(applied.is_empty());

        // A sibling of /a/d pops it.
        stacks
            .unroll("/a/z", &mut |p, m| {
                applied.push((p.to_owned(), m));
                Ok(())
            })
            .unwrap();
        assert_eq!(applied, [("/a/d/".to_owned(), 2000)]);
    }

    #[test]
    fn drain_applies_leaf_to_root() {
        let mut stacks = DirMtimeStacks::new();
        stacks.push("/a", 1);
        stacks.push("/a/d", 2);
        stacks.push("/a/d/e", 3);

        let mut applied = Vec::new();
        stacks
            .drain(&mut |p, m| {
                applied.push((p.to_owned(), m));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            applied,
            [
                ("/a/d/e/".to_owned(), 3),
                ("/a/d/".to_owned(), 2),
                ("/a/".to_owned(), 1),
            ]
        );
    }

    #[test]
    fn subtrees_are_independent() {
        let mut stacks = DirMtimeStacks::new();
        stacks.push("/a/d", 1);
        stacks.push("/b/e", 2);

        let mut applied = Vec::new();
        stacks
            .unroll("/b/f", &mut |p, m| {
                applied.push((p.to_owned(), m));
                Ok(())
            })
            .unwrap();
        // Only the /b subtree unrolls.
        assert_eq!(applied, [("/b/e/".to_owned(), 2)]);
    }
}
