//! Streaming transport for POSIX directory trees.
//!
//! Backup trees full of hard links make `tar` and `rsync` hold the whole
//! link graph in memory; this transport instead assigns small link ids on
//! the fly and streams a tagged record per node, so memory stays bounded
//! by the number of in-flight link groups. The packer walks any number of
//! source trees in one merged post-order pass and the unpacker replays
//! the records, deferring directory mtimes until each subtree is
//! complete.
//!
//! The stream assumes a quiescent source tree; packing a tree that is
//! being modified has undefined results.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;

mod create;
mod dir_stack;
mod extract;
pub mod protocol;
mod verbose;
mod walk;
mod wire;

pub use create::{create_pack, PackOptions};
pub use extract::{extract_pack, UnpackOptions};

/// Cooperative cancellation token checked at the top of each stream
/// loop iteration.
pub type AbortFlag = Arc<AtomicBool>;

pub(crate) fn check_abort(abort: &Option<AbortFlag>) -> Result<(), Error> {
    if let Some(abort) = abort {
        if abort.load(Ordering::Relaxed) {
            return Err(Error::from(io::Error::new(
                io::ErrorKind::Interrupted,
                "operation aborted",
            )));
        }
    }
    Ok(())
}
