//! Content-addressed dedup chunk index.
//!
//! Backup trees may share a central index of data chunks for all
//! non-empty regular files. Each chunk is reused via hard links to
//! achieve space savings, and optionally stored gzip-compressed for
//! more.
//!
//! The index is a single-layer directory hash keyed by the first four
//! hex characters of the content's MD5. Chunk files are named
//!
//! `<remaining_hash>-<uncompressed_length>-<collision#>-<link#>[.gz][.corrupt]`
//!
//! The uncompressed length is part of the name so that candidates with a
//! different size are excluded without a `stat` or a decompression. The
//! `collision#` separates distinct contents that happen to share an MD5:
//! matches are never made on the hash alone, the bytes are compared.
//! The `link#` separates physical copies of one content kept to stay
//! under the file system's per-inode hard link limit.
//!
//! Once [`DUPLICATE_LINK_COUNT`] references point at a chunk, a second
//! copy is stored and new references spread across both; a third copy
//! only appears when both are full. When a duplicated group drains below
//! [`COALESCE_LINK_COUNT`] references, new ones all go to copy 0 so the
//! extras can fall out as orphans.
//!
//! Both ordinals stay dense: deletions shift the higher-numbered
//! siblings down, and lookups repair gaps left by unclean shutdowns.
//!
//! Orphaned chunk files (link count one, nothing referencing them)
//! appear after unclean shutdowns or manual pruning of consumer trees;
//! [`DedupDataIndex::verify`] removes them, and its slow mode re-checks
//! each chunk's bytes against its name about once a week, flagging
//! mismatches with a `.corrupt` suffix. Corrupt chunks receive no new
//! references.
//!
//! Losing the whole index is survivable: consumers recreate chunks
//! lazily from the hard-linked instances in their own trees.
//!
//! Operations lock per hash directory - in-process with a mutex, across
//! processes with an advisory lock on the directory's `lock` sentinel -
//! so up to 2^16 hash directories proceed independently. All locks are
//! exclusive.

mod chunk_name;
mod index;
mod lock;
mod verify;

pub use chunk_name::ChunkName;
pub use index::{
    DedupDataIndex, COALESCE_LINK_COUNT, DIRECTORY_HASH_BITS, DUPLICATE_LINK_COUNT,
    FILE_SYSTEM_BLOCK_SIZE, FILE_SYSTEM_MAX_LINK_COUNT, HASH_DIRECTORY_COUNT,
    VERIFICATION_INTERVAL_MS,
};
pub use verify::VerifyStats;
