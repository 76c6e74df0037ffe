//! The wire protocol values shared between the packer and the unpacker.

/// The header (magic value).
pub const HEADER: &[u8; 12] = b"ParallelPack";

/// The protocol version supported.
///
/// 1 - original version
/// 2 - added the single byte completion response over TCP, so the packer
///     does not mistake a clean socket close for a truncated stream
/// 3 - added the compression option
pub const VERSION: u32 = 3;

/// Chunk size used when streaming file contents.
pub const BUFFER_SIZE: usize = 4096;

/// Default TCP port for direct packer/unpacker connections.
pub const DEFAULT_PORT: u16 = 10000;

/// Number of reusable prefix-sharing slots for path strings. Slots
/// `0..=62` are dealt to source iterators; slot 63 carries symlink
/// targets.
pub const PATH_SLOT_COUNT: usize = 64;

/// Slot reserved for symlink targets.
pub const SYMLINK_TARGET_SLOT: u8 = 63;

/// Record tags used on the main loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    RegularFile = 0,
    Directory = 1,
    Symlink = 2,
    BlockDevice = 3,
    CharacterDevice = 4,
    Fifo = 5,
    End = 6,
}

impl RecordType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => RecordType::RegularFile,
            1 => RecordType::Directory,
            2 => RecordType::Symlink,
            3 => RecordType::BlockDevice,
            4 => RecordType::CharacterDevice,
            5 => RecordType::Fifo,
            6 => RecordType::End,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for tag in 0..=6u8 {
            assert_eq!(RecordType::from_u8(tag).unwrap() as u8, tag);
        }
        assert!(RecordType::from_u8(7).is_none());
    }
}
