//! The chunk filename grammar.
//!
//! `<rem28>-<length>-<collision>-<link>[.gz][.corrupt]`, stored under a
//! directory named by the first four hex characters of the content MD5.
//! Everything about a chunk's identity lives in its name: the remaining
//! 112 bits of the MD5, the uncompressed length, the ordinal separating
//! distinct contents that share an MD5, and the ordinal separating the
//! physical copies kept to stay under the per-inode hard link limit.

use std::fmt;

pub(crate) const GZIP_SUFFIX: &str = ".gz";
pub(crate) const CORRUPT_SUFFIX: &str = ".corrupt";

/// Parsed form of a chunk file name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkName {
    /// The last 112 bits of the content MD5 (the first 16 name the hash
    /// directory).
    pub rem: [u8; 14],
    /// Uncompressed content length; never zero.
    pub len: u64,
    /// Ordinal separating distinct contents sharing an MD5. Dense from 0.
    pub collision: u32,
    /// Ordinal separating physical copies of one content. Dense from 0.
    pub link: u32,
    /// Stored gzip-compressed.
    pub gzipped: bool,
    /// Flagged by the verifier; receives no new references.
    pub corrupt: bool,
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:x}-{:x}",
            hex::encode(self.rem),
            format_length(self.len),
            self.collision,
            self.link
        )?;
        if self.gzipped {
            f.write_str(GZIP_SUFFIX)?;
        }
        if self.corrupt {
            f.write_str(CORRUPT_SUFFIX)?;
        }
        Ok(())
    }
}

impl ChunkName {
    /// Parses a file name; `None` when it does not match the grammar
    /// exactly (the rendering of the parse must be the input).
    pub fn parse(name: &str) -> Option<ChunkName> {
        let (rest, corrupt) = match name.strip_suffix(CORRUPT_SUFFIX) {
            Some(rest) => (rest, true),
            None => (name, false),
        };
        let (rest, gzipped) = match rest.strip_suffix(GZIP_SUFFIX) {
            Some(rest) => (rest, true),
            None => (rest, false),
        };
        let mut parts = rest.split('-');
        let rem_hex = parts.next()?;
        let len_part = parts.next()?;
        let collision_part = parts.next()?;
        let link_part = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if rem_hex.len() != 28 || !is_lower_hex(rem_hex) {
            return None;
        }
        let mut rem = [0u8; 14];
        hex::decode_to_slice(rem_hex, &mut rem).ok()?;
        Some(ChunkName {
            rem,
            len: parse_length(len_part)?,
            collision: parse_hex(collision_part)? as u32,
            link: parse_hex(link_part)? as u32,
            gzipped,
            corrupt,
        })
    }
}

/// Directory name for a content digest: the first 16 bits as 4 lowercase
/// hex characters.
pub(crate) fn hash_dir_name(digest: &[u8; 16]) -> String {
    hex::encode(&digest[..2])
}

/// Parses a hash directory name back into its 16-bit value.
pub(crate) fn parse_hash_dir(name: &str) -> Option<u16> {
    if name.len() != 4 || !is_lower_hex(name) {
        return None;
    }
    u16::from_str_radix(name, 16).ok()
}

/// Renders an uncompressed length: `<n>M` for multiples of 0x100000,
/// `<n>k` for multiples of 0x400, plain hex otherwise. All lowercase, no
/// leading zeros.
pub(crate) fn format_length(len: u64) -> String {
    if len & 0xfffff == 0 {
        format!("{:x}M", len >> 20)
    } else if len & 0x3ff == 0 {
        format!("{:x}k", len >> 10)
    } else {
        format!("{:x}", len)
    }
}

/// Parses a length rendered by [`format_length`]; rejects zero and any
/// non-canonical spelling.
pub(crate) fn parse_length(text: &str) -> Option<u64> {
    let len = if let Some(mebi) = text.strip_suffix('M') {
        parse_hex(mebi)?.checked_mul(0x100000)?
    } else if let Some(kibi) = text.strip_suffix('k') {
        parse_hex(kibi)?.checked_mul(0x400)?
    } else {
        parse_hex(text)?
    };
    if len == 0 || format_length(len) != text {
        return None;
    }
    Some(len)
}

fn is_lower_hex(text: &str) -> bool {
    !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Canonical lowercase hex: no leading zeros except the single digit `0`.
fn parse_hex(text: &str) -> Option<u64> {
    if !is_lower_hex(text) || text.len() > 16 {
        return None;
    }
    if text.len() > 1 && text.starts_with('0') {
        return None;
    }
    u64::from_str_radix(text, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: u64) -> ChunkName {
        ChunkName {
            rem: [
                0xca, 0xfe, 0xba, 0xbe, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88,
                0x99,
            ],
            len,
            collision: 0,
            link: 0,
            gzipped: false,
            corrupt: false,
        }
    }

    #[test]
    fn length_abbreviations() {
        assert_eq!(format_length(0x3e8), "3e8");
        assert_eq!(format_length(0x400), "1k");
        assert_eq!(format_length(0x1000), "4k");
        assert_eq!(format_length(0x10000), "40k");
        assert_eq!(format_length(0x100000), "1M");
        assert_eq!(format_length(0x100400), "401k");
        assert_eq!(format_length(0x200000), "2M");
        assert_eq!(format_length(7), "7");
    }

    #[test]
    fn lengths_parse_canonically() {
        for len in [1u64, 7, 0x3ff, 0x400, 0x401, 0x1000, 0x100000, 0x100400] {
            assert_eq!(parse_length(&format_length(len)), Some(len));
        }
        // Hex digits only; plain values are plain hex.
        assert_eq!(parse_length("1024"), Some(0x1024));
        // Non-canonical spellings are rejected.
        assert_eq!(parse_length("400k"), None); // canonical is 1M
        assert_eq!(parse_length("01"), None);
        assert_eq!(parse_length("0"), None);
        assert_eq!(parse_length("0M"), None);
        assert_eq!(parse_length("1K"), None);
    }

    #[test]
    fn names_round_trip() {
        for (gzipped, corrupt) in [(false, false), (true, false), (false, true), (true, true)] {
            let name = ChunkName {
                gzipped,
                corrupt,
                collision: 0x1f,
                link: 3,
                ..sample(0x1234)
            };
            let rendered = name.to_string();
            assert_eq!(ChunkName::parse(&rendered), Some(name));
        }
    }

    #[test]
    fn rendered_name_shape() {
        let name = ChunkName {
            gzipped: true,
            ..sample(0x1000)
        };
        assert_eq!(name.to_string(), "cafebabe00112233445566778899-4k-0-0.gz");
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert_eq!(ChunkName::parse("lock"), None);
        assert_eq!(ChunkName::parse(""), None);
        assert_eq!(ChunkName::parse("cafebabe00112233445566778899-4k-0"), None);
        assert_eq!(
            ChunkName::parse("cafebabe00112233445566778899-4k-0-0-0"),
            None
        );
        assert_eq!(
            ChunkName::parse("CAFEBABE00112233445566778899-4k-0-0"),
            None
        );
        assert_eq!(ChunkName::parse("cafebabe001122334455667788-4k-0-0"), None);
        assert_eq!(
            ChunkName::parse("cafebabe00112233445566778899-0-0-0"),
            None
        );
        assert_eq!(
            ChunkName::parse("cafebabe00112233445566778899-4k-00-0"),
            None
        );
        // Suffix order is fixed: .gz before .corrupt.
        assert_eq!(
            ChunkName::parse("cafebabe00112233445566778899-4k-0-0.corrupt.gz"),
            None
        );
    }

    #[test]
    fn hash_dir_names() {
        let mut digest = [0u8; 16];
        digest[0] = 0xab;
        digest[1] = 0x12;
        assert_eq!(hash_dir_name(&digest), "ab12");
        assert_eq!(parse_hash_dir("ab12"), Some(0xab12));
        assert_eq!(parse_hash_dir("AB12"), None);
        assert_eq!(parse_hash_dir("ab1"), None);
        assert_eq!(parse_hash_dir("lock"), None);
    }
}
