//! Big-endian wire primitives and the prefix-sharing path codec.

use std::io::{self, Read, Write};

use anyhow::{bail, Error};

use crate::protocol::{BUFFER_SIZE, PATH_SLOT_COUNT};

pub(crate) trait ReadExt: Read {
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_be_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_be_i16(&mut self) -> io::Result<i16> {
        Ok(self.read_be_u16()? as i16)
    }

    fn read_be_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_be_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_be_i64(&mut self) -> io::Result<i64> {
        Ok(self.read_be_u64()? as i64)
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

pub(crate) trait WriteExt: Write {
    fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_all(&[value])
    }

    fn write_be_u16(&mut self, value: u16) -> io::Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    fn write_be_i16(&mut self, value: i16) -> io::Result<()> {
        self.write_be_u16(value as u16)
    }

    fn write_be_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    fn write_be_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    fn write_be_i64(&mut self, value: i64) -> io::Result<()> {
        self.write_be_u64(value as u64)
    }

    fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_u8(value as u8)
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

pub(crate) fn read_bool(reader: &mut impl Read) -> Result<bool, Error> {
    match reader.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => bail!("invalid boolean value on stream: {}", other),
    }
}

/// Encoder half of the `compressed-UTF` path framing.
///
/// Each of the 64 slots remembers the last string written through it; a
/// new value is framed as the length of the byte prefix it shares with
/// that memory (capped at 255) plus the remaining suffix.
pub(crate) struct PathEncoder {
    slots: Vec<Vec<u8>>,
}

impl PathEncoder {
    pub fn new() -> Self {
        PathEncoder {
            slots: vec![Vec::new(); PATH_SLOT_COUNT],
        }
    }

    pub fn write(&mut self, writer: &mut impl Write, slot: u8, value: &str) -> Result<(), Error> {
        let bytes = value.as_bytes();
        let prev = &self.slots[slot as usize];
        let max = prev.len().min(bytes.len()).min(255);
        let mut shared = 0;
        while shared < max && prev[shared] == bytes[shared] {
            shared += 1;
        }
        let suffix = &bytes[shared..];
        if suffix.len() > u16::MAX as usize {
            bail!("path too long for wire format: {} bytes", bytes.len());
        }
        writer.write_u8(slot)?;
        writer.write_u8(shared as u8)?;
        writer.write_be_u16(suffix.len() as u16)?;
        writer.write_all(suffix)?;
        self.slots[slot as usize] = bytes.to_vec();
        Ok(())
    }
}

/// Decoder half of the `compressed-UTF` path framing.
pub(crate) struct PathDecoder {
    slots: Vec<Vec<u8>>,
}

impl PathDecoder {
    pub fn new() -> Self {
        PathDecoder {
            slots: vec![Vec::new(); PATH_SLOT_COUNT],
        }
    }

    pub fn read(&mut self, reader: &mut impl Read) -> Result<String, Error> {
        let slot = reader.read_u8()? as usize;
        if slot >= PATH_SLOT_COUNT {
            bail!("invalid path slot on stream: {}", slot);
        }
        let shared = reader.read_u8()? as usize;
        let suffix_len = reader.read_be_u16()? as usize;
        let prev = &self.slots[slot];
        if shared > prev.len() {
            bail!(
                "path prefix length {} exceeds remembered slot length {}",
                shared,
                prev.len()
            );
        }
        let mut bytes = Vec::with_capacity(shared + suffix_len);
        bytes.extend_from_slice(&prev[..shared]);
        let start = bytes.len();
        bytes.resize(start + suffix_len, 0);
        reader.read_exact(&mut bytes[start..])?;
        let value = String::from_utf8(bytes)
            .map_err(|_| anyhow::format_err!("path on stream is not valid UTF-8"))?;
        self.slots[slot] = value.as_bytes().to_vec();
        Ok(value)
    }
}

/// Streams the contents of `input` as repeated `(i16 count, count bytes)`
/// chunks terminated by a count of `-1`. Returns the number of content
/// bytes written.
pub(crate) fn write_file_data(
    input: &mut impl Read,
    writer: &mut impl Write,
    buffer: &mut [u8; BUFFER_SIZE],
) -> Result<u64, Error> {
    let mut total = 0u64;
    loop {
        let count = input.read(buffer)?;
        if count == 0 {
            break;
        }
        writer.write_be_i16(count as i16)?;
        writer.write_all(&buffer[..count])?;
        total += count as u64;
    }
    writer.write_be_i16(-1)?;
    Ok(total)
}

/// Consumes one file-data frame sequence, feeding the content bytes to
/// `output`. Counts above the write-side chunk size are legal (the limit
/// is `i16::MAX`), so large counts are drained through the buffer in
/// pieces.
pub(crate) fn read_file_data(
    reader: &mut impl Read,
    output: &mut impl Write,
    buffer: &mut [u8; BUFFER_SIZE],
) -> Result<u64, Error> {
    let mut total = 0u64;
    loop {
        let count = reader.read_be_i16()?;
        if count == -1 {
            break;
        }
        if count < 0 {
            bail!("invalid data chunk length on stream: {}", count);
        }
        let mut remaining = count as usize;
        while remaining > 0 {
            let take = remaining.min(buffer.len());
            reader.read_exact(&mut buffer[..take])?;
            output.write_all(&buffer[..take])?;
            remaining -= take;
        }
        total += count as u64;
    }
    Ok(total)
}

/// Reads and discards one file-data frame sequence.
pub(crate) fn skip_file_data(
    reader: &mut impl Read,
    buffer: &mut [u8; BUFFER_SIZE],
) -> Result<u64, Error> {
    read_file_data(reader, &mut io::sink(), buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(values: &[(u8, &str)]) {
        let mut encoder = PathEncoder::new();
        let mut buf = Vec::new();
        for (slot, value) in values {
            encoder.write(&mut buf, *slot, value).unwrap();
        }
        let mut decoder = PathDecoder::new();
        let mut cursor = io::Cursor::new(buf);
        for (_, value) in values {
            assert_eq!(decoder.read(&mut cursor).unwrap(), *value);
        }
    }

    #[test]
    fn path_codec_round_trips() {
        round_trip(&[
            (0, "/a"),
            (0, "/a/one"),
            (0, "/a/one/deeper"),
            (0, "/a/two"),
            (1, "/b/unrelated"),
            (0, "/a"),
            (63, "target with spaces"),
            (63, "target with späces and ünicode"),
        ]);
    }

    #[test]
    fn path_codec_shares_prefixes() {
        let mut encoder = PathEncoder::new();
        let mut buf = Vec::new();
        encoder.write(&mut buf, 0, "/common/base").unwrap();
        let before = buf.len();
        encoder.write(&mut buf, 0, "/common/base/child").unwrap();
        // slot + prefix + suffix length + "/child"
        assert_eq!(buf.len() - before, 4 + "/child".len());
    }

    #[test]
    fn path_codec_caps_prefix_at_255_bytes() {
        let long = format!("/{}", "x".repeat(300));
        let longer = format!("{}/y", long);
        round_trip(&[(0, &long), (0, &longer)]);
    }

    #[test]
    fn decoder_rejects_prefix_beyond_slot_memory() {
        let mut buf = Vec::new();
        buf.write_u8(0).unwrap();
        buf.write_u8(10).unwrap(); // slot 0 is empty, prefix of 10 is bogus
        buf.write_be_u16(0).unwrap();
        let mut decoder = PathDecoder::new();
        assert!(decoder.read(&mut io::Cursor::new(buf)).is_err());
    }

    #[test]
    fn file_data_round_trips_boundary_sizes() {
        for size in [0usize, 1, BUFFER_SIZE - 1, BUFFER_SIZE, 2 * BUFFER_SIZE, 10_000] {
            let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut frames = Vec::new();
            let mut buffer = [0u8; BUFFER_SIZE];
            write_file_data(&mut io::Cursor::new(&content), &mut frames, &mut buffer).unwrap();

            let mut out = Vec::new();
            let total =
                read_file_data(&mut io::Cursor::new(&frames), &mut out, &mut buffer).unwrap();
            assert_eq!(out, content);
            assert_eq!(total, size as u64);
        }
    }

    #[test]
    fn zero_length_file_is_a_lone_terminator() {
        let mut frames = Vec::new();
        let mut buffer = [0u8; BUFFER_SIZE];
        write_file_data(&mut io::Cursor::new(&[][..]), &mut frames, &mut buffer).unwrap();
        assert_eq!(frames, (-1i16).to_be_bytes());
    }

    #[test]
    fn reader_accepts_max_count_chunks() {
        let size = i16::MAX as usize;
        let content: Vec<u8> = (0..size).map(|i| (i % 199) as u8).collect();
        let mut frames = Vec::new();
        frames.write_be_i16(i16::MAX).unwrap();
        frames.extend_from_slice(&content);
        frames.write_be_i16(-1).unwrap();

        let mut out = Vec::new();
        let mut buffer = [0u8; BUFFER_SIZE];
        read_file_data(&mut io::Cursor::new(&frames), &mut out, &mut buffer).unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn reader_rejects_negative_counts_other_than_terminator() {
        let mut frames = Vec::new();
        frames.write_be_i16(-2).unwrap();
        let mut buffer = [0u8; BUFFER_SIZE];
        assert!(skip_file_data(&mut io::Cursor::new(&frames), &mut buffer).is_err());
    }
}
