//! Block-gzip writer.
//!
//! Standard BGZF framing: gzip members of at most 64 KiB of payload with
//! the BC extra field carrying the compressed block size, a virtual-offset
//! scheme of (compressed offset << 16 | within-block offset), and an empty
//! terminal block as EOF marker. Any multi-member gzip reader can
//! decompress the output.

use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use md5::{Digest, Md5};

use crate::error::{AlignError, Result};

/// Maximum uncompressed payload per block; chosen so the compressed block
/// size always fits the 16-bit BSIZE field.
const BLOCK_PAYLOAD_MAX: usize = 65_280;

pub struct BgzfWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
    level: Compression,
    compressed_offset: u64,
    digest: Option<Md5>,
}

impl<W: Write> BgzfWriter<W> {
    pub fn new(inner: W, level: u32, with_digest: bool) -> BgzfWriter<W> {
        BgzfWriter {
            inner,
            buffer: Vec::with_capacity(BLOCK_PAYLOAD_MAX),
            level: Compression::new(level.min(9)),
            compressed_offset: 0,
            digest: with_digest.then(Md5::new),
        }
    }

    /// Current virtual position: compressed offset of the open block in
    /// the high 48 bits, offset within its payload in the low 16.
    pub fn virtual_position(&self) -> u64 {
        (self.compressed_offset << 16) | self.buffer.len() as u64
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        if let Some(digest) = &mut self.digest {
            digest.update(data);
        }
        while !data.is_empty() {
            let room = BLOCK_PAYLOAD_MAX - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == BLOCK_PAYLOAD_MAX {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let payload = std::mem::take(&mut self.buffer);

        let mut deflated = Vec::with_capacity(payload.len() / 2 + 64);
        let mut encoder = DeflateEncoder::new(&mut deflated, self.level);
        encoder
            .write_all(&payload)
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|e| AlignError::Resource {
                stage: "bgzf-compress",
                reason: e.to_string(),
            })?;

        let mut crc = Crc::new();
        crc.update(&payload);

        let block_size = 12 + 6 + deflated.len() + 8; // header + extra + data + trailer
        if block_size > u16::MAX as usize + 1 {
            return Err(AlignError::Assertion(format!(
                "bgzf block of {} bytes exceeds the format limit",
                block_size
            )));
        }

        let mut block = Vec::with_capacity(block_size);
        // gzip member header with FEXTRA
        block.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
        block.extend_from_slice(&6u16.to_le_bytes()); // XLEN
        block.extend_from_slice(b"BC");
        block.extend_from_slice(&2u16.to_le_bytes());
        block.extend_from_slice(&((block_size - 1) as u16).to_le_bytes());
        block.extend_from_slice(&deflated);
        block.extend_from_slice(&crc.sum().to_le_bytes());
        block.extend_from_slice(&(payload.len() as u32).to_le_bytes());

        self.inner.write_all(&block).map_err(|e| AlignError::Resource {
            stage: "bgzf-write",
            reason: e.to_string(),
        })?;
        self.compressed_offset += block.len() as u64;
        self.buffer.reserve(BLOCK_PAYLOAD_MAX);
        Ok(())
    }

    /// Flushes remaining payload, writes the EOF marker block and returns
    /// the MD5 digest of the uncompressed stream when one was requested.
    pub fn finish(mut self) -> Result<Option<String>> {
        if !self.buffer.is_empty() {
            self.flush_block()?;
        }
        self.flush_block()?; // empty block = EOF marker
        self.inner.flush().map_err(|e| AlignError::Resource {
            stage: "bgzf-write",
            reason: e.to_string(),
        })?;
        Ok(self.digest.take().map(|digest| {
            digest
                .finalize()
                .iter()
                .map(|byte| format!("{:02x}", byte))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    #[test]
    fn round_trips_through_a_gzip_reader() {
        let mut out = Vec::new();
        {
            let mut writer = BgzfWriter::new(&mut out, 6, false);
            writer.write_all(b"hello bgzf world\n").unwrap();
            writer.write_all(&vec![b'x'; 200_000]).unwrap();
            writer.finish().unwrap();
        }
        let mut decoder = MultiGzDecoder::new(&out[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(&decoded[..17], b"hello bgzf world\n");
        assert_eq!(decoded.len(), 17 + 200_000);
    }

    #[test]
    fn virtual_positions_advance_within_and_across_blocks() {
        let mut out = Vec::new();
        let mut writer = BgzfWriter::new(&mut out, 1, false);
        assert_eq!(writer.virtual_position(), 0);
        writer.write_all(b"abc").unwrap();
        assert_eq!(writer.virtual_position() & 0xffff, 3);
        writer.write_all(&vec![0u8; BLOCK_PAYLOAD_MAX]).unwrap();
        // one full block flushed, 3 bytes pending
        assert!(writer.virtual_position() >> 16 > 0);
        assert_eq!(writer.virtual_position() & 0xffff, 3);
        writer.finish().unwrap();
    }

    #[test]
    fn digest_matches_payload() {
        let mut out = Vec::new();
        let mut writer = BgzfWriter::new(&mut out, 6, true);
        writer.write_all(b"digest me").unwrap();
        let digest = writer.finish().unwrap().unwrap();
        let mut reference = Md5::new();
        reference.update(b"digest me");
        let expected: String = reference
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect();
        assert_eq!(digest, expected);
    }
}
