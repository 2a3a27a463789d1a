//! Block framing codec
//!
//! Wire grammar of the block stream (all integers little-endian, carried
//! inside the Snappy framed channel):
//!
//! ```text
//! blockstream := source_size:u64  record*
//! record      := offset:u64  kind:u8  payload
//! payload     := <empty>      when kind == HOLE
//!              | bytes[B]     when kind == BLOCK (short on the last block)
//! ```
//!
//! The decoder tolerates EOF anywhere: a clean or partial EOF before the
//! payload ends the stream (partial fields discarded), while EOF inside a
//! payload delivers the bytes read so far as a short final block. Only
//! non-EOF I/O errors and unknown kind bytes are fatal.

use std::io::{ErrorKind, Read, Write};

use anyhow::{bail, Result};
use log::debug;

use crate::error::SyncError;
use crate::protocol::{BLOCK, HOLE};

/// One decoded record; `data` borrows the reader's reusable block buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockRecord<'a> {
    Hole { offset: u64 },
    Block { offset: u64, data: &'a [u8] },
}

impl BlockRecord<'_> {
    pub fn offset(&self) -> u64 {
        match self {
            BlockRecord::Hole { offset } => *offset,
            BlockRecord::Block { offset, .. } => *offset,
        }
    }
}

pub fn write_hole_record<W: Write>(writer: &mut W, offset: u64) -> Result<()> {
    writer.write_all(&offset.to_le_bytes())?;
    writer.write_all(&[HOLE])?;
    Ok(())
}

pub fn write_block_record<W: Write>(writer: &mut W, offset: u64, data: &[u8]) -> Result<()> {
    writer.write_all(&offset.to_le_bytes())?;
    writer.write_all(&[BLOCK])?;
    writer.write_all(data)?;
    Ok(())
}

/// Streaming decoder for block records.
pub struct BlockStreamReader<R> {
    source: R,
    buf: Vec<u8>,
}

impl<R: Read> BlockStreamReader<R> {
    pub fn new(source: R, block_size: u64) -> Self {
        BlockStreamReader {
            source,
            buf: vec![0u8; block_size as usize],
        }
    }

    /// Decode the next record, or `None` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<BlockRecord<'_>>> {
        let offset = match read_u64_le(&mut self.source)? {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let mut kind = [0u8; 1];
        if !fill(&mut self.source, &mut kind)? {
            debug!("stream ended before record kind, offset {}", offset);
            return Ok(None);
        }
        match kind[0] {
            HOLE => Ok(Some(BlockRecord::Hole { offset })),
            BLOCK => {
                let block_size = self.buf.len();
                let n = read_up_to(&mut self.source, &mut self.buf)?;
                if n < block_size {
                    debug!("short final block: {} of {} bytes", n, block_size);
                }
                Ok(Some(BlockRecord::Block {
                    offset,
                    data: &self.buf[..n],
                }))
            }
            other => bail!(SyncError::Protocol(format!(
                "unknown block record kind {other}"
            ))),
        }
    }
}

/// Read a little-endian u64, or `None` on clean or partial EOF.
pub(crate) fn read_u64_le<R: Read>(reader: &mut R) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    if !fill(reader, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

/// Fill `buf` completely. Returns false if EOF interrupts (even mid-buffer);
/// `ErrorKind::UnexpectedEof` from a decompressor counts as EOF.
pub(crate) fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => return Ok(false),
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read until `buf` is full or EOF; returns the byte count.
pub(crate) fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}
