//! Sync client (source role)
//!
//! Drives the protocol from the source side: hash the source file, run the
//! hash-of-hashes short-circuit, receive the target's hash map, compute the
//! diff, then stream the changed blocks (holes elided) to the target.
//!
//! Phase 1 (hash-of-hashes) runs on the raw connection; the Snappy framed
//! streams begin with the hash-map transfer.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info, trace};
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;

use crate::block_stream::{write_block_record, write_hole_record};
use crate::error::SyncError;
use crate::hasher::FileHasher;
use crate::progress::Progress;
use crate::protocol::retry;
use crate::SyncOptions;

/// A bidirectional byte stream to the peer.
pub trait Stream: Read + Write + Send {}
impl<T: Read + Write + Send> Stream for T {}

impl std::fmt::Debug for dyn Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Stream")
    }
}

/// Seam between the client and its transport; tests substitute their own.
pub trait ConnectionProvider: Send {
    fn connect(&self) -> Result<Box<dyn Stream>>;
    fn target_address(&self) -> String;
}

/// Dials the target over TCP with a bounded retry budget.
pub struct TcpConnectionProvider {
    address: String,
    port: u16,
    attempts: u32,
    interval: Duration,
}

impl TcpConnectionProvider {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self::with_retry(address, port, retry::SYNC_ATTEMPTS, retry::SYNC_INTERVAL)
    }

    pub fn with_retry(
        address: impl Into<String>,
        port: u16,
        attempts: u32,
        interval: Duration,
    ) -> Self {
        TcpConnectionProvider {
            address: address.into(),
            port,
            attempts,
            interval,
        }
    }
}

impl ConnectionProvider for TcpConnectionProvider {
    fn connect(&self) -> Result<Box<dyn Stream>> {
        let mut retries = 0;
        loop {
            match TcpStream::connect((self.address.as_str(), self.port)) {
                Ok(conn) => return Ok(Box::new(conn)),
                Err(e) => {
                    if retries >= self.attempts {
                        bail!(SyncError::Unreachable {
                            address: self.target_address(),
                            retries,
                        });
                    }
                    debug!("dial {} failed ({}), retrying", self.target_address(), e);
                    thread::sleep(self.interval);
                    retries += 1;
                }
            }
        }
    }

    fn target_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

pub struct SyncClient {
    source_path: PathBuf,
    hasher: FileHasher,
    source_size: u64,
    provider: Box<dyn ConnectionProvider>,
    zero_block: Vec<u8>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("source_path", &self.source_path)
            .field("hasher", &self.hasher)
            .field("source_size", &self.source_size)
            .field("zero_block_len", &self.zero_block.len())
            .finish()
    }
}

impl SyncClient {
    /// Fails on a block size the protocol disallows.
    pub fn new(
        source_path: impl Into<PathBuf>,
        target_address: &str,
        port: u16,
        opts: &SyncOptions,
    ) -> Result<Self> {
        Self::with_provider(
            source_path,
            Box::new(TcpConnectionProvider::new(target_address, port)),
            opts,
        )
    }

    pub fn with_provider(
        source_path: impl Into<PathBuf>,
        provider: Box<dyn ConnectionProvider>,
        opts: &SyncOptions,
    ) -> Result<Self> {
        Ok(SyncClient {
            source_path: source_path.into(),
            hasher: FileHasher::new(opts.block_size)?,
            source_size: 0,
            provider,
            zero_block: vec![0u8; opts.block_size as usize],
        })
    }

    /// Run one full sync against the target. Returns once the target has
    /// everything it needs (or already had it).
    pub fn connect_to_target(&mut self) -> Result<()> {
        let file = File::open(&self.source_path)
            .with_context(|| format!("open source file {}", self.source_path.display()))?;
        info!("opened file {}", self.source_path.display());

        debug!("connecting to target {}", self.provider.target_address());
        let mut conn = self.provider.connect()?;
        info!("connected to target, hashing source file");
        self.source_size = self.hasher.hash_file(&self.source_path)?;
        debug!(
            "hashed {} ({} bytes)",
            self.source_path.display(),
            self.source_size
        );

        if self.hasher.compare_hash_of_hashes(&mut conn)? {
            info!("no differences found, exiting");
            return Ok(());
        }

        let (peer_block_size, peer_hashes) = {
            let mut reader = FrameDecoder::new(&mut conn);
            FileHasher::deserialize(&mut reader)?
        };
        let mut diff = self.hasher.diff_hashes(peer_block_size, peer_hashes)?;
        if diff.is_empty() {
            info!("no differences found");
            return Ok(());
        }
        info!("differences found, count {}", diff.len());
        diff.sort_unstable();

        let mut writer = FrameEncoder::new(&mut conn);
        let mut progress = Progress::new("sync progress");
        self.write_blocks(&mut writer, &diff, &file, &mut progress)?;
        writer.flush()?;
        Ok(())
    }

    /// Send `source_size` then one record per offset: HOLE for all-zero
    /// blocks, BLOCK with the bytes actually read otherwise (short at EOF).
    fn write_blocks<W: Write>(
        &mut self,
        writer: &mut W,
        offsets: &[u64],
        file: &File,
        progress: &mut Progress,
    ) -> Result<()> {
        debug!("writing blocks to server");
        let started = Instant::now();

        writer.write_all(&self.source_size.to_le_bytes())?;
        let block_size = self.hasher.block_size();
        progress.start(offsets.len() as u64 * block_size);

        let mut buf = vec![0u8; block_size as usize];
        for (i, &offset) in offsets.iter().enumerate() {
            let n = read_block_at(file, &mut buf, offset)?;
            if n == buf.len() && buf == self.zero_block {
                trace!("skipping empty block at offset {}", offset);
                write_hole_record(writer, offset)?;
            } else {
                trace!("sending {} bytes at offset {}", n, offset);
                write_block_record(writer, offset, &buf[..n])?;
            }
            progress.update(i as u64 * block_size);
        }
        progress.update(offsets.len() as u64 * block_size);

        debug!("writing blocks took {} ms", started.elapsed().as_millis());
        Ok(())
    }
}

/// Read up to a full block at `offset`; fewer bytes only at end of file.
fn read_block_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match file.read_at(&mut buf[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}
