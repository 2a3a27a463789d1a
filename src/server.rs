//! Sync server (target role)
//!
//! Accepts exactly one connection, hashes the target file concurrently with
//! the accept, exchanges hashes with the source, then applies the incoming
//! block stream: literal blocks are written in place, holes are punched (or
//! zero-filled under preallocation), and the file is fsynced at end of
//! stream. Regular targets are truncated to the source size; device targets
//! keep their size and have the residual range deallocated.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpListener;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, trace};
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;

use crate::block_stream::{read_u64_le, BlockRecord, BlockStreamReader};
use crate::error::SyncError;
use crate::hasher::FileHasher;
use crate::protocol::valid_block_size;
use crate::sparse::punch_hole;
use crate::SyncOptions;

pub struct SyncServer {
    target_path: PathBuf,
    port: u16,
    opts: SyncOptions,
}

impl SyncServer {
    pub fn new(target_path: impl Into<PathBuf>, port: u16, opts: &SyncOptions) -> Self {
        SyncServer {
            target_path: target_path.into(),
            port,
            opts: opts.clone(),
        }
    }

    /// Serve one sync session to completion. Fails before touching the
    /// target when the configured block size is not a positive multiple of
    /// 4096.
    pub fn start(&self) -> Result<()> {
        if !valid_block_size(self.opts.block_size) {
            bail!(SyncError::InvalidBlockSize(self.opts.block_size));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(&self.target_path)
            .with_context(|| format!("open target file {}", self.target_path.display()))?;

        let block_size = self.opts.block_size;
        let hash_thread = thread::spawn({
            let path = self.target_path.clone();
            move || -> Result<FileHasher> {
                let mut hasher = FileHasher::new(block_size)?;
                hasher.hash_file(&path)?;
                Ok(hasher)
            }
        });

        info!("listening for tcp connection on port {}", self.port);
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .with_context(|| format!("bind port {}", self.port))?;
        let (mut conn, peer) = listener.accept()?;
        debug!("accepted connection from {}", peer);

        let hasher = hash_thread
            .join()
            .map_err(|_| anyhow!("hasher thread panicked"))??;
        let target_size = hasher.file_size();
        info!(
            "hashed {} ({} bytes)",
            self.target_path.display(),
            target_size
        );

        if hasher.compare_hash_of_hashes(&mut conn)? {
            info!("no differences found, exiting");
            return Ok(());
        }

        {
            let mut writer = FrameEncoder::new(&mut conn);
            hasher.serialize(&mut writer)?;
            writer.flush()?;
        }
        info!("wrote hashes to client, receiving blocks");

        let reader = FrameDecoder::new(&mut conn);
        self.write_blocks_to_file(&mut file, reader, target_size)?;

        file.sync_all()?;
        info!("target file synced");
        Ok(())
    }

    fn write_blocks_to_file<R: Read>(
        &self,
        file: &mut File,
        mut reader: R,
        target_size: u64,
    ) -> Result<()> {
        // No source size means the client found nothing to send.
        let source_size = match read_u64_le(&mut reader)? {
            Some(size) => size,
            None => {
                debug!("client sent no blocks");
                return Ok(());
            }
        };
        let logical_size =
            self.resize_target(file, source_size, target_size.max(source_size))?;

        let started = Instant::now();
        let block_size = self.opts.block_size;
        let mut stream = BlockStreamReader::new(reader, block_size);
        let mut records = 0u64;
        while let Some(record) = stream.next_record()? {
            match record {
                BlockRecord::Hole { offset } => {
                    self.apply_hole(file, offset, logical_size)?;
                }
                BlockRecord::Block { offset, data } => {
                    trace!("writing {} bytes at offset {}", data.len(), offset);
                    file.seek(SeekFrom::Start(offset))?;
                    file.write_all(data)?;
                }
            }
            records += 1;
        }
        debug!(
            "applied {} records in {} ms",
            records,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Size or deallocate the target for `source_size` bytes of content;
    /// returns the target's logical size after the adjustment.
    fn resize_target(&self, file: &File, source_size: u64, effective_size: u64) -> Result<u64> {
        let file_type = file.metadata()?.file_type();
        if file_type.is_block_device() || file_type.is_char_device() {
            if effective_size > source_size {
                debug!(
                    "deallocating device range [{}, {})",
                    source_size, effective_size
                );
                punch_hole(file, source_size, effective_size - source_size)?;
            }
            Ok(effective_size)
        } else {
            debug!("setting target file size to {}", source_size);
            file.set_len(source_size)?;
            Ok(source_size)
        }
    }

    fn apply_hole(&self, file: &mut File, offset: u64, logical_size: u64) -> Result<()> {
        let block_size = self.opts.block_size;
        if self.opts.preallocate {
            let len = block_size.min(logical_size.saturating_sub(offset));
            trace!("zero-filling {} bytes at offset {}", len, offset);
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&vec![0u8; len as usize])?;
        } else {
            trace!("punching hole at offset {}", offset);
            punch_hole(file, offset, block_size)?;
        }
        Ok(())
    }
}
