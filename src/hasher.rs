//! Concurrent per-block file hashing and hash-map exchange
//!
//! A file is tiled into `block_size` blocks from offset 0 (the last block may
//! be short) and each block is digested with BLAKE2b-512. Hashing fans out
//! over worker threads fed by a bounded offset queue; each worker owns its
//! own file handle and hasher state. The resulting offset -> digest map can
//! be serialized (offset-ascending), diffed against a peer's map, and
//! summarized into a single hash-of-hashes for a cheap equality check.

use std::cmp;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use blake2::{Blake2b512, Digest};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, trace};

use crate::block_stream::{fill, read_u64_le};
use crate::error::SyncError;
use crate::protocol::{valid_block_size, HASH_LENGTH};

/// BLAKE2b-512 digest of one block.
pub type BlockDigest = [u8; HASH_LENGTH];

/// Offset-keyed digests for one file.
pub type OffsetHashes = HashMap<u64, BlockDigest>;

const MAX_WORKERS: usize = 25;
const QUEUE_DEPTH: usize = 25;

#[derive(Debug)]
pub struct FileHasher {
    hashes: OffsetHashes,
    block_size: u64,
    file_size: u64,
}

impl FileHasher {
    /// Rejects block sizes the protocol disallows; every consumer of the
    /// hasher relies on a positive multiple of 4096.
    pub fn new(block_size: u64) -> Result<Self> {
        if !valid_block_size(block_size) {
            bail!(SyncError::InvalidBlockSize(block_size));
        }
        Ok(FileHasher {
            hashes: OffsetHashes::new(),
            block_size,
            file_size: 0,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Size of the file hashed by the last `hash_file` call.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn hashes(&self) -> &OffsetHashes {
        &self.hashes
    }

    /// Hash every block of `path` and return the file size.
    ///
    /// Work is distributed over `min(25, size / block_size)` workers (at
    /// least one for a non-empty file); any worker error fails the whole
    /// call rather than leaving the map silently incomplete.
    pub fn hash_file(&mut self, path: &Path) -> Result<u64> {
        debug!("hashing file {}", path.display());
        let started = Instant::now();

        self.file_size = std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        self.hashes.clear();

        let workers = worker_count(self.file_size, self.block_size);
        if workers == 0 {
            return Ok(self.file_size);
        }

        let file_size = self.file_size;
        let block_size = self.block_size;
        let (offset_tx, offset_rx) = bounded::<u64>(QUEUE_DEPTH);
        let (result_tx, result_rx) = bounded::<(u64, BlockDigest)>(QUEUE_DEPTH);

        thread::scope(|scope| -> Result<()> {
            let dispatcher = scope.spawn(move || {
                let mut offset = 0;
                while offset < file_size {
                    // send fails only once every worker is gone
                    if offset_tx.send(offset).is_err() {
                        return;
                    }
                    offset += block_size;
                }
            });

            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let offsets = offset_rx.clone();
                let results = result_tx.clone();
                handles.push(
                    scope.spawn(move || hash_worker(path, block_size, offsets, results)),
                );
            }
            drop(offset_rx);
            drop(result_tx);

            for (offset, digest) in result_rx.iter() {
                self.hashes.insert(offset, digest);
            }

            for handle in handles {
                handle
                    .join()
                    .map_err(|_| anyhow!("hash worker panicked"))??;
            }
            dispatcher
                .join()
                .map_err(|_| anyhow!("offset dispatcher panicked"))?;
            Ok(())
        })?;

        debug!(
            "hashed {} blocks in {} ms",
            self.hashes.len(),
            started.elapsed().as_millis()
        );
        Ok(self.file_size)
    }

    /// Offsets this side must send so the peer converges on our content.
    ///
    /// Includes every local block the peer lacks or disagrees on, plus any
    /// peer block below our file size with no local counterpart (stale
    /// content the target must overwrite or punch). The result is unsorted.
    pub fn diff_hashes(&self, peer_block_size: u64, mut peer: OffsetHashes) -> Result<Vec<u64>> {
        if peer_block_size != self.block_size {
            bail!(SyncError::BlockSizeMismatch {
                local: self.block_size,
                peer: peer_block_size,
            });
        }
        debug!(
            "diffing {} local against {} peer hashes",
            self.hashes.len(),
            peer.len()
        );
        let mut diff = Vec::new();
        for (offset, digest) in &self.hashes {
            match peer.remove(offset) {
                None => diff.push(*offset),
                Some(other) if other != *digest => diff.push(*offset),
                Some(_) => {}
            }
        }
        for offset in peer.into_keys() {
            if offset < self.file_size {
                diff.push(offset);
            }
        }
        Ok(diff)
    }

    /// Write `block_size`, the entry count, then each `(offset, digest)` in
    /// ascending offset order. All integers little-endian.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        let started = Instant::now();
        writer.write_all(&self.block_size.to_le_bytes())?;
        writer.write_all(&(self.hashes.len() as u64).to_le_bytes())?;
        let mut offsets: Vec<u64> = self.hashes.keys().copied().collect();
        offsets.sort_unstable();
        for offset in offsets {
            trace!("writing offset {}", offset);
            writer.write_all(&offset.to_le_bytes())?;
            writer.write_all(&self.hashes[&offset])?;
        }
        debug!("serialized hashes in {} ms", started.elapsed().as_millis());
        Ok(())
    }

    /// Inverse of [`serialize`](Self::serialize); validates offsets against
    /// the advertised entry count and block size.
    pub fn deserialize<R: Read>(reader: &mut R) -> Result<(u64, OffsetHashes)> {
        let started = Instant::now();
        let block_size = read_u64_le(reader)?
            .ok_or_else(|| SyncError::Protocol("hash stream ended before block size".into()))?;
        let count = read_u64_le(reader)?
            .ok_or_else(|| SyncError::Protocol("hash stream ended before entry count".into()))?;
        debug!("receiving {} hashes", count);

        let mut hashes = OffsetHashes::new();
        for _ in 0..count {
            let offset = read_u64_le(reader)?
                .ok_or_else(|| SyncError::Protocol("hash stream ended mid-entry".into()))?;
            if offset > count.saturating_mul(block_size) {
                bail!(SyncError::Protocol(format!("invalid offset {offset}")));
            }
            let mut digest: BlockDigest = [0u8; HASH_LENGTH];
            if !fill(reader, &mut digest)? {
                bail!(SyncError::Protocol(format!(
                    "hash stream ended mid-digest at offset {offset}"
                )));
            }
            hashes.insert(offset, digest);
        }
        debug!(
            "deserialized {} hashes in {} ms",
            hashes.len(),
            started.elapsed().as_millis()
        );
        Ok((block_size, hashes))
    }

    /// Exchange a digest of the serialized hash map with the peer over the
    /// raw (uncompressed) connection; both sides send first, then read.
    /// Returns true when the maps are identical and the sync can end here.
    pub fn compare_hash_of_hashes<S: Read + Write>(&self, conn: &mut S) -> Result<bool> {
        let mut summary = Blake2b512::new();
        self.serialize(&mut summary)?;
        let mut local: BlockDigest = [0u8; HASH_LENGTH];
        local.copy_from_slice(&summary.finalize());

        conn.write_all(&local)?;
        conn.flush()?;
        let mut peer: BlockDigest = [0u8; HASH_LENGTH];
        conn.read_exact(&mut peer)
            .context("reading peer hash of hashes")?;
        Ok(local == peer)
    }
}

fn worker_count(file_size: u64, block_size: u64) -> usize {
    if file_size == 0 {
        return 0;
    }
    cmp::max(1, cmp::min(MAX_WORKERS, (file_size / block_size) as usize))
}

fn hash_worker(
    path: &Path,
    block_size: u64,
    offsets: Receiver<u64>,
    results: Sender<(u64, BlockDigest)>,
) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = Blake2b512::new();
    let mut buf = vec![0u8; block_size as usize];
    for offset in offsets {
        file.seek(SeekFrom::Start(offset))?;
        let n = read_block(&mut file, &mut buf)?;
        hasher.update(&buf[..n]);
        let mut digest: BlockDigest = [0u8; HASH_LENGTH];
        digest.copy_from_slice(&hasher.finalize_reset());
        if results.send((offset, digest)).is_err() {
            break;
        }
    }
    Ok(())
}

/// Read up to a full block; fewer bytes only at end of file.
fn read_block(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_BLOCK_SIZE;
    use std::io::Cursor;
    use std::io::Write as _;

    fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn rejects_invalid_block_size() {
        for bad in [0, 2, 4095, 6000] {
            let err = FileHasher::new(bad).unwrap_err();
            assert_eq!(
                err.downcast_ref::<SyncError>(),
                Some(&SyncError::InvalidBlockSize(bad)),
                "block size {bad}"
            );
        }
    }

    #[test]
    fn worker_count_follows_size_ratio() {
        assert_eq!(worker_count(46_137_344, 4096), MAX_WORKERS);
        assert_eq!(worker_count(4096, 4096), 1);
        assert_eq!(worker_count(40_960, 4096), 10);
        assert_eq!(worker_count(0, 4096), 0);
        // a non-empty file smaller than one block still gets a worker
        assert_eq!(worker_count(100, 4096), 1);
    }

    #[test]
    fn hashes_every_block_including_short_tail() {
        let data = patterned(4096 * 3 + 100);
        let file = write_temp(&data);
        let mut hasher = FileHasher::new(4096).unwrap();
        let size = hasher.hash_file(file.path()).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(hasher.hashes().len(), 4);

        // digests match a straight single-threaded computation
        for (i, chunk) in data.chunks(4096).enumerate() {
            let mut expect = Blake2b512::new();
            expect.update(chunk);
            let offset = (i * 4096) as u64;
            assert_eq!(
                hasher.hashes()[&offset][..],
                expect.finalize()[..],
                "offset {offset}"
            );
        }
    }

    #[test]
    fn empty_file_hashes_to_empty_map() {
        let file = write_temp(&[]);
        let mut hasher = FileHasher::new(4096).unwrap();
        assert_eq!(hasher.hash_file(file.path()).unwrap(), 0);
        assert!(hasher.hashes().is_empty());
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut hasher = FileHasher::new(4096).unwrap();
        assert!(hasher.hash_file(Path::new("/no/such/file")).is_err());
    }

    #[test]
    fn serialize_roundtrip_and_length_law() {
        let data = patterned(4096 * 5);
        let file = write_temp(&data);
        let mut hasher = FileHasher::new(4096).unwrap();
        hasher.hash_file(file.path()).unwrap();

        let mut wire = Vec::new();
        hasher.serialize(&mut wire).unwrap();
        // 16 bytes of header plus 72 per entry
        assert_eq!(wire.len(), 16 + 72 * hasher.hashes().len());

        let (block_size, hashes) = FileHasher::deserialize(&mut Cursor::new(wire)).unwrap();
        assert_eq!(block_size, 4096);
        assert_eq!(&hashes, hasher.hashes());
    }

    #[test]
    fn serialized_offsets_are_ascending() {
        let data = patterned(4096 * 30);
        let file = write_temp(&data);
        let mut hasher = FileHasher::new(4096).unwrap();
        hasher.hash_file(file.path()).unwrap();

        let mut wire = Vec::new();
        hasher.serialize(&mut wire).unwrap();
        let mut prev = None;
        for entry in wire[16..].chunks(72) {
            let offset = u64::from_le_bytes(entry[..8].try_into().unwrap());
            if let Some(p) = prev {
                assert!(offset > p);
            }
            prev = Some(offset);
        }
    }

    #[test]
    fn deserialize_rejects_out_of_range_offset() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&4096u64.to_le_bytes());
        wire.extend_from_slice(&1u64.to_le_bytes());
        wire.extend_from_slice(&(2 * 4096u64).to_le_bytes()); // beyond count * block_size
        wire.extend_from_slice(&[0u8; HASH_LENGTH]);
        let err = FileHasher::deserialize(&mut Cursor::new(wire)).unwrap_err();
        assert!(err.to_string().contains("invalid offset"));
    }

    #[test]
    fn deserialize_rejects_truncated_digest() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&4096u64.to_le_bytes());
        wire.extend_from_slice(&1u64.to_le_bytes());
        wire.extend_from_slice(&0u64.to_le_bytes());
        wire.extend_from_slice(&[0u8; 10]); // short digest
        let err = FileHasher::deserialize(&mut Cursor::new(wire)).unwrap_err();
        assert!(err.to_string().contains("mid-digest"));
    }

    fn hashed(data: &[u8]) -> FileHasher {
        let file = write_temp(data);
        let mut hasher = FileHasher::new(4096).unwrap();
        hasher.hash_file(file.path()).unwrap();
        hasher
    }

    #[test]
    fn diff_identical_maps_is_empty() {
        let data = patterned(4096 * 4);
        let hasher = hashed(&data);
        let diff = hasher.diff_hashes(4096, hasher.hashes().clone()).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn diff_detects_modified_block() {
        let data = patterned(4096 * 4);
        let hasher = hashed(&data);
        let mut peer = hasher.hashes().clone();
        peer.get_mut(&0).unwrap()[0] ^= 0xff;
        let diff = hasher.diff_hashes(4096, peer).unwrap();
        assert_eq!(diff, vec![0]);
    }

    #[test]
    fn diff_detects_block_missing_on_peer() {
        let data = patterned(4096 * 4);
        let hasher = hashed(&data);
        let mut peer = hasher.hashes().clone();
        peer.remove(&0);
        let diff = hasher.diff_hashes(4096, peer).unwrap();
        assert_eq!(diff, vec![0]);
    }

    #[test]
    fn diff_strips_peer_blocks_beyond_source_size() {
        let data = patterned(4096 * 4);
        let hasher = hashed(&data);
        let mut peer = hasher.hashes().clone();
        peer.insert(4096 * 1000, [7u8; HASH_LENGTH]);
        let diff = hasher.diff_hashes(4096, peer).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn diff_includes_stale_peer_blocks_below_source_size() {
        let data = patterned(4096 * 4);
        let peer = hashed(&data).hashes().clone();
        // the source never materialized block 4096 but the peer has content there
        let mut sparse = hashed(&data);
        sparse.hashes.remove(&4096);
        let diff = sparse.diff_hashes(4096, peer).unwrap();
        assert_eq!(diff, vec![4096]);
    }

    #[test]
    fn diff_rejects_mismatched_block_size() {
        let data = patterned(4096 * 2);
        let hasher = hashed(&data);
        let err = hasher.diff_hashes(8192, OffsetHashes::new()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SyncError>(),
            Some(&SyncError::BlockSizeMismatch {
                local: 4096,
                peer: 8192
            })
        );
    }

    #[test]
    fn hash_of_hashes_matches_for_identical_maps() {
        use std::net::{TcpListener, TcpStream};

        let data = patterned((DEFAULT_BLOCK_SIZE * 2) as usize);
        let a = hashed(&data);
        let b = hashed(&data);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            b.compare_hash_of_hashes(&mut conn)
        });
        let mut conn = TcpStream::connect(addr).unwrap();
        assert!(a.compare_hash_of_hashes(&mut conn).unwrap());
        assert!(join.join().unwrap().unwrap());
    }

    #[test]
    fn hash_of_hashes_differs_for_different_maps() {
        use std::net::{TcpListener, TcpStream};

        let a = hashed(&patterned(4096 * 2));
        let b = hashed(&patterned(4096 * 3));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            b.compare_hash_of_hashes(&mut conn)
        });
        let mut conn = TcpStream::connect(addr).unwrap();
        assert!(!a.compare_hash_of_hashes(&mut conn).unwrap());
        assert!(!join.join().unwrap().unwrap());
    }
}
